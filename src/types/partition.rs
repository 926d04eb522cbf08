//! Partition model and the well-known partition set of a deployment.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::constants;
use crate::types::image::{Image, ImageSource};
use crate::types::state::InstallState;

/// Filesystem kinds the engine knows how to create and mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Ext2,
    #[default]
    Ext4,
    Vfat,
    Btrfs,
    Squashfs,
    /// No filesystem at all, e.g. the raw BIOS boot slot.
    Raw,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext4 => "ext4",
            FsKind::Vfat => "vfat",
            FsKind::Btrfs => "btrfs",
            FsKind::Squashfs => "squashfs",
            FsKind::Raw => "raw",
        };
        f.write_str(s)
    }
}

impl FromStr for FsKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ext2" => Ok(FsKind::Ext2),
            "ext4" => Ok(FsKind::Ext4),
            "vfat" | "fat32" => Ok(FsKind::Vfat),
            "btrfs" => Ok(FsKind::Btrfs),
            "squashfs" => Ok(FsKind::Squashfs),
            "" | "raw" => Ok(FsKind::Raw),
            other => bail!("unknown filesystem kind: {}", other),
        }
    }
}

/// A partition with its configurable values. Sizes are in MiB; a size of
/// zero means grow to fill the remaining disk space.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Partition {
    /// Stable lookup key (`p.state`, `p.oem`, ...), independent of labels.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "label", default, skip_serializing_if = "String::is_empty")]
    pub filesystem_label: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub fs: FsKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
    #[serde(skip)]
    pub mount_point: Option<PathBuf>,
    /// Device node once the partition exists on disk.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    pub disk: String,
}

impl Partition {
    /// Project this partition into an image descriptor with an empty source.
    /// No back reference is kept.
    pub fn to_image(&self) -> Image {
        Image {
            file: self.path.clone().unwrap_or_default(),
            label: self.filesystem_label.clone(),
            size: self.size,
            fs: self.fs,
            source: ImageSource::Empty,
            mount_point: self.mount_point.clone(),
            loop_device: None,
        }
    }
}

/// Flat list of partitions, e.g. as discovered from the host.
pub type PartitionList = Vec<Partition>;

/// Find a partition by name, preferring entries that carry a mountpoint.
pub fn by_name<'a>(list: &'a [Partition], name: &str) -> Option<&'a Partition> {
    let mut found = None;
    for p in list.iter().filter(|p| p.name == name) {
        if p.mount_point.is_some() {
            return Some(p);
        }
        found.get_or_insert(p);
    }
    found
}

/// Find a partition by filesystem label, preferring mounted entries.
pub fn by_label<'a>(list: &'a [Partition], label: &str) -> Option<&'a Partition> {
    let mut found = None;
    for p in list.iter().filter(|p| p.filesystem_label == label) {
        if p.mount_point.is_some() {
            return Some(p);
        }
        found.get_or_insert(p);
    }
    found
}

/// Find a partition by name first, by label second.
pub fn by_name_or_label<'a>(
    list: &'a [Partition],
    name: &str,
    label: &str,
) -> Option<&'a Partition> {
    by_name(list, name).or_else(|| by_label(list, label))
}

/// The well-known partition set of a deployment. Any slot may be absent;
/// which of BIOS/Boot is present is a function of firmware and table kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ElementalPartitions {
    #[serde(skip)]
    pub bios: Option<Partition>,
    #[serde(rename = "bootloader", default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oem: Option<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Partition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<Partition>,
}

impl ElementalPartitions {
    /// The default on-disk layout for a fresh install.
    pub fn default_layout() -> Self {
        Self {
            bios: None,
            boot: Some(Partition {
                name: constants::BOOT_PART_NAME.to_string(),
                filesystem_label: constants::EFI_LABEL.to_string(),
                size: constants::EFI_SIZE,
                fs: FsKind::Vfat,
                flags: vec!["esp".to_string()],
                mount_point: Some(PathBuf::from(constants::EFI_DIR)),
                ..Default::default()
            }),
            oem: Some(Partition {
                name: constants::OEM_PART_NAME.to_string(),
                filesystem_label: constants::OEM_LABEL.to_string(),
                size: constants::OEM_SIZE,
                fs: FsKind::Ext4,
                mount_point: Some(PathBuf::from(constants::OEM_DIR)),
                ..Default::default()
            }),
            recovery: Some(Partition {
                name: constants::RECOVERY_PART_NAME.to_string(),
                filesystem_label: constants::RECOVERY_LABEL.to_string(),
                size: constants::RECOVERY_SIZE,
                fs: FsKind::Ext4,
                mount_point: Some(PathBuf::from(constants::RECOVERY_DIR)),
                ..Default::default()
            }),
            state: Some(Partition {
                name: constants::STATE_PART_NAME.to_string(),
                filesystem_label: constants::STATE_LABEL.to_string(),
                size: constants::STATE_SIZE,
                fs: FsKind::Ext4,
                mount_point: Some(PathBuf::from(constants::STATE_DIR)),
                ..Default::default()
            }),
            persistent: Some(Partition {
                name: constants::PERSISTENT_PART_NAME.to_string(),
                filesystem_label: constants::PERSISTENT_LABEL.to_string(),
                size: constants::PERSISTENT_SIZE,
                fs: FsKind::Ext4,
                mount_point: Some(PathBuf::from(constants::PERSISTENT_DIR)),
                ..Default::default()
            }),
        }
    }

    /// Fill in the stable names and default mountpoints of deserialized
    /// slots. Layout files only carry label/size/fs/flags.
    pub fn normalize(&mut self) {
        let defaults = [
            (constants::BOOT_PART_NAME, constants::EFI_DIR),
            (constants::OEM_PART_NAME, constants::OEM_DIR),
            (constants::RECOVERY_PART_NAME, constants::RECOVERY_DIR),
            (constants::STATE_PART_NAME, constants::STATE_DIR),
            (constants::PERSISTENT_PART_NAME, constants::PERSISTENT_DIR),
        ];
        for (name, mnt) in defaults {
            if let Some(p) = self.get_mut(name) {
                p.name = name.to_string();
                if p.mount_point.is_none() {
                    p.mount_point = Some(PathBuf::from(mnt));
                }
            }
        }
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut Option<Partition>> {
        match name {
            constants::BIOS_PART_NAME => Some(&mut self.bios),
            constants::BOOT_PART_NAME => Some(&mut self.boot),
            constants::OEM_PART_NAME => Some(&mut self.oem),
            constants::RECOVERY_PART_NAME => Some(&mut self.recovery),
            constants::STATE_PART_NAME => Some(&mut self.state),
            constants::PERSISTENT_PART_NAME => Some(&mut self.persistent),
            _ => None,
        }
    }

    /// Mutable access to a slot by its stable name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Partition> {
        self.slot_mut(name).and_then(|slot| slot.as_mut())
    }

    /// The path, usually a mountpoint, of the configuration partition.
    pub fn config_storage(&self) -> Option<PathBuf> {
        self.oem.as_ref().and_then(|p| p.mount_point.clone())
    }

    /// Enforce the firmware partition invariant: exactly one of BIOS, Boot
    /// or none is set, determined by firmware and partition table kind.
    pub fn set_firmware_partitions(&mut self, firmware: Firmware, table: PartTable) -> Result<()> {
        match (firmware, table) {
            (Firmware::Efi, PartTable::Gpt) => {
                if self.boot.is_none() {
                    bail!("nil efi partition");
                }
                self.bios = None;
            }
            (Firmware::Bios, PartTable::Gpt) => {
                self.bios = Some(Partition {
                    name: constants::BIOS_PART_NAME.to_string(),
                    filesystem_label: String::new(),
                    size: constants::BIOS_SIZE,
                    fs: FsKind::Raw,
                    flags: vec!["bios_grub".to_string()],
                    ..Default::default()
                });
                self.boot = None;
            }
            (_, PartTable::Msdos) => {
                let state = match self.state.as_mut() {
                    Some(s) => s,
                    None => bail!("nil state partition"),
                };
                state.flags = vec!["boot".to_string()];
                self.boot = None;
                self.bios = None;
            }
        }
        Ok(())
    }

    /// Partitions in install order: BIOS, Boot, OEM, Recovery, State,
    /// Persistent, then extras. The single grow-to-fill partition, if any,
    /// is placed last. A second zero-sized extra is dropped here; spec
    /// validation rejects it before this point.
    pub fn by_install_order<'a>(&'a self, extras: &'a [Partition]) -> Vec<&'a Partition> {
        let mut partitions: Vec<&Partition> = Vec::new();
        let mut last: Option<&Partition> = None;

        let fixed = [
            self.bios.as_ref(),
            self.boot.as_ref(),
            self.oem.as_ref(),
            self.recovery.as_ref(),
            self.state.as_ref(),
        ];
        partitions.extend(fixed.into_iter().flatten());

        if let Some(persistent) = self.persistent.as_ref() {
            if persistent.size == 0 {
                last = Some(persistent);
            } else {
                partitions.push(persistent);
            }
        }
        for p in extras {
            if p.size == 0 {
                if last.is_none() {
                    last = Some(p);
                }
            } else {
                partitions.push(p);
            }
        }
        if let Some(p) = last {
            partitions.push(p);
        }
        partitions
    }

    /// Partitions sorted by mountpoint. Ascending order mounts parents
    /// before children; descending order is used for unmounting.
    pub fn by_mount_point(&self, descending: bool) -> Vec<&Partition> {
        let mut partitions: Vec<&Partition> = self
            .by_install_order(&[])
            .into_iter()
            .filter(|p| p.mount_point.is_some())
            .collect();
        partitions.sort_by_key(|p| p.mount_point.clone());
        if descending {
            partitions.reverse();
        }
        partitions
    }

    /// Build the partition set from a discovered partition list, matching
    /// by stable name first and by filesystem label second. Labels default
    /// to the well-known ones but follow the state file when present.
    pub fn from_list(list: &[Partition], state: Option<&InstallState>) -> Self {
        let label_for = |name: &str, default: &str| -> String {
            state
                .and_then(|s| s.partitions.get(name))
                .map(|ps| ps.fs_label.clone())
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let lookup = |name: &str, default_label: &str| -> Option<Partition> {
            let label = label_for(name, default_label);
            by_name_or_label(list, name, &label).cloned().map(|mut p| {
                p.name = name.to_string();
                p
            })
        };

        Self {
            bios: by_name(list, constants::BIOS_PART_NAME).cloned(),
            boot: lookup(constants::BOOT_PART_NAME, constants::EFI_LABEL),
            oem: lookup(constants::OEM_PART_NAME, constants::OEM_LABEL),
            recovery: lookup(constants::RECOVERY_PART_NAME, constants::RECOVERY_LABEL),
            state: lookup(constants::STATE_PART_NAME, constants::STATE_LABEL),
            persistent: lookup(constants::PERSISTENT_PART_NAME, constants::PERSISTENT_LABEL),
        }
    }
}

/// Host firmware kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Firmware {
    #[default]
    Bios,
    Efi,
}

impl Firmware {
    /// Firmware the host booted with, detected from the efivars mount.
    pub fn detect() -> Self {
        if PathBuf::from("/sys/firmware/efi").exists() {
            Firmware::Efi
        } else {
            Firmware::Bios
        }
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Firmware::Bios => f.write_str("bios"),
            Firmware::Efi => f.write_str("efi"),
        }
    }
}

/// Partition table kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PartTable {
    #[default]
    Msdos,
    Gpt,
}

impl fmt::Display for PartTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartTable::Msdos => f.write_str("msdos"),
            PartTable::Gpt => f.write_str("gpt"),
        }
    }
}
