//! Declarative action specifications and their validation.
//!
//! Every action starts from a spec assembled from configuration files,
//! environment and flags. `sanitize` detects unsolvable inconsistencies
//! before any side effect happens.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::constants;
use crate::fsutils::path_depth;
use crate::types::image::{Image, ImageSource};
use crate::types::partition::{
    ElementalPartitions, Firmware, FsKind, PartTable, Partition, PartitionList,
};
use crate::types::state::InstallState;

/// Installation details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallSpec {
    pub target: String,
    #[serde(skip)]
    pub firmware: Firmware,
    #[serde(skip)]
    pub part_table: PartTable,
    pub partitions: ElementalPartitions,
    #[serde(rename = "extra-partitions", skip_serializing_if = "Vec::is_empty")]
    pub extra_partitions: PartitionList,
    #[serde(rename = "no-format")]
    pub no_format: bool,
    pub force: bool,
    #[serde(rename = "cloud-init", skip_serializing_if = "Vec::is_empty")]
    pub cloud_init: Vec<String>,
    #[serde(rename = "grub-entry-name", skip_serializing_if = "String::is_empty")]
    pub grub_def_entry: String,
    pub system: ImageSource,
    #[serde(rename = "recovery-system")]
    pub recovery_system: Image,
    #[serde(rename = "disable-boot-entry")]
    pub disable_boot_entry: bool,
    #[serde(rename = "snapshot-labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot_labels: BTreeMap<String, String>,
}

impl InstallSpec {
    pub fn sanitize(&mut self) -> Result<()> {
        if self.system.is_empty() {
            bail!("undefined system source to install");
        }
        if self.target.is_empty() {
            bail!("undefined target device to install to");
        }
        let state_ok = self
            .partitions
            .state
            .as_ref()
            .map(|s| s.mount_point.is_some())
            .unwrap_or(false);
        if !state_ok {
            bail!("undefined state partition");
        }

        // If no dedicated recovery source is defined use the main one.
        if self.recovery_system.source.is_empty() {
            self.recovery_system.source = self.system.clone();
        }
        if self.recovery_system.fs != FsKind::Squashfs && self.recovery_system.label.is_empty() {
            self.recovery_system.label = constants::SYSTEM_LABEL.to_string();
        } else if self.recovery_system.fs == FsKind::Squashfs {
            self.recovery_system.label = String::new();
        }

        let zero_sized_extras = self
            .extra_partitions
            .iter()
            .filter(|p| p.size == 0)
            .count();
        if zero_sized_extras > 1 {
            bail!(
                "more than one extra partition has its size set to 0. Only a \
                 single partition may grow to take the remaining disk space"
            );
        }
        let persistent_grows = self
            .partitions
            .persistent
            .as_ref()
            .map(|p| p.size == 0)
            .unwrap_or(false);
        if zero_sized_extras == 1 && persistent_grows {
            bail!(
                "both the persistent partition and an extra partition have \
                 their size set to 0. Only a single partition may grow to \
                 take the remaining disk space"
            );
        }

        self.partitions
            .set_firmware_partitions(self.firmware, self.part_table)
    }
}

/// Upgrade details.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeSpec {
    #[serde(rename = "recovery")]
    pub recovery_upgrade: bool,
    pub system: ImageSource,
    #[serde(rename = "recovery-system")]
    pub recovery_system: Image,
    #[serde(rename = "grub-entry-name", skip_serializing_if = "String::is_empty")]
    pub grub_def_entry: String,
    #[serde(rename = "bootloader")]
    pub bootloader_upgrade: bool,
    #[serde(rename = "snapshot-labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot_labels: BTreeMap<String, String>,
    /// Proceed even if the previous upgrade was assessed as failed.
    pub force: bool,
    #[serde(skip)]
    pub partitions: ElementalPartitions,
    #[serde(skip)]
    pub state: Option<InstallState>,
}

impl UpgradeSpec {
    fn sanitize_recovery_defaults(&mut self) {
        if self.recovery_system.fs != FsKind::Squashfs && self.recovery_system.label.is_empty() {
            self.recovery_system.label = constants::SYSTEM_LABEL.to_string();
        } else if self.recovery_system.fs == FsKind::Squashfs {
            self.recovery_system.label = String::new();
        }
    }

    fn require_state_partition(&self) -> Result<()> {
        let ok = self
            .partitions
            .state
            .as_ref()
            .map(|s| s.mount_point.is_some())
            .unwrap_or(false);
        if !ok {
            bail!("undefined state partition");
        }
        Ok(())
    }

    fn require_recovery_partition(&self) -> Result<()> {
        let ok = self
            .partitions
            .recovery
            .as_ref()
            .map(|s| s.mount_point.is_some())
            .unwrap_or(false);
        if !ok {
            bail!("undefined recovery partition");
        }
        Ok(())
    }

    pub fn sanitize(&mut self) -> Result<()> {
        self.require_state_partition()?;
        if self.system.is_empty() {
            bail!("undefined upgrade source");
        }
        if self.recovery_upgrade {
            self.require_recovery_partition()?;
            if self.recovery_system.source.is_empty() {
                self.recovery_system.source = self.system.clone();
            }
        }
        if self.bootloader_upgrade {
            let ok = self
                .partitions
                .boot
                .as_ref()
                .map(|s| s.mount_point.is_some())
                .unwrap_or(false);
            if !ok {
                bail!("undefined bootloader partition");
            }
        }
        self.sanitize_recovery_defaults();
        Ok(())
    }

    /// Validation for the recovery-only upgrade path.
    pub fn sanitize_for_recovery_only(&mut self) -> Result<()> {
        self.require_state_partition()?;
        self.require_recovery_partition()?;
        if self.recovery_system.source.is_empty() {
            bail!("undefined upgrade-recovery source");
        }
        self.sanitize_recovery_defaults();
        Ok(())
    }
}

/// Reset details. Reset runs from the recovery system and reformats the
/// mutable partitions before redeploying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSpec {
    #[serde(rename = "reset-persistent")]
    pub format_persistent: bool,
    #[serde(rename = "reset-oem")]
    pub format_oem: bool,
    #[serde(rename = "cloud-init", skip_serializing_if = "Vec::is_empty")]
    pub cloud_init: Vec<String>,
    #[serde(rename = "grub-entry-name", skip_serializing_if = "String::is_empty")]
    pub grub_def_entry: String,
    pub system: ImageSource,
    #[serde(rename = "disable-boot-entry")]
    pub disable_boot_entry: bool,
    #[serde(rename = "snapshot-labels", skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshot_labels: BTreeMap<String, String>,
    #[serde(skip)]
    pub partitions: ElementalPartitions,
    #[serde(skip)]
    pub target: String,
    #[serde(skip)]
    pub efi: bool,
    #[serde(skip)]
    pub state: Option<InstallState>,
}

impl ResetSpec {
    pub fn sanitize(&mut self) -> Result<()> {
        if self.system.is_empty() {
            bail!("undefined system source to reset to");
        }
        let state_ok = self
            .partitions
            .state
            .as_ref()
            .map(|s| s.mount_point.is_some())
            .unwrap_or(false);
        if !state_ok {
            bail!("undefined state partition");
        }
        Ok(())
    }
}

/// Which deployment the system is (or should be) running from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Active,
    Passive,
    Recovery,
}

impl std::fmt::Display for MountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountMode::Active => f.write_str("active"),
            MountMode::Passive => f.write_str("passive"),
            MountMode::Recovery => f.write_str("recovery"),
        }
    }
}

impl std::str::FromStr for MountMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(MountMode::Active),
            "passive" => Ok(MountMode::Passive),
            "recovery" => Ok(MountMode::Recovery),
            other => bail!("unknown mount mode: {}", other),
        }
    }
}

/// How persistent paths are composed over the read-only root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistentMode {
    Bind,
    #[default]
    Overlay,
}

/// Backing of the ephemeral writable layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EphemeralKind {
    #[default]
    Tmpfs,
    Block,
}

/// An additional volume mounted at boot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
    pub mountpoint: String,
    pub device: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(rename = "fs")]
    pub fs_type: String,
}

/// Which paths are persisted across reboots and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentMounts {
    pub mode: PersistentMode,
    pub paths: Vec<String>,
    pub volume: VolumeMount,
}

impl Default for PersistentMounts {
    fn default() -> Self {
        Self {
            mode: PersistentMode::Overlay,
            paths: ["/etc", "/root", "/home", "/opt", "/srv", "/usr/local", "/var"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            volume: VolumeMount {
                mountpoint: constants::PERSISTENT_DIR.to_string(),
                device: format!("LABEL={}", constants::PERSISTENT_LABEL),
                options: vec![],
                fs_type: "auto".to_string(),
            },
        }
    }
}

/// The writable layer mounted over the immutable system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralMounts {
    #[serde(rename = "type")]
    pub kind: EphemeralKind,
    pub device: String,
    pub size: String,
    pub paths: Vec<String>,
}

impl Default for EphemeralMounts {
    fn default() -> Self {
        Self {
            kind: EphemeralKind::Tmpfs,
            device: String::new(),
            size: "25%".to_string(),
            paths: vec![],
        }
    }
}

/// Boot-time mount details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountSpec {
    #[serde(rename = "write-fstab")]
    pub write_fstab: bool,
    pub disable: bool,
    pub sysroot: PathBuf,
    pub mode: MountMode,
    #[serde(rename = "selinux-relabel")]
    pub selinux_relabel: bool,
    #[serde(rename = "extra-volumes", skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    pub ephemeral: EphemeralMounts,
    pub persistent: PersistentMounts,
    /// Root of the ephemeral overlay upper/work directories.
    #[serde(skip)]
    pub overlay_dir: PathBuf,
}

impl Default for MountSpec {
    fn default() -> Self {
        Self {
            write_fstab: true,
            disable: false,
            sysroot: PathBuf::from("/sysroot"),
            mode: MountMode::Active,
            selinux_relabel: false,
            overlay_dir: PathBuf::from(constants::OVERLAY_DIR),
            volumes: vec![
                VolumeMount {
                    mountpoint: "/oem".to_string(),
                    device: format!("LABEL={}", constants::OEM_LABEL),
                    options: vec![],
                    fs_type: "auto".to_string(),
                },
            ],
            ephemeral: EphemeralMounts::default(),
            persistent: PersistentMounts::default(),
        }
    }
}

fn clean_and_sort_paths(paths: &mut Vec<String>) {
    paths.retain(|p| !p.is_empty());
    paths.sort_by_key(|p| path_depth(p));
}

impl MountSpec {
    pub fn sanitize(&mut self) -> Result<()> {
        clean_and_sort_paths(&mut self.persistent.paths);
        clean_and_sort_paths(&mut self.ephemeral.paths);
        if self.mode == MountMode::Recovery {
            // recovery never touches persistent storage
            self.persistent.paths.clear();
        }
        Ok(())
    }

    /// Whether a persistent volume is configured and applicable.
    pub fn has_persistent(&self) -> bool {
        self.mode != MountMode::Recovery
            && !self.persistent.volume.device.is_empty()
            && !self.persistent.volume.mountpoint.is_empty()
    }
}

/// A partition spec parsed from a layout file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLayout {
    pub partitions: ElementalPartitions,
    #[serde(rename = "extra-partitions", skip_serializing_if = "Vec::is_empty")]
    pub extra_partitions: Vec<Partition>,
    pub expandable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_spec() -> InstallSpec {
        let mut partitions = ElementalPartitions::default_layout();
        partitions.normalize();
        InstallSpec {
            target: "/dev/sda".to_string(),
            firmware: Firmware::Efi,
            part_table: PartTable::Gpt,
            partitions,
            system: ImageSource::Oci("registry.io/os:v1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_install_requires_source() {
        let mut spec = install_spec();
        spec.system = ImageSource::Empty;
        let err = spec.sanitize().unwrap_err();
        assert!(err.to_string().contains("undefined system source"));
    }

    #[test]
    fn test_install_requires_state_partition() {
        let mut spec = install_spec();
        spec.partitions.state = None;
        let err = spec.sanitize().unwrap_err();
        assert!(err.to_string().contains("undefined state partition"));
    }

    #[test]
    fn test_install_defaults_recovery_source() {
        let mut spec = install_spec();
        spec.sanitize().unwrap();
        assert_eq!(spec.recovery_system.source, spec.system);
        assert_eq!(spec.recovery_system.label, constants::SYSTEM_LABEL);
    }

    #[test]
    fn test_install_squashfs_recovery_has_no_label() {
        let mut spec = install_spec();
        spec.recovery_system.fs = FsKind::Squashfs;
        spec.recovery_system.label = "SOMETHING".to_string();
        spec.sanitize().unwrap();
        assert!(spec.recovery_system.label.is_empty());
    }

    #[test]
    fn test_install_rejects_two_grow_extras() {
        let mut spec = install_spec();
        spec.extra_partitions = vec![
            Partition {
                size: 0,
                ..Default::default()
            },
            Partition {
                size: 0,
                ..Default::default()
            },
        ];
        assert!(spec.sanitize().is_err());
    }

    #[test]
    fn test_install_rejects_grow_extra_and_grow_persistent() {
        let mut spec = install_spec();
        spec.partitions.persistent.as_mut().unwrap().size = 0;
        spec.extra_partitions = vec![Partition {
            size: 0,
            ..Default::default()
        }];
        assert!(spec.sanitize().is_err());
    }

    #[test]
    fn test_upgrade_requires_source() {
        let mut partitions = ElementalPartitions::default_layout();
        partitions.normalize();
        let mut spec = UpgradeSpec {
            partitions,
            ..Default::default()
        };
        let err = spec.sanitize().unwrap_err();
        assert!(err.to_string().contains("undefined upgrade source"));
    }

    #[test]
    fn test_recovery_only_upgrade_requires_recovery_source() {
        let mut partitions = ElementalPartitions::default_layout();
        partitions.normalize();
        let mut spec = UpgradeSpec {
            partitions,
            ..Default::default()
        };
        let err = spec.sanitize_for_recovery_only().unwrap_err();
        assert!(err.to_string().contains("undefined upgrade-recovery source"));
    }

    #[test]
    fn test_mount_paths_sorted_by_depth() {
        let mut spec = MountSpec {
            persistent: PersistentMounts {
                paths: vec![
                    "/var/lib/rancher".to_string(),
                    String::new(),
                    "/var".to_string(),
                    "/var/lib".to_string(),
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        spec.sanitize().unwrap();
        assert_eq!(
            spec.persistent.paths,
            vec!["/var", "/var/lib", "/var/lib/rancher"]
        );
    }

    #[test]
    fn test_recovery_mode_drops_persistent_paths() {
        let mut spec = MountSpec {
            mode: MountMode::Recovery,
            ..Default::default()
        };
        spec.sanitize().unwrap();
        assert!(spec.persistent.paths.is_empty());
        assert!(!spec.has_persistent());
    }
}
