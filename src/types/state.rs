//! The persisted installation state (`state.yaml`).
//!
//! Written to both the STATE and RECOVERY partitions after every successful
//! action and read back at startup. A missing file is tolerated; a legacy
//! location is probed before giving up.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants;
use crate::fsutils::write_file_with_dirs;
use crate::types::image::ImageSource;
use crate::types::partition::FsKind;

/// Snapshotter backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SnapshotterKind {
    #[default]
    #[serde(rename = "loop-device")]
    LoopDevice,
    #[serde(rename = "btrfs")]
    Btrfs,
}

impl std::fmt::Display for SnapshotterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotterKind::LoopDevice => f.write_str("loop-device"),
            SnapshotterKind::Btrfs => f.write_str("btrfs"),
        }
    }
}

/// Snapshotter configuration, persisted so later actions keep using the
/// backend the system was installed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotterConfig {
    #[serde(rename = "type", default)]
    pub kind: SnapshotterKind,
    #[serde(rename = "max-snaps", default = "default_max_snaps")]
    pub max_snaps: u32,
    /// Filesystem of loop device images.
    #[serde(default = "default_img_fs")]
    pub fs: FsKind,
    /// Size in MiB of loop device images.
    #[serde(default = "default_img_size")]
    pub size: u32,
    /// Delegate btrfs snapshot management to the external snapper tool.
    #[serde(default)]
    pub snapper: bool,
    /// Override of the transaction work area mountpoint.
    #[serde(skip)]
    pub work_mount: Option<std::path::PathBuf>,
}

fn default_max_snaps() -> u32 {
    constants::MAX_SNAPS
}

fn default_img_size() -> u32 {
    constants::IMG_SIZE
}

fn default_img_fs() -> FsKind {
    FsKind::Ext2
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            kind: SnapshotterKind::default(),
            max_snaps: constants::MAX_SNAPS,
            fs: FsKind::Ext2,
            size: constants::IMG_SIZE,
            snapper: false,
            work_mount: None,
        }
    }
}

/// Data of one deployed OS image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ImageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub active: bool,
    /// Only meaningful for the recovery image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    /// Only meaningful for the recovery image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(rename = "fromAction", default, skip_serializing_if = "String::is_empty")]
    pub from_action: String,
}

/// Installation data of one partition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PartitionState {
    #[serde(rename = "label", default, skip_serializing_if = "String::is_empty")]
    pub fs_label: String,
    #[serde(rename = "recovery", default, skip_serializing_if = "Option::is_none")]
    pub recovery_image: Option<SystemState>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshots: BTreeMap<u32, SystemState>,
}

/// Installation data of the whole system, keyed by partition name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstallState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(default)]
    pub snapshotter: SnapshotterConfig,
    #[serde(flatten)]
    pub partitions: BTreeMap<String, PartitionState>,
}

impl InstallState {
    /// Serialize with the generated-file header.
    pub fn to_yaml(&self) -> Result<String> {
        let body = serde_yaml::to_string(self).context("failed marshalling state file")?;
        Ok(format!("{}\n\n{}", constants::INSTALL_STATE_HEADER, body))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yaml::from_str(data).context("failed unmarshalling state file")
    }

    /// Write the state file to the given state and recovery locations.
    pub fn write(&self, state_path: Option<&Path>, recovery_path: Option<&Path>) -> Result<()> {
        let data = self.to_yaml()?;
        if let Some(path) = state_path {
            write_file_with_dirs(path, &data)
                .context("failed writing state file in state partition")?;
        }
        if let Some(path) = recovery_path {
            write_file_with_dirs(path, &data)
                .context("failed writing state file in recovery partition")?;
        }
        Ok(())
    }

    /// Load the state file from the first of the given directories that has
    /// one, backfilling defaults missing in files written by older releases.
    pub fn load_from(dirs: &[PathBuf]) -> Result<Self> {
        let mut data = None;
        for dir in dirs {
            let file = dir.join(constants::INSTALL_STATE_FILE);
            match fs::read_to_string(&file) {
                Ok(content) => {
                    debug!("Read state file {}", file.display());
                    data = Some(content);
                    break;
                }
                Err(_) => warn!("Could not read state file {}", file.display()),
            }
        }
        let data = data.context("no readable state file found")?;
        let mut state = Self::from_yaml(&data)?;
        state.backfill_defaults();
        Ok(state)
    }

    /// Load from the running system's well-known locations.
    pub fn load() -> Result<Self> {
        Self::load_from(&[
            PathBuf::from(constants::RUNNING_STATE_DIR),
            PathBuf::from(constants::LEGACY_STATE_DIR),
        ])
    }

    fn backfill_defaults(&mut self) {
        let defaults = [
            (constants::BOOT_PART_NAME, constants::EFI_LABEL),
            (constants::OEM_PART_NAME, constants::OEM_LABEL),
            (constants::RECOVERY_PART_NAME, constants::RECOVERY_LABEL),
            (constants::STATE_PART_NAME, constants::STATE_LABEL),
            (constants::PERSISTENT_PART_NAME, constants::PERSISTENT_LABEL),
        ];
        for (name, label) in defaults {
            if let Some(part) = self.partitions.get_mut(name) {
                if part.fs_label.is_empty() {
                    part.fs_label = label.to_string();
                }
            }
        }
        if let Some(recovery) = self
            .partitions
            .get_mut(constants::RECOVERY_PART_NAME)
            .and_then(|p| p.recovery_image.as_mut())
        {
            if recovery.fs.is_none() {
                recovery.fs = Some(FsKind::Squashfs);
            }
            if recovery.label.is_empty() && recovery.fs != Some(FsKind::Squashfs) {
                recovery.label = constants::SYSTEM_LABEL.to_string();
            }
        }
    }

    /// The id of the active snapshot on the state partition, if any.
    pub fn active_snapshot(&self) -> Option<u32> {
        self.partitions
            .get(constants::STATE_PART_NAME)
            .and_then(|p| p.snapshots.iter().find(|(_, s)| s.active))
            .map(|(id, _)| *id)
    }
}

/// Current timestamp in RFC 3339 form, as recorded in state files.
pub fn now_stamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_state() -> InstallState {
        let mut partitions = BTreeMap::new();
        let mut snapshots = BTreeMap::new();
        snapshots.insert(
            1,
            SystemState {
                source: Some(ImageSource::Oci("registry.io/os:v1".into())),
                digest: Some("sha256:abcd".into()),
                active: true,
                from_action: "install".into(),
                ..Default::default()
            },
        );
        partitions.insert(
            constants::STATE_PART_NAME.to_string(),
            PartitionState {
                fs_label: constants::STATE_LABEL.to_string(),
                snapshots,
                ..Default::default()
            },
        );
        partitions.insert(
            constants::RECOVERY_PART_NAME.to_string(),
            PartitionState {
                fs_label: constants::RECOVERY_LABEL.to_string(),
                recovery_image: Some(SystemState {
                    fs: Some(FsKind::Squashfs),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        InstallState {
            date: "2024-01-01T00:00:00Z".to_string(),
            snapshotter: SnapshotterConfig::default(),
            partitions,
        }
    }

    #[test]
    fn test_round_trip_preserves_state() {
        let state = sample_state();
        let yaml = state.to_yaml().unwrap();
        let loaded = InstallState::from_yaml(&yaml).unwrap();
        assert_eq!(state, loaded);
    }

    #[test]
    fn test_header_is_first_line() {
        let yaml = sample_state().to_yaml().unwrap();
        assert!(yaml.starts_with(constants::INSTALL_STATE_HEADER));
    }

    #[test]
    fn test_write_and_load_from_both_partitions() {
        let tmp = TempDir::new().unwrap();
        let state_dir = tmp.path().join("state");
        let recovery_dir = tmp.path().join("recovery");
        let state = sample_state();
        state
            .write(
                Some(&state_dir.join(constants::INSTALL_STATE_FILE)),
                Some(&recovery_dir.join(constants::INSTALL_STATE_FILE)),
            )
            .unwrap();

        let loaded = InstallState::load_from(&[state_dir]).unwrap();
        assert_eq!(loaded, state);
        let loaded = InstallState::load_from(&[recovery_dir]).unwrap();
        assert_eq!(loaded.active_snapshot(), Some(1));
    }

    #[test]
    fn test_load_falls_back_to_legacy_dir() {
        let tmp = TempDir::new().unwrap();
        let primary = tmp.path().join("primary");
        let legacy = tmp.path().join("legacy");
        sample_state()
            .write(Some(&legacy.join(constants::INSTALL_STATE_FILE)), None)
            .unwrap();
        let loaded = InstallState::load_from(&[primary, legacy]).unwrap();
        assert_eq!(loaded.active_snapshot(), Some(1));
    }

    #[test]
    fn test_missing_state_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(InstallState::load_from(&[tmp.path().to_path_buf()]).is_err());
    }

    #[test]
    fn test_backfill_fills_missing_labels() {
        let yaml = "p.state:\n  snapshots:\n    2:\n      active: true\n";
        let mut state = InstallState::from_yaml(yaml).unwrap();
        state.backfill_defaults();
        assert_eq!(
            state.partitions[constants::STATE_PART_NAME].fs_label,
            constants::STATE_LABEL
        );
        assert_eq!(state.active_snapshot(), Some(2));
    }
}
