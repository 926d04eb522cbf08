//! Deployment versioning.
//!
//! A snapshotter owns the transactional semantics of deployments: it opens a
//! writable work area, lets the caller populate it, and atomically swaps the
//! active deployment on commit. Two backends share the contract: loop device
//! image files on the state partition, and btrfs subvolumes optionally
//! managed through snapper.

pub(crate) mod backend;
mod btrfs;
mod loopdevice;
mod snapper;

pub use btrfs::BtrfsSnapshotter;
pub use loopdevice::LoopDeviceSnapshotter;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::bootloader::Grub;
use crate::config::Config;
use crate::types::{ImageSource, Partition, SnapshotterConfig, SnapshotterKind};

/// A versioned deployment managed by a snapshotter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    /// Monotonically increasing, never reused.
    pub id: u32,
    /// Final (read-only) location of the deployment.
    pub path: PathBuf,
    /// Writable build area populated during the transaction.
    pub work_dir: PathBuf,
    /// Where the work area is mounted while the transaction is open.
    pub mount_point: Option<PathBuf>,
    pub in_progress: bool,
    pub labels: BTreeMap<String, String>,
}

/// Transactional deployment management. At most one snapshot is in progress
/// per instance; commits are atomic with respect to the bootloader view.
pub trait Snapshotter {
    /// Probe and prepare the state partition. Must be called before any
    /// transaction.
    fn init(&mut self, state: &mut Partition, efi_dir: &Path) -> Result<()>;

    /// Open a transaction: create the next snapshot and mount its work area.
    fn start_transaction(&mut self) -> Result<Snapshot>;

    /// Commit: make the snapshot the active deployment, demote the previous
    /// one and apply retention.
    fn close_transaction(&mut self, snapshot: &mut Snapshot) -> Result<()>;

    /// Abort: leave the visible state untouched.
    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn delete_snapshot(&mut self, id: u32) -> Result<()>;

    fn get_snapshots(&self) -> Result<Vec<u32>>;

    /// Currently active snapshot id, zero before the first commit.
    fn active_id(&self) -> u32;

    /// View a committed snapshot as an image source, e.g. to build the
    /// recovery image from the deployment just installed.
    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource>;
}

/// Build the snapshotter selected by the configuration.
pub fn new_snapshotter<'a>(
    config: &'a Config,
    snap_config: SnapshotterConfig,
    bootloader: &'a Grub<'a>,
) -> Result<Box<dyn Snapshotter + 'a>> {
    match snap_config.kind {
        SnapshotterKind::LoopDevice => Ok(Box::new(LoopDeviceSnapshotter::new(
            config,
            snap_config,
            bootloader,
        ))),
        SnapshotterKind::Btrfs => Ok(Box::new(BtrfsSnapshotter::new(
            config,
            snap_config,
            bootloader,
        ))),
    }
}

/// Bootloader environment update shared by both backends: the passive
/// snapshot list (newest first) and the fallback chain ending in recovery.
/// `fallback_slots` is the number of passive boot entries, which for the
/// loop device backend is fixed by its on-disk layout rather than by the
/// tracked snapshot ids.
pub(crate) fn publish_bootloader_state(
    bootloader: &Grub<'_>,
    env_dir: &Path,
    kind: SnapshotterKind,
    passive_ids: &[u32],
    fallback_slots: usize,
) -> Result<()> {
    let passives: Vec<String> = passive_ids.iter().map(|id| id.to_string()).collect();
    // entry 0 is the active one, then one per passive, then recovery
    let mut fallback: Vec<String> = (0..=fallback_slots).map(|i| i.to_string()).collect();
    fallback.push("recovery".to_string());

    bootloader.set_persistent_variables(
        &env_dir.join(crate::constants::GRUB_OEM_ENV),
        &[
            (
                crate::constants::GRUB_ENV_PASSIVE_SNAPS,
                passives.join(" "),
            ),
            (crate::constants::GRUB_ENV_FALLBACK, fallback.join(" ")),
            (crate::constants::GRUB_ENV_SNAPSHOTTER, kind.to_string()),
        ],
    )
}
