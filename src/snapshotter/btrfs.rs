//! Btrfs snapshotter.
//!
//! Deployments are subvolumes at `@/.snapshots/<id>/snapshot` on the state
//! partition. The companion `@/.snapshots` subvolume is mounted inside the
//! active snapshot so snapshot-aware tooling works in the running system.
//! Subvolume bookkeeping goes through a [`SubvolumeBackend`], either plain
//! btrfs commands or snapper.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::backend::{BtrfsBackend, SubvolumeBackend, ROOT_SUBVOL, SNAPSHOTS_PATH};
use super::snapper::SnapperBackend;
use super::{publish_bootloader_state, Snapshot, Snapshotter};
use crate::bootloader::Grub;
use crate::config::Config;
use crate::constants;
use crate::fsutils::mirror_dir;
use crate::selinux;
use crate::types::{ImageSource, Partition, SnapshotterConfig};

pub struct BtrfsSnapshotter<'a> {
    config: &'a Config,
    snap_config: SnapshotterConfig,
    bootloader: &'a Grub<'a>,
    backend: Box<dyn SubvolumeBackend + 'a>,
    root_dir: Option<PathBuf>,
    env_dir: Option<PathBuf>,
    device: Option<String>,
    active_id: u32,
    /// Mountpoint of the snapshots subvolume inside the active snapshot.
    snapshots_mount: Option<PathBuf>,
    in_progress: Option<u32>,
}

impl<'a> BtrfsSnapshotter<'a> {
    pub fn new(
        config: &'a Config,
        snap_config: SnapshotterConfig,
        bootloader: &'a Grub<'a>,
    ) -> Self {
        let backend: Box<dyn SubvolumeBackend + 'a> = if snap_config.snapper {
            Box::new(SnapperBackend::new(config))
        } else {
            Box::new(BtrfsBackend::new(config))
        };
        Self {
            config,
            snap_config,
            bootloader,
            backend,
            root_dir: None,
            env_dir: None,
            device: None,
            active_id: 0,
            snapshots_mount: None,
            in_progress: None,
        }
    }

    fn root_dir(&self) -> Result<&PathBuf> {
        self.root_dir
            .as_ref()
            .context("snapshotter not initialized, run init first")
    }

    /// Remount the state partition at the top-level subvolume so snapshots
    /// can be managed, then expose `.snapshots` inside the active snapshot.
    fn remount_at_top_level(&mut self, state: &mut Partition) -> Result<()> {
        let device = self.device.clone().context("unknown state device")?;
        let mount = state
            .mount_point
            .clone()
            .context("state partition is not mounted")?;
        if self.config.mounter.is_mounted(&mount)? {
            debug!("Remounting {} at the top level subvolume", mount.display());
            self.config.mounter.unmount(&mount)?;
        }
        self.config.mounter.mount(
            &device,
            &mount,
            "btrfs",
            &["rw", &format!("subvol={}", ROOT_SUBVOL)],
        )?;
        self.root_dir = Some(mount.clone());

        if self.active_id > 0 {
            let target = super::backend::snapshot_path(&mount, self.active_id).join(SNAPSHOTS_PATH);
            self.config.mounter.mount(
                &device,
                &target,
                "btrfs",
                &["rw", &format!("subvol={}/{}", ROOT_SUBVOL, SNAPSHOTS_PATH)],
            )?;
            self.snapshots_mount = Some(target);
        }
        Ok(())
    }

    fn umount_snapshots_subvol(&mut self) {
        if let Some(target) = self.snapshots_mount.take() {
            let _ = self.config.mounter.unmount(&target);
        }
    }

    fn set_bootloader(&self, active_id: u32) -> Result<()> {
        let root = self.root_dir()?;
        let env_dir = self.env_dir.clone().context("snapshotter not initialized")?;
        let list = self.backend.list_snapshots(root)?;
        let mut passives: Vec<u32> = list.ids.iter().copied().filter(|id| *id != active_id).collect();
        passives.sort_unstable_by(|a, b| b.cmp(a));
        publish_bootloader_state(
            self.bootloader,
            &env_dir,
            self.snap_config.kind,
            &passives,
            passives.len(),
        )
    }
}

impl Snapshotter for BtrfsSnapshotter<'_> {
    fn init(&mut self, state: &mut Partition, efi_dir: &Path) -> Result<()> {
        let mount = state
            .mount_point
            .clone()
            .context("state partition is not mounted")?;
        let device = state
            .path
            .clone()
            .context("state partition has no device")?
            .to_string_lossy()
            .into_owned();
        info!("Initiating btrfs snapshotter at {}", mount.display());
        self.env_dir = Some(efi_dir.to_path_buf());
        self.device = Some(device.clone());

        let stat = self.backend.probe(&device, &mount)?;
        self.active_id = stat.active_id;
        if !stat.initiated {
            debug!("Running initial btrfs configuration");
            self.backend
                .init_partition(&mount)
                .context("failed setting up the btrfs partition for snapshots")?;
        } else if let Some(root) = stat.root_dir {
            // already mounted at the top level subvolume
            self.root_dir = Some(root);
            return Ok(());
        }
        self.remount_at_top_level(state)
    }

    fn start_transaction(&mut self) -> Result<Snapshot> {
        if self.in_progress.is_some() {
            bail!("there is already a transaction in progress");
        }
        let root = self.root_dir()?.clone();
        info!("Starting a btrfs snapshotter transaction");

        let mut snapshot = self
            .backend
            .create_snapshot(&root, self.active_id)
            .context("failed creating a new snapshot")?;

        let work_mount = self
            .snap_config
            .work_mount
            .clone()
            .unwrap_or_else(|| PathBuf::from(constants::WORKING_IMG_DIR));
        fs::create_dir_all(&work_mount)?;
        if let Err(e) = self.config.mounter.mount(
            &snapshot.work_dir.to_string_lossy(),
            &work_mount,
            "",
            &["bind"],
        ) {
            let _ = self.backend.delete_snapshot(&root, snapshot.id);
            return Err(e);
        }
        snapshot.mount_point = Some(work_mount);
        snapshot.in_progress = true;
        self.in_progress = Some(snapshot.id);
        Ok(snapshot)
    }

    fn close_transaction(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        if !snapshot.in_progress || self.in_progress != Some(snapshot.id) {
            bail!("given snapshot is not in progress");
        }
        let root = self.root_dir()?.clone();
        info!("Closing transaction for snapshot {}", snapshot.id);

        let result = (|| -> Result<()> {
            if let Some(mount) = snapshot.mount_point.take() {
                self.config.mounter.unmount(&mount)?;
            }
            // the snapshots mountpoint must exist inside the final snapshot
            fs::create_dir_all(snapshot.work_dir.join(SNAPSHOTS_PATH))?;

            if snapshot.id > 1 {
                // the writable work area and the final snapshot diverge;
                // reconcile them before the snapshot goes read-only
                mirror_dir(
                    self.config.runner.as_ref(),
                    &snapshot.work_dir,
                    &snapshot.path,
                )
                .context("failed syncing the work area into the snapshot")?;
            }
            fs::create_dir_all(snapshot.path.join(SNAPSHOTS_PATH))?;

            let extra_binds = vec![(
                root.join(SNAPSHOTS_PATH),
                format!("/{}", SNAPSHOTS_PATH),
            )];
            selinux::relabel(self.config, &snapshot.path, &extra_binds)?;

            self.backend
                .commit_snapshot(&root, snapshot)
                .context("failed committing the snapshot")?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = self.backend.delete_snapshot(&root, snapshot.id);
            self.in_progress = None;
            self.umount_snapshots_subvol();
            return Err(e);
        }

        let previous_active = self.active_id;
        self.active_id = snapshot.id;
        snapshot.in_progress = false;
        self.in_progress = None;

        if let Err(e) = self.set_bootloader(snapshot.id) {
            debug!("failed publishing bootloader state: {}", e);
        }
        let keep = [previous_active, snapshot.id];
        if let Err(e) = self
            .backend
            .cleanup(&root, self.snap_config.max_snaps, &keep)
        {
            debug!("snapshot retention cleanup failed: {}", e);
        }
        self.umount_snapshots_subvol();
        Ok(())
    }

    fn close_transaction_on_error(&mut self, snapshot: &Snapshot) -> Result<()> {
        if self.in_progress != Some(snapshot.id) {
            return Ok(());
        }
        debug!("Discarding transaction for snapshot {}", snapshot.id);
        if let Some(mount) = snapshot.mount_point.as_ref() {
            if self.config.mounter.is_mounted(mount).unwrap_or(false) {
                let _ = self.config.mounter.unmount(mount);
            }
        }
        let root = self.root_dir()?.clone();
        self.backend.delete_snapshot(&root, snapshot.id)?;
        self.in_progress = None;
        self.umount_snapshots_subvol();
        Ok(())
    }

    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        info!("Deleting snapshot {}", id);
        let root = self.root_dir()?.clone();
        if id == self.active_id {
            bail!("refusing to delete the active snapshot {}", id);
        }
        let list = self.backend.list_snapshots(&root)?;
        if !list.ids.contains(&id) {
            debug!("snapshot {} not found, nothing has been deleted", id);
            return Ok(());
        }
        self.backend.delete_snapshot(&root, id)
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        let root = self.root_dir()?;
        Ok(self.backend.list_snapshots(root)?.ids)
    }

    fn active_id(&self) -> u32 {
        self.active_id
    }

    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource> {
        if !snapshot.path.exists() {
            bail!("snapshot path does not exist: {}", snapshot.path.display());
        }
        Ok(ImageSource::Dir(snapshot.path.clone()))
    }
}
