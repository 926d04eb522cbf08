//! Loop device snapshotter.
//!
//! Deployments are ext2/ext4 image files on the state partition:
//! `cOS/active.img` and `cOS/passive.img`, with `cOS/transition.img` as the
//! scratch image of an open transaction. Only two durable deployments
//! exist; commit demotes the active image to passive by file rename.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{publish_bootloader_state, Snapshot, Snapshotter};
use crate::bootloader::Grub;
use crate::config::Config;
use crate::constants;
use crate::fsutils::create_sparse_file;
use crate::process::run_checked;
use crate::selinux;
use crate::types::{FsKind, ImageSource, Partition, SnapshotterConfig};

/// Persisted snapshot bookkeeping, stored next to the images. Ids stay
/// monotonic across transactions even though only two images survive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImageLedger {
    #[serde(rename = "next-id")]
    next_id: u32,
    active: Option<u32>,
    passive: Option<u32>,
}

const LEDGER_FILE: &str = ".snapshots.yaml";

pub struct LoopDeviceSnapshotter<'a> {
    config: &'a Config,
    snap_config: SnapshotterConfig,
    bootloader: &'a Grub<'a>,
    state_mount: Option<PathBuf>,
    env_dir: Option<PathBuf>,
    /// Loop device backing the open transaction.
    transition_loop: Option<String>,
    in_progress: Option<u32>,
}

impl<'a> LoopDeviceSnapshotter<'a> {
    pub fn new(
        config: &'a Config,
        snap_config: SnapshotterConfig,
        bootloader: &'a Grub<'a>,
    ) -> Self {
        if snap_config.max_snaps > 2 {
            debug!("loop device snapshotter keeps at most 2 snapshots");
        }
        Self {
            config,
            snap_config,
            bootloader,
            state_mount: None,
            env_dir: None,
            transition_loop: None,
            in_progress: None,
        }
    }

    fn images_dir(&self) -> Result<PathBuf> {
        self.state_mount
            .as_ref()
            .map(|m| m.join(constants::IMAGES_SUBDIR))
            .context("snapshotter not initialized")
    }

    fn ledger_path(&self) -> Result<PathBuf> {
        Ok(self.images_dir()?.join(LEDGER_FILE))
    }

    fn read_ledger(&self) -> Result<ImageLedger> {
        let path = self.ledger_path()?;
        match fs::read_to_string(&path) {
            Ok(content) => serde_yaml::from_str(&content)
                .with_context(|| format!("corrupt snapshot ledger {}", path.display())),
            Err(_) => Ok(ImageLedger::default()),
        }
    }

    fn write_ledger(&self, ledger: &ImageLedger) -> Result<()> {
        let content = serde_yaml::to_string(ledger)?;
        crate::fsutils::write_file_with_dirs(self.ledger_path()?, content)
    }

    fn image_fs_program(&self) -> Result<&'static str> {
        match self.snap_config.fs {
            FsKind::Ext2 => Ok("mkfs.ext2"),
            FsKind::Ext4 => Ok("mkfs.ext4"),
            other => bail!("unsupported loop device image filesystem: {}", other),
        }
    }

    fn set_image_label(&self, image: &Path, label: &str) -> Result<()> {
        let image = image.to_string_lossy().into_owned();
        run_checked(
            self.config.runner.as_ref(),
            "tune2fs",
            &["-L", label, &image],
            "failed setting image label",
        )
        .map(|_| ())
    }

    fn detach_transition_loop(&mut self) {
        if let Some(device) = self.transition_loop.take() {
            if let Err(e) = run_checked(
                self.config.runner.as_ref(),
                "losetup",
                &["-d", &device],
                "losetup detach failed",
            ) {
                warn!("failed detaching {}: {}", device, e);
            }
        }
    }
}

impl Snapshotter for LoopDeviceSnapshotter<'_> {
    fn init(&mut self, state: &mut Partition, efi_dir: &Path) -> Result<()> {
        let mount = state
            .mount_point
            .clone()
            .context("state partition is not mounted")?;
        info!("Initiating loop device snapshotter at {}", mount.display());
        fs::create_dir_all(mount.join(constants::IMAGES_SUBDIR))?;
        self.state_mount = Some(mount);
        self.env_dir = Some(efi_dir.to_path_buf());
        Ok(())
    }

    fn start_transaction(&mut self) -> Result<Snapshot> {
        if self.in_progress.is_some() {
            bail!("there is already a transaction in progress");
        }
        let images = self.images_dir()?;
        let ledger = self.read_ledger()?;
        let id = ledger
            .next_id
            .max(ledger.active.map(|a| a + 1).unwrap_or(1))
            .max(1);
        info!("Starting a loop device snapshotter transaction for snapshot {}", id);

        let transition = images.join(constants::TRANSITION_IMG_FILE);
        create_sparse_file(&transition, self.snap_config.size)?;
        let program = self.image_fs_program()?;
        let transition_str = transition.to_string_lossy().into_owned();
        run_checked(
            self.config.runner.as_ref(),
            program,
            &["-F", "-L", constants::ACTIVE_LABEL, &transition_str],
            &format!("{} failed", program),
        )?;

        let attach = run_checked(
            self.config.runner.as_ref(),
            "losetup",
            &["--show", "-f", &transition_str],
            "losetup attach failed",
        )?;
        let device = attach.stdout_trimmed().to_string();

        let work_dir = self
            .snap_config
            .work_mount
            .clone()
            .unwrap_or_else(|| PathBuf::from(constants::WORKING_IMG_DIR));
        let mount_result = self.config.mounter.mount(
            &device,
            &work_dir,
            &self.snap_config.fs.to_string(),
            &["rw"],
        );
        if let Err(e) = mount_result {
            let _ = run_checked(
                self.config.runner.as_ref(),
                "losetup",
                &["-d", &device],
                "losetup detach failed",
            );
            let _ = fs::remove_file(&transition);
            return Err(e);
        }

        self.transition_loop = Some(device);
        self.in_progress = Some(id);
        Ok(Snapshot {
            id,
            path: images.join(constants::ACTIVE_IMG_FILE),
            work_dir: work_dir.clone(),
            mount_point: Some(work_dir),
            in_progress: true,
            labels: Default::default(),
        })
    }

    fn close_transaction(&mut self, snapshot: &mut Snapshot) -> Result<()> {
        if !snapshot.in_progress || self.in_progress != Some(snapshot.id) {
            bail!("given snapshot is not in progress");
        }
        info!("Closing transaction for snapshot {}", snapshot.id);
        let images = self.images_dir()?;
        let transition = images.join(constants::TRANSITION_IMG_FILE);
        let active = images.join(constants::ACTIVE_IMG_FILE);
        let passive = images.join(constants::PASSIVE_IMG_FILE);

        let result = (|| -> Result<()> {
            if let Some(mount) = snapshot.mount_point.as_ref() {
                selinux::relabel(self.config, mount, &[])?;
                self.config.mounter.unmount(mount)?;
            }
            self.detach_transition_loop();

            let mut ledger = self.read_ledger()?;
            if active.exists() {
                debug!("Demoting the active image to passive");
                fs::rename(&active, &passive).context("failed demoting the active image")?;
                ledger.passive = ledger.active;
            }
            fs::rename(&transition, &active)
                .context("failed promoting the transition image")?;
            if passive.exists() {
                self.set_image_label(&passive, constants::PASSIVE_LABEL)?;
            } else {
                // first deployment: seed the fallback image from the active
                info!("Copying {} image...", constants::PASSIVE_LABEL);
                fs::copy(&active, &passive).context("failed seeding the passive image")?;
                self.set_image_label(&passive, constants::PASSIVE_LABEL)?;
            }

            ledger.active = Some(snapshot.id);
            ledger.next_id = snapshot.id + 1;
            self.write_ledger(&ledger)?;

            let env_dir = self.env_dir.clone().context("snapshotter not initialized")?;
            let passives: Vec<u32> = ledger.passive.into_iter().collect();
            // the passive image always exists after a commit
            publish_bootloader_state(
                self.bootloader,
                &env_dir,
                self.snap_config.kind,
                &passives,
                1,
            )?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&transition);
            self.in_progress = None;
            return Err(e);
        }

        snapshot.in_progress = false;
        self.in_progress = None;
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
        self.detach_transition_loop();
        let transition = self.images_dir()?.join(constants::TRANSITION_IMG_FILE);
        if transition.exists() {
            fs::remove_file(&transition)?;
        }
        self.in_progress = None;
        Ok(())
    }

    fn delete_snapshot(&mut self, id: u32) -> Result<()> {
        let mut ledger = self.read_ledger()?;
        if ledger.active == Some(id) {
            bail!("refusing to delete the active snapshot {}", id);
        }
        if ledger.passive == Some(id) {
            info!("Deleting snapshot {}", id);
            let passive = self.images_dir()?.join(constants::PASSIVE_IMG_FILE);
            if passive.exists() {
                fs::remove_file(passive)?;
            }
            ledger.passive = None;
            self.write_ledger(&ledger)?;
        } else {
            debug!("snapshot {} not found, nothing has been deleted", id);
        }
        Ok(())
    }

    fn get_snapshots(&self) -> Result<Vec<u32>> {
        let ledger = self.read_ledger()?;
        let mut ids: Vec<u32> = ledger
            .passive
            .into_iter()
            .chain(ledger.active)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn active_id(&self) -> u32 {
        self.read_ledger()
            .ok()
            .and_then(|l| l.active)
            .unwrap_or(0)
    }

    fn snapshot_to_image_source(&self, snapshot: &Snapshot) -> Result<ImageSource> {
        if !snapshot.path.exists() {
            bail!("snapshot path does not exist: {}", snapshot.path.display());
        }
        Ok(ImageSource::File(snapshot.path.clone()))
    }
}
