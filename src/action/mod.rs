//! Action orchestration.
//!
//! Each action is a linear pipeline over the partitioner, image source
//! resolver, snapshotter and bootloader adapter. Errors abort the pipeline
//! and roll back any open transaction; cleanup runs on all exit paths.

pub mod install;
pub mod mount;
pub mod reset;
pub mod upgrade;

pub use install::run_install;
pub use mount::run_mount;
pub use reset::{run_reset, run_reset_from};
pub use upgrade::run_upgrade;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, RunConfig};
use crate::constants;
use crate::fsutils::write_file_mode;
use crate::process::run_checked;
use crate::snapshotter::{Snapshot, Snapshotter};
use crate::source;
use crate::types::{
    ElementalPartitions, FsKind, Image, ImageSource, InstallState, Partition, SystemState,
};

/// Which deployment the host booted from, according to the sentinels the
/// initramfs stage leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    Active,
    Passive,
    Recovery,
    LiveCd,
    Unknown,
}

/// Detect the boot mode from sentinel files under the given root
/// (normally `/`).
pub fn boot_mode_from(root: &Path) -> BootMode {
    let hit = |paths: &[&str]| {
        paths
            .iter()
            .any(|p| root.join(p.trim_start_matches('/')).exists())
    };
    if hit(constants::ACTIVE_MODE_SENTINELS) {
        BootMode::Active
    } else if hit(constants::PASSIVE_MODE_SENTINELS) {
        BootMode::Passive
    } else if hit(constants::RECOVERY_MODE_SENTINELS) {
        BootMode::Recovery
    } else if root.join("run/initramfs/live").exists() {
        BootMode::LiveCd
    } else {
        BootMode::Unknown
    }
}

pub fn boot_mode() -> BootMode {
    boot_mode_from(Path::new("/"))
}

/// Whether the previous upgrade was assessed as failed.
pub fn upgrade_failed_sentinel(root: &Path) -> bool {
    root.join(constants::UPGRADE_FAILURE_SENTINEL.trim_start_matches('/'))
        .exists()
}

/// Run a cloud-init hook stage. In strict mode hook failures abort the
/// action, otherwise they are logged and tolerated.
pub fn run_hook(config: &Config, stage: &str) -> Result<()> {
    info!("Running {} hook", stage);
    match config.cloud_init.run_stage(stage, &config.cloud_init_paths) {
        Ok(()) => Ok(()),
        Err(e) if config.strict => Err(e).with_context(|| format!("hook {} failed", stage)),
        Err(e) => {
            warn!("hook {} failed: {}", stage, e);
            Ok(())
        }
    }
}

/// Run a chrooted cloud-init hook inside the given root with the API
/// filesystems bound.
pub fn run_chroot_hook(config: &Config, root: &Path, stage: &str) -> Result<()> {
    info!("Running {} hook", stage);
    let mut mounted: Vec<PathBuf> = Vec::new();
    let mut result = Ok(());
    for dir in ["dev", "proc", "sys"] {
        let target = root.join(dir);
        match config.mounter.mount(&format!("/{}", dir), &target, "", &["bind"]) {
            Ok(()) => mounted.push(target),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    if result.is_ok() {
        let root_str = root.to_string_lossy().into_owned();
        result = run_checked(
            config.runner.as_ref(),
            "chroot",
            &[&root_str, constants::CLOUD_INIT_BINARY, stage],
            &format!("hook {} failed", stage),
        )
        .map(|_| ());
    }
    for target in mounted.iter().rev() {
        if let Err(e) = config.mounter.unmount(target) {
            warn!("failed unmounting {}: {}", target.display(), e);
        }
    }
    match result {
        Ok(()) => Ok(()),
        Err(e) if config.strict => Err(e),
        Err(e) => {
            warn!("hook {} failed: {}", stage, e);
            Ok(())
        }
    }
}

/// Mount every partition of the set at its configured mountpoint, parents
/// first.
pub fn mount_partitions(config: &Config, partitions: &ElementalPartitions) -> Result<()> {
    info!("Mounting disk partitions");
    for partition in partitions.by_mount_point(false) {
        mount_partition(config, partition)?;
    }
    Ok(())
}

fn mount_partition(config: &Config, partition: &Partition) -> Result<()> {
    let (Some(device), Some(mount)) = (partition.path.as_ref(), partition.mount_point.as_ref())
    else {
        return Ok(());
    };
    if config.mounter.is_mounted(mount)? {
        return Ok(());
    }
    config
        .mounter
        .mount(
            &device.to_string_lossy(),
            mount,
            &partition.fs.to_string(),
            &["rw"],
        )
        .with_context(|| format!("failed mounting partition {}", partition.name))
}

/// Unmount the partition set, children first.
pub fn unmount_partitions(config: &Config, partitions: &ElementalPartitions) {
    info!("Unmounting disk partitions");
    for partition in partitions.by_mount_point(true) {
        if let Some(mount) = partition.mount_point.as_ref() {
            if config.mounter.is_mounted(mount).unwrap_or(false) {
                if let Err(e) = config.mounter.unmount(mount) {
                    warn!("failed unmounting {}: {}", mount.display(), e);
                }
            }
        }
    }
}

/// Materialize a source into a directory, transparently loop-mounting
/// single-file image sources so their content is reachable.
pub fn dump_source(config: &Config, source_ref: &ImageSource, dest: &Path) -> Result<Option<String>> {
    match source_ref {
        ImageSource::File(file) if file.extension().map(|e| e == "img").unwrap_or(false) => {
            let file_str = file.to_string_lossy().into_owned();
            let attach = run_checked(
                config.runner.as_ref(),
                "losetup",
                &["--show", "-f", &file_str],
                "losetup attach failed",
            )?;
            let device = attach.stdout_trimmed().to_string();
            let mount = tempfile::Builder::new()
                .prefix(".imgsrc")
                .tempdir()
                .context("failed creating image mountpoint")?;
            let result = config
                .mounter
                .mount(&device, mount.path(), "", &["ro"])
                .and_then(|_| {
                    let r = source::unpack(
                        config,
                        &ImageSource::Dir(mount.path().to_path_buf()),
                        dest,
                    );
                    let _ = config.mounter.unmount(mount.path());
                    r
                });
            let _ = run_checked(
                config.runner.as_ref(),
                "losetup",
                &["-d", &device],
                "losetup detach failed",
            );
            result
        }
        other => source::unpack(config, other, dest),
    }
}

/// Run a callback against the root tree of a committed snapshot,
/// loop-mounting image file snapshots as needed.
pub fn with_snapshot_root(
    config: &Config,
    snapshotter: &dyn Snapshotter,
    snapshot: &Snapshot,
    f: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    match snapshotter.snapshot_to_image_source(snapshot)? {
        ImageSource::Dir(path) => f(&path),
        ImageSource::File(image) => {
            let image_str = image.to_string_lossy().into_owned();
            let attach = run_checked(
                config.runner.as_ref(),
                "losetup",
                &["--show", "-r", "-f", &image_str],
                "losetup attach failed",
            )?;
            let device = attach.stdout_trimmed().to_string();
            let mount = image.with_extension("mnt");
            let result = config
                .mounter
                .mount(&device, &mount, "", &["ro"])
                .and_then(|_| {
                    let r = f(&mount);
                    let _ = config.mounter.unmount(&mount);
                    r
                });
            let _ = run_checked(
                config.runner.as_ref(),
                "losetup",
                &["-d", &device],
                "losetup detach failed",
            );
            result
        }
        other => anyhow::bail!("cannot inspect snapshot source {}", other),
    }
}

/// Build and place the recovery image on the recovery partition, returning
/// the state entry describing it.
pub fn deploy_recovery_image(
    config: &Config,
    source_ref: &ImageSource,
    recovery_mount: &Path,
    image: &Image,
) -> Result<SystemState> {
    let images_dir = recovery_mount.join(constants::IMAGES_SUBDIR);
    fs::create_dir_all(&images_dir)?;

    let digest = if image.fs == FsKind::Squashfs {
        info!("Creating recovery squashfs image");
        let staging = tempfile::tempdir_in(recovery_mount)
            .context("failed creating recovery staging directory")?;
        let digest = dump_source(config, source_ref, staging.path())?;

        let transition = images_dir.join(constants::TRANSITION_SQUASH_FILE);
        if transition.exists() {
            fs::remove_file(&transition)?;
        }
        let staging_str = staging.path().to_string_lossy().into_owned();
        let transition_str = transition.to_string_lossy().into_owned();
        let mut args = vec![staging_str.as_str(), transition_str.as_str()];
        let compression: Vec<&str> =
            config.squash_compression.iter().map(|s| s.as_str()).collect();
        args.extend(compression);
        run_checked(
            config.runner.as_ref(),
            "mksquashfs",
            &args,
            "mksquashfs failed",
        )?;
        fs::rename(&transition, images_dir.join(constants::RECOVERY_SQUASH_FILE))
            .context("failed placing the recovery image")?;
        digest
    } else {
        info!("Creating recovery filesystem image");
        let transition = images_dir.join(constants::TRANSITION_IMG_FILE);
        crate::fsutils::create_sparse_file(&transition, image.size.max(constants::IMG_SIZE))?;
        let program = match image.fs {
            FsKind::Ext2 => "mkfs.ext2",
            _ => "mkfs.ext4",
        };
        let transition_str = transition.to_string_lossy().into_owned();
        run_checked(
            config.runner.as_ref(),
            program,
            &["-F", "-L", &image.label, &transition_str],
            &format!("{} failed", program),
        )?;

        let attach = run_checked(
            config.runner.as_ref(),
            "losetup",
            &["--show", "-f", &transition_str],
            "losetup attach failed",
        )?;
        let device = attach.stdout_trimmed().to_string();
        let mount = images_dir.join("transition.mnt");
        let populate = config
            .mounter
            .mount(&device, &mount, &image.fs.to_string(), &["rw"])
            .and_then(|_| {
                let r = dump_source(config, source_ref, &mount);
                let _ = config.mounter.unmount(&mount);
                r
            });
        let _ = run_checked(
            config.runner.as_ref(),
            "losetup",
            &["-d", &device],
            "losetup detach failed",
        );
        let digest = populate?;
        let _ = fs::remove_dir_all(&mount);
        fs::rename(&transition, images_dir.join(constants::RECOVERY_IMG_FILE))
            .context("failed placing the recovery image")?;
        digest
    };

    Ok(SystemState {
        source: Some(source_ref.clone()),
        digest,
        active: false,
        label: image.label.clone(),
        fs: Some(image.fs),
        labels: Default::default(),
        date: crate::types::now_stamp(),
        from_action: String::new(),
    })
}

/// Persist the install state on both the state and recovery partitions.
pub fn write_install_state(
    state: &InstallState,
    partitions: &ElementalPartitions,
) -> Result<()> {
    let state_path = partitions
        .state
        .as_ref()
        .and_then(|p| p.mount_point.as_ref())
        .map(|m| m.join(constants::INSTALL_STATE_FILE));
    let recovery_path = partitions
        .recovery
        .as_ref()
        .and_then(|p| p.mount_point.as_ref())
        .map(|m| m.join(constants::INSTALL_STATE_FILE));
    state.write(state_path.as_deref(), recovery_path.as_deref())
}

/// Honor the post-action flags: eject the install media, reboot or power
/// off. Ejecting is implemented as a shutdown hook so the tray opens once
/// the filesystems are gone.
pub fn finalize(run_config: &RunConfig) -> Result<()> {
    let config = &run_config.config;
    if run_config.eject_cd {
        info!("Install media will be ejected on shutdown");
        write_file_mode(
            "/usr/lib/systemd/system-shutdown/eject.sh",
            constants::EJECT_SCRIPT,
            0o744,
        )?;
    }
    config.syscall.sync();
    if run_config.reboot {
        info!("Rebooting the system");
        config.syscall.reboot()?;
    } else if run_config.poweroff {
        info!("Powering off the system");
        config.syscall.power_off()?;
    }
    Ok(())
}
