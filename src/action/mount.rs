//! The mount action: compose the writable system at boot.
//!
//! Runs from the initramfs. Mounts the selected deployment read-only at the
//! sysroot, assembles the ephemeral overlay, binds or overlays persistent
//! paths and optionally writes the resulting `/etc/fstab`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::Config;
use crate::constants;
use crate::fsutils::write_file_with_dirs;
use crate::process::{run_checked, Runner};
use crate::selinux;
use crate::types::spec::{EphemeralKind, PersistentMode};
use crate::types::{FsKind, MountMode, MountSpec, VolumeMount};

/// One line of the generated fstab.
#[derive(Debug, Clone)]
struct FstabEntry {
    device: String,
    mountpoint: String,
    fstype: String,
    options: String,
}

impl FstabEntry {
    fn line(&self) -> String {
        format!(
            "{} {} {} {} 0 0",
            self.device, self.mountpoint, self.fstype, self.options
        )
    }
}

pub fn run_mount(config: &Config, spec: &mut MountSpec) -> Result<()> {
    if spec.disable {
        info!("Mount is disabled, nothing to do");
        return Ok(());
    }
    spec.sanitize().context("invalid mount spec")?;
    info!("Mounting the {} system at {}", spec.mode, spec.sysroot.display());

    let mut fstab: Vec<FstabEntry> = Vec::new();

    if !config.mounter.is_mounted(&spec.sysroot)? {
        mount_sysroot(config, spec).context("mount failed assembling the sysroot")?;
    }
    mount_ephemeral(config, spec, &mut fstab).context("mount failed assembling the overlay")?;
    if spec.has_persistent() {
        mount_persistent(config, spec, &mut fstab)
            .context("mount failed assembling persistent paths")?;
    }
    for volume in &spec.volumes {
        mount_volume(config, spec, volume, &mut fstab)
            .with_context(|| format!("mount failed for volume {}", volume.mountpoint))?;
    }

    if spec.write_fstab {
        write_fstab(spec, &fstab)?;
    }
    if spec.selinux_relabel {
        selinux::relabel(config, &spec.sysroot, &[])?;
    }
    write_mode_sentinel(spec.mode)?;
    Ok(())
}

/// Resolve `LABEL=`/`UUID=` device references through blkid.
fn resolve_device(runner: &dyn Runner, device: &str) -> Result<String> {
    if let Some(label) = device.strip_prefix("LABEL=") {
        let result = run_checked(
            runner,
            "blkid",
            &["-L", label],
            &format!("no device with label {}", label),
        )?;
        return Ok(result.stdout_trimmed().to_string());
    }
    if let Some(uuid) = device.strip_prefix("UUID=") {
        let result = run_checked(
            runner,
            "blkid",
            &["-U", uuid],
            &format!("no device with uuid {}", uuid),
        )?;
        return Ok(result.stdout_trimmed().to_string());
    }
    Ok(device.to_string())
}

fn probe_fs(runner: &dyn Runner, device: &str) -> Result<String> {
    let result = run_checked(
        runner,
        "blkid",
        &["-o", "value", "-s", "TYPE", device],
        &format!("cannot probe filesystem of {}", device),
    )?;
    Ok(result.stdout_trimmed().to_string())
}

fn attach_loop(runner: &dyn Runner, image: &Path) -> Result<String> {
    let image_str = image.to_string_lossy().into_owned();
    let result = run_checked(
        runner,
        "losetup",
        &["--show", "-r", "-f", &image_str],
        "losetup attach failed",
    )?;
    Ok(result.stdout_trimmed().to_string())
}

fn mount_sysroot(config: &Config, spec: &MountSpec) -> Result<()> {
    let runner = config.runner.as_ref();
    match spec.mode {
        MountMode::Recovery => {
            let device = resolve_device(runner, &format!("LABEL={}", constants::RECOVERY_LABEL))?;
            let recovery_mount = PathBuf::from(constants::RECOVERY_DIR);
            config
                .mounter
                .mount(&device, &recovery_mount, &probe_fs(runner, &device)?, &["ro"])?;
            let images = recovery_mount.join(constants::IMAGES_SUBDIR);
            let squash = images.join(constants::RECOVERY_SQUASH_FILE);
            let (image, fstype) = if squash.exists() {
                (squash, "squashfs")
            } else {
                (images.join(constants::RECOVERY_IMG_FILE), "")
            };
            let loop_dev = attach_loop(runner, &image)?;
            let fstype = if fstype.is_empty() {
                probe_fs(runner, &loop_dev)?
            } else {
                fstype.to_string()
            };
            config
                .mounter
                .mount(&loop_dev, &spec.sysroot, &fstype, &["ro"])?;
        }
        MountMode::Active | MountMode::Passive => {
            let device = resolve_device(runner, &format!("LABEL={}", constants::STATE_LABEL))?;
            let fstype = probe_fs(runner, &device)?;
            if fstype == "btrfs" {
                mount_btrfs_sysroot(config, spec, &device)?;
            } else {
                let state_mount = PathBuf::from(constants::RUNNING_STATE_DIR);
                config
                    .mounter
                    .mount(&device, &state_mount, &fstype, &["ro"])?;
                let image_file = match spec.mode {
                    MountMode::Active => constants::ACTIVE_IMG_FILE,
                    _ => constants::PASSIVE_IMG_FILE,
                };
                let image = state_mount
                    .join(constants::IMAGES_SUBDIR)
                    .join(image_file);
                let loop_dev = attach_loop(runner, &image)?;
                let fstype = probe_fs(runner, &loop_dev)?;
                config
                    .mounter
                    .mount(&loop_dev, &spec.sysroot, &fstype, &["ro"])?;
            }
        }
    }
    Ok(())
}

fn mount_btrfs_sysroot(config: &Config, spec: &MountSpec, device: &str) -> Result<()> {
    match spec.mode {
        MountMode::Active => {
            // the default subvolume is the active snapshot
            config
                .mounter
                .mount(device, &spec.sysroot, "btrfs", &["ro"])?;
        }
        MountMode::Passive => {
            let id = newest_passive_snapshot(config, device)?;
            let subvol = format!("subvol=@/.snapshots/{}/snapshot", id);
            config
                .mounter
                .mount(device, &spec.sysroot, "btrfs", &["ro", &subvol])?;
        }
        MountMode::Recovery => bail!("recovery does not boot from the state partition"),
    }
    Ok(())
}

/// The newest non-default snapshot is the passive boot target.
fn newest_passive_snapshot(config: &Config, device: &str) -> Result<u32> {
    use crate::snapshotter::backend::{BtrfsBackend, SubvolumeBackend};

    let state_mount = PathBuf::from(constants::RUNNING_STATE_DIR);
    config
        .mounter
        .mount(device, &state_mount, "btrfs", &["ro", "subvol=/@"])?;
    let list = BtrfsBackend::new(config).list_snapshots(&state_mount);
    let _ = config.mounter.unmount(&state_mount);
    let list = list?;
    list.ids
        .iter()
        .copied()
        .filter(|id| *id != list.active_id)
        .max()
        .context("no passive snapshot available")
}

fn mount_ephemeral(config: &Config, spec: &MountSpec, fstab: &mut Vec<FstabEntry>) -> Result<()> {
    let overlay_dir = spec.overlay_dir.clone();
    match spec.ephemeral.kind {
        EphemeralKind::Tmpfs => {
            let size = format!("size={}", spec.ephemeral.size);
            config
                .mounter
                .mount("tmpfs", &overlay_dir, "tmpfs", &["rw", &size])?;
            fstab.push(FstabEntry {
                device: "tmpfs".to_string(),
                mountpoint: overlay_dir.to_string_lossy().into_owned(),
                fstype: "tmpfs".to_string(),
                options: format!("defaults,{}", size),
            });
        }
        EphemeralKind::Block => {
            if spec.ephemeral.device.is_empty() {
                bail!("block overlay requested without a device");
            }
            let device = resolve_device(config.runner.as_ref(), &spec.ephemeral.device)?;
            // the ephemeral block device gets a fresh filesystem every boot
            run_checked(
                config.runner.as_ref(),
                "mkfs.ext4",
                &["-F", &device],
                "failed formatting the overlay device",
            )?;
            config
                .mounter
                .mount(&device, &overlay_dir, &FsKind::Ext4.to_string(), &["rw"])?;
            fstab.push(FstabEntry {
                device,
                mountpoint: overlay_dir.to_string_lossy().into_owned(),
                fstype: "ext4".to_string(),
                options: "defaults".to_string(),
            });
        }
    }

    for path in &spec.ephemeral.paths {
        overlay_path(config, &spec.sysroot, &overlay_dir, path, fstab)?;
    }
    Ok(())
}

/// Mount a per-path overlay with upper and work dirs under the given base.
fn overlay_path(
    config: &Config,
    sysroot: &Path,
    base: &Path,
    path: &str,
    fstab: &mut Vec<FstabEntry>,
) -> Result<()> {
    let trimmed = path.trim_start_matches('/');
    let flat = trimmed.replace('/', "-");
    let upper = base.join(format!("{}.overlay", flat)).join("upper");
    let work = base.join(format!("{}.overlay", flat)).join("work");
    fs::create_dir_all(&upper)?;
    fs::create_dir_all(&work)?;
    let target = sysroot.join(trimmed);
    fs::create_dir_all(&target)?;

    let options = format!(
        "lowerdir={},upperdir={},workdir={}",
        target.display(),
        upper.display(),
        work.display()
    );
    debug!("Overlay mounting {}", target.display());
    config
        .mounter
        .mount("overlay", &target, "overlay", &["rw", &options])?;
    fstab.push(FstabEntry {
        device: "overlay".to_string(),
        mountpoint: format!("/{}", trimmed),
        fstype: "overlay".to_string(),
        options: format!("defaults,{}", options),
    });
    Ok(())
}

fn mount_persistent(config: &Config, spec: &MountSpec, fstab: &mut Vec<FstabEntry>) -> Result<()> {
    let runner = config.runner.as_ref();
    let volume = &spec.persistent.volume;
    let device = resolve_device(runner, &volume.device)?;
    let mountpoint = PathBuf::from(&volume.mountpoint);
    let fstype = if volume.fs_type.is_empty() || volume.fs_type == "auto" {
        probe_fs(runner, &device)?
    } else {
        volume.fs_type.clone()
    };
    if !config.mounter.is_mounted(&mountpoint)? {
        config
            .mounter
            .mount(&device, &mountpoint, &fstype, &["rw"])?;
    }
    fstab.push(FstabEntry {
        device: volume.device.clone(),
        mountpoint: volume.mountpoint.clone(),
        fstype,
        options: "defaults".to_string(),
    });

    let state_dir = mountpoint.join(".state");
    for path in &spec.persistent.paths {
        let trimmed = path.trim_start_matches('/');
        let flat = trimmed.replace('/', "-");
        let target = spec.sysroot.join(trimmed);
        fs::create_dir_all(&target)?;
        match spec.persistent.mode {
            PersistentMode::Bind => {
                let source = state_dir.join(format!("{}.bind", flat));
                fs::create_dir_all(&source)?;
                debug!("Bind mounting {}", target.display());
                config
                    .mounter
                    .mount(&source.to_string_lossy(), &target, "", &["bind"])?;
                fstab.push(FstabEntry {
                    device: source.to_string_lossy().into_owned(),
                    mountpoint: format!("/{}", trimmed),
                    fstype: "none".to_string(),
                    options: "defaults,bind".to_string(),
                });
            }
            PersistentMode::Overlay => {
                overlay_path(config, &spec.sysroot, &state_dir, path, fstab)?;
            }
        }
    }
    Ok(())
}

fn mount_volume(
    config: &Config,
    spec: &MountSpec,
    volume: &VolumeMount,
    fstab: &mut Vec<FstabEntry>,
) -> Result<()> {
    let runner = config.runner.as_ref();
    let device = resolve_device(runner, &volume.device)?;
    let fstype = if volume.fs_type.is_empty() || volume.fs_type == "auto" {
        probe_fs(runner, &device)?
    } else {
        volume.fs_type.clone()
    };
    let target = spec
        .sysroot
        .join(volume.mountpoint.trim_start_matches('/'));
    let mut options: Vec<&str> = vec!["rw"];
    options.extend(volume.options.iter().map(|s| s.as_str()));
    config.mounter.mount(&device, &target, &fstype, &options)?;
    fstab.push(FstabEntry {
        device: volume.device.clone(),
        mountpoint: volume.mountpoint.clone(),
        fstype,
        options: if volume.options.is_empty() {
            "defaults".to_string()
        } else {
            volume.options.join(",")
        },
    });
    Ok(())
}

fn write_fstab(spec: &MountSpec, entries: &[FstabEntry]) -> Result<()> {
    let mut content = String::new();
    for entry in entries {
        content.push_str(&entry.line());
        content.push('\n');
    }
    write_file_with_dirs(spec.sysroot.join("etc/fstab"), content)
        .context("failed writing fstab")
}

fn write_mode_sentinel(mode: MountMode) -> Result<()> {
    let name = format!("{}_mode", mode);
    if let Err(e) = write_file_with_dirs(Path::new(constants::RUN_ELEMENTAL_DIR).join(&name), "") {
        tracing::warn!("could not write the {} sentinel: {}", name, e);
        return Ok(());
    }
    // the legacy tree is kept in sync for older tooling
    let _ = write_file_with_dirs(Path::new("/run/cos").join(&name), "");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mounter::Mounter;
    use crate::testing::{FakeMounter, FakeRunner};
    use std::rc::Rc;
    use tempfile::TempDir;

    fn mount_env() -> (Config, Rc<FakeRunner>, Rc<FakeMounter>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_tests();
        let runner = Rc::new(FakeRunner::default());
        let mounter = Rc::new(FakeMounter::default());
        runner.on_output("blkid", "-L COS_PERSISTENT", "/dev/sda5");
        runner.on_output("blkid", "-L COS_OEM", "/dev/sda2");
        runner.on_output("blkid", "TYPE /dev/sda5", "ext4");
        runner.on_output("blkid", "TYPE /dev/sda2", "ext4");
        config.runner = Box::new(runner.clone());
        config.mounter = Box::new(mounter.clone());
        (config, runner, mounter, tmp)
    }

    fn test_spec(tmp: &TempDir) -> MountSpec {
        let mut spec = MountSpec::default();
        spec.sysroot = tmp.path().join("sysroot");
        spec.overlay_dir = tmp.path().join("overlay");
        spec.persistent.volume.mountpoint = tmp
            .path()
            .join("persistent")
            .to_string_lossy()
            .into_owned();
        spec
    }

    #[test]
    fn test_mount_active_composes_layers() {
        let (config, _runner, mounter, tmp) = mount_env();
        let mut spec = test_spec(&tmp);
        // sysroot is pre-mounted by the initramfs in this scenario
        mounter
            .mount("/dev/loop0", &spec.sysroot, "ext2", &["ro"])
            .unwrap();

        run_mount(&config, &mut spec).unwrap();

        let mounts = mounter.mounts();
        assert!(mounts
            .iter()
            .any(|(src, tgt, _)| src == "tmpfs" && *tgt == spec.overlay_dir));
        // persistent overlays land on the sysroot paths
        assert!(mounts
            .iter()
            .any(|(src, tgt, _)| src == "overlay" && *tgt == spec.sysroot.join("etc")));
        let fstab = std::fs::read_to_string(spec.sysroot.join("etc/fstab")).unwrap();
        assert!(fstab.contains("tmpfs"));
        assert!(fstab.contains("LABEL=COS_PERSISTENT"));
        assert!(fstab.contains("LABEL=COS_OEM"));
    }

    #[test]
    fn test_recovery_mode_skips_persistent() {
        let (config, _runner, mounter, tmp) = mount_env();
        let mut spec = test_spec(&tmp);
        spec.mode = MountMode::Recovery;
        spec.write_fstab = false;
        spec.volumes.clear();
        mounter
            .mount("/dev/loop1", &spec.sysroot, "squashfs", &["ro"])
            .unwrap();

        run_mount(&config, &mut spec).unwrap();

        let mounts = mounter.mounts();
        assert!(!mounts
            .iter()
            .any(|(src, _, _)| src.contains("COS_PERSISTENT") || src.contains("persistent")));
    }

    #[test]
    fn test_bind_mode_binds_state_dirs() {
        let (config, _runner, mounter, tmp) = mount_env();
        let mut spec = test_spec(&tmp);
        spec.persistent.mode = PersistentMode::Bind;
        spec.persistent.paths = vec!["/var/lib".to_string()];
        spec.write_fstab = false;
        spec.volumes.clear();
        mounter
            .mount("/dev/loop0", &spec.sysroot, "ext2", &["ro"])
            .unwrap();

        run_mount(&config, &mut spec).unwrap();

        let mounts = mounter.mounts();
        let bind = mounts
            .iter()
            .find(|(_, tgt, _)| *tgt == spec.sysroot.join("var/lib"))
            .expect("bind mount present");
        assert!(bind.0.ends_with("var-lib.bind"));
        assert!(bind.2.contains("bind"));
    }

    #[test]
    fn test_disabled_spec_is_a_noop() {
        let (config, _runner, mounter, tmp) = mount_env();
        let mut spec = test_spec(&tmp);
        spec.disable = true;
        run_mount(&config, &mut spec).unwrap();
        assert!(mounter.mounts().is_empty());
    }

    #[test]
    fn test_block_overlay_formats_device() {
        let (config, runner, mounter, tmp) = mount_env();
        let mut spec = test_spec(&tmp);
        spec.ephemeral.kind = EphemeralKind::Block;
        spec.ephemeral.device = "/dev/vdb".to_string();
        spec.write_fstab = false;
        spec.volumes.clear();
        spec.persistent.volume.device = String::new();
        mounter
            .mount("/dev/loop0", &spec.sysroot, "ext2", &["ro"])
            .unwrap();

        run_mount(&config, &mut spec).unwrap();
        assert!(runner.called_with("mkfs.ext4", "/dev/vdb"));
    }
}
