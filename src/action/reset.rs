//! The reset action: from the recovery system, reformat the mutable
//! partitions and redeploy the system like a fresh install, without
//! touching the partition table.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use tracing::info;

use super::{
    boot_mode, finalize, mount_partitions, run_chroot_hook, run_hook, unmount_partitions,
    with_snapshot_root, write_install_state, BootMode,
};
use crate::bootloader::Grub;
use crate::config::{Config, RunConfig};
use crate::constants;
use crate::partitioner;
use crate::process::run_checked;
use crate::snapshotter::{new_snapshotter, Snapshotter};
use crate::source;
use crate::types::{
    ElementalPartitions, Firmware, FsKind, InstallState, Partition, PartitionState, ResetSpec,
    SystemState,
};

pub fn run_reset(run_config: &RunConfig, spec: &mut ResetSpec) -> Result<()> {
    spec.efi = spec.efi || Firmware::detect() == Firmware::Efi;
    run_reset_from(run_config, spec, boot_mode())
}

/// Reset entry point with an explicit boot mode, also used by tests.
pub fn run_reset_from(run_config: &RunConfig, spec: &mut ResetSpec, mode: BootMode) -> Result<()> {
    let config = &run_config.config;
    if mode != BootMode::Recovery {
        bail!("reset can only run from the recovery system");
    }

    if spec.state.is_none() {
        spec.state = InstallState::load().ok();
    }
    if spec.partitions.state.is_none() {
        let detected = partitioner::detect_partitions(config.runner.as_ref())
            .context("reset failed discovering partitions")?;
        spec.partitions = ElementalPartitions::from_list(&detected, spec.state.as_ref());
        spec.partitions.normalize();
    }
    // reset reinstalls the bootloader on the disk the system lives on
    if spec.target.is_empty() {
        spec.target = spec
            .partitions
            .state
            .as_ref()
            .map(|p| p.disk.clone())
            .unwrap_or_default();
    }
    spec.sanitize().context("invalid reset spec")?;
    info!("Resetting the system");

    run_hook(config, constants::BEFORE_RESET_HOOK)?;

    reformat_mutable_partitions(config, spec)?;
    mount_partitions(config, &spec.partitions)?;
    let result = reset_deployment(run_config, spec);
    unmount_partitions(config, &spec.partitions);
    result?;

    run_hook(config, constants::AFTER_RESET_HOOK)?;
    finalize(run_config)
}

fn reformat(config: &Config, partition: &Partition) -> Result<()> {
    let device = partition
        .path
        .clone()
        .with_context(|| format!("partition {} has no device", partition.name))?;
    if let Some(mount) = partition.mount_point.as_ref() {
        if config.mounter.is_mounted(mount)? {
            config.mounter.unmount(mount)?;
        }
    }
    info!("Formatting {} partition", partition.name);
    let device_str = device.to_string_lossy().into_owned();
    let label = partition.filesystem_label.as_str();
    let (program, mut args): (&str, Vec<&str>) = match partition.fs {
        FsKind::Btrfs => ("mkfs.btrfs", vec!["-f"]),
        FsKind::Vfat => ("mkfs.vfat", vec!["-F", "32"]),
        FsKind::Ext2 => ("mkfs.ext2", vec!["-F"]),
        _ => ("mkfs.ext4", vec!["-F"]),
    };
    if !label.is_empty() {
        if partition.fs == FsKind::Vfat {
            args.extend(["-n", label]);
        } else {
            args.extend(["-L", label]);
        }
    }
    args.push(&device_str);
    run_checked(
        config.runner.as_ref(),
        program,
        &args,
        &format!("failed formatting {}", partition.name),
    )
    .map(|_| ())
}

fn reformat_mutable_partitions(config: &Config, spec: &ResetSpec) -> Result<()> {
    let state = spec
        .partitions
        .state
        .as_ref()
        .context("undefined state partition")?;
    reformat(config, state).context("reset failed formatting the state partition")?;

    if spec.format_persistent {
        if let Some(persistent) = spec.partitions.persistent.as_ref() {
            reformat(config, persistent)
                .context("reset failed formatting the persistent partition")?;
        }
    }
    if spec.format_oem {
        if let Some(oem) = spec.partitions.oem.as_ref() {
            reformat(config, oem).context("reset failed formatting the OEM partition")?;
        }
    }
    Ok(())
}

fn reset_deployment(run_config: &RunConfig, spec: &mut ResetSpec) -> Result<()> {
    let config = &run_config.config;
    let state_part = spec
        .partitions
        .state
        .clone()
        .context("undefined state partition")?;
    let state_mount = state_part
        .mount_point
        .clone()
        .context("state partition is not mounted")?;
    let boot_mount = spec
        .partitions
        .boot
        .as_ref()
        .and_then(|p| p.mount_point.clone());
    let env_dir = Grub::env_dir(boot_mount.as_ref(), &state_mount);

    let snap_config = spec
        .state
        .as_ref()
        .map(|s| s.snapshotter.clone())
        .unwrap_or_else(|| run_config.snapshotter.clone());
    let grub = Grub::new(config);
    let mut snapshotter = new_snapshotter(config, snap_config.clone(), &grub)?;
    let mut state_part_mut = state_part.clone();
    snapshotter
        .init(&mut state_part_mut, &env_dir)
        .context("reset failed initializing the snapshotter")?;

    let mut snapshot = snapshotter
        .start_transaction()
        .context("reset failed starting the transaction")?;
    snapshot.labels = spec.snapshot_labels.clone();

    info!("Copying {} image...", constants::ACTIVE_LABEL);
    let populate = source::unpack(config, &spec.system, &snapshot.work_dir)
        .context("reset failed during extract")
        .and_then(|digest| {
            run_chroot_hook(config, &snapshot.work_dir, constants::AFTER_RESET_CHROOT_HOOK)?;
            Ok(digest)
        });
    let digest = match populate {
        Ok(digest) => digest,
        Err(e) => {
            let _ = snapshotter.close_transaction_on_error(&snapshot);
            return Err(e);
        }
    };
    snapshotter
        .close_transaction(&mut snapshot)
        .context("reset failed during commit")?;

    // persist the state file first: the bootloader must never see a default
    // pointing at a snapshot with no state entry
    let state = rebuilt_install_state(spec, &snap_config, snapshot.id, digest);
    write_install_state(&state, &spec.partitions)
        .context("reset failed persisting the state file")?;
    spec.state = Some(state);

    if spec.efi && !spec.target.is_empty() {
        with_snapshot_root(config, snapshotter.as_ref(), &snapshot, |root| {
            grub.install(
                root,
                &state_mount,
                boot_mount.as_deref(),
                &spec.target,
                Firmware::Efi,
                spec.disable_boot_entry,
            )
        })
        .context("reset failed during bootloader setup")?;
    }
    grub.set_default_entry(&env_dir, &spec.grub_def_entry)?;
    Ok(())
}

fn rebuilt_install_state(
    spec: &ResetSpec,
    snap_config: &crate::types::SnapshotterConfig,
    snapshot_id: u32,
    digest: Option<String>,
) -> InstallState {
    let date = crate::types::now_stamp();
    // start from the previous state so the recovery entry survives
    let mut state = spec.state.clone().unwrap_or_default();
    state.date = date.clone();
    state.snapshotter = snap_config.clone();

    let mut snapshots = BTreeMap::new();
    snapshots.insert(
        snapshot_id,
        SystemState {
            source: Some(spec.system.clone()),
            digest,
            active: true,
            label: String::new(),
            fs: None,
            labels: spec.snapshot_labels.clone(),
            date,
            from_action: "reset".to_string(),
        },
    );
    state.partitions.insert(
        constants::STATE_PART_NAME.to_string(),
        PartitionState {
            fs_label: spec
                .partitions
                .state
                .as_ref()
                .map(|p| p.filesystem_label.clone())
                .unwrap_or_else(|| constants::STATE_LABEL.to_string()),
            snapshots,
            ..Default::default()
        },
    );
    state
}
