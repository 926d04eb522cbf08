//! The upgrade action: deploy a new snapshot on a running system, or
//! refresh the recovery image only.

use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::{
    deploy_recovery_image, finalize, run_chroot_hook, run_hook, upgrade_failed_sentinel,
    with_snapshot_root, write_install_state,
};
use crate::bootloader::Grub;
use crate::config::{Config, RunConfig};
use crate::constants;
use crate::partitioner;
use crate::snapshotter::{new_snapshotter, Snapshotter};
use crate::source;
use crate::types::{
    ElementalPartitions, InstallState, PartitionState, SystemState, UpgradeSpec,
};

pub fn run_upgrade(run_config: &RunConfig, spec: &mut UpgradeSpec) -> Result<()> {
    let config = &run_config.config;

    if upgrade_failed_sentinel(Path::new("/")) && !spec.force {
        bail!(
            "the previous upgrade was assessed as failed, refusing to \
             upgrade again without --force"
        );
    }

    if spec.state.is_none() {
        spec.state = InstallState::load()
            .map_err(|e| {
                warn!("could not load the install state: {}", e);
                e
            })
            .ok();
    }
    if spec.partitions.state.is_none() {
        let detected = partitioner::detect_partitions(config.runner.as_ref())
            .context("upgrade failed discovering partitions")?;
        spec.partitions = ElementalPartitions::from_list(&detected, spec.state.as_ref());
        spec.partitions.normalize();
    }
    ensure_mounted(config, &mut spec.partitions)?;

    if spec.recovery_upgrade {
        spec.sanitize_for_recovery_only()
            .context("invalid upgrade spec")?;
        info!("Upgrading the recovery system only");
        upgrade_recovery_only(run_config, spec)?;
        return finalize(run_config);
    }

    spec.sanitize().context("invalid upgrade spec")?;
    info!("Upgrading the system");
    run_hook(config, constants::BEFORE_UPGRADE_HOOK)?;
    upgrade_active(run_config, spec)?;
    run_hook(config, constants::AFTER_UPGRADE_HOOK)?;
    finalize(run_config)
}

/// Mount the state (and when present recovery and boot) partitions if they
/// are not mounted yet.
fn ensure_mounted(config: &Config, partitions: &mut ElementalPartitions) -> Result<()> {
    let mut ensure = |part: Option<&mut crate::types::Partition>| -> Result<()> {
        let Some(part) = part else { return Ok(()) };
        let Some(device) = part.path.clone() else {
            return Ok(());
        };
        let mount = match part.mount_point.clone() {
            Some(m) => m,
            None => return Ok(()),
        };
        if !config.mounter.is_mounted(&mount)? {
            config.mounter.mount(
                &device.to_string_lossy(),
                &mount,
                &part.fs.to_string(),
                &["rw"],
            )?;
        }
        Ok(())
    };
    ensure(partitions.state.as_mut())?;
    ensure(partitions.recovery.as_mut())?;
    ensure(partitions.boot.as_mut())?;
    Ok(())
}

fn upgrade_active(run_config: &RunConfig, spec: &mut UpgradeSpec) -> Result<()> {
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

    // keep using the snapshotter the system was installed with
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
        .context("upgrade failed initializing the snapshotter")?;

    let mut snapshot = snapshotter
        .start_transaction()
        .context("upgrade failed starting the transaction")?;
    snapshot.labels = spec.snapshot_labels.clone();

    info!("Copying {} image...", constants::ACTIVE_LABEL);
    let populate = source::unpack(config, &spec.system, &snapshot.work_dir)
        .context("upgrade failed during extract")
        .and_then(|digest| {
            run_chroot_hook(config, &snapshot.work_dir, constants::AFTER_UPGRADE_CHROOT_HOOK)?;
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
        .context("upgrade failed during commit")?;

    // persist the state file first: the bootloader must never see a default
    // pointing at a snapshot with no state entry
    let snapshots = snapshotter.get_snapshots()?;
    let state = updated_install_state(spec, &snap_config, snapshot.id, digest, &snapshots);
    write_install_state(&state, &spec.partitions)
        .context("upgrade failed persisting the state file")?;
    spec.state = Some(state);

    if spec.bootloader_upgrade {
        let boot_mount = boot_mount
            .clone()
            .context("undefined bootloader partition")?;
        with_snapshot_root(config, snapshotter.as_ref(), &snapshot, |root| {
            grub.install(
                root,
                &state_mount,
                Some(&boot_mount),
                "",
                crate::types::Firmware::Efi,
                true,
            )
        })
        .context("upgrade failed refreshing the bootloader")?;
    }
    grub.set_default_entry(&env_dir, &spec.grub_def_entry)?;
    // one-shot assessment: boot the new snapshot once, fall back on failure
    grub.set_single_shot_assessment(&state_mount)?;
    Ok(())
}

fn upgrade_recovery_only(run_config: &RunConfig, spec: &mut UpgradeSpec) -> Result<()> {
    let config = &run_config.config;
    let recovery_mount = spec
        .partitions
        .recovery
        .as_ref()
        .and_then(|p| p.mount_point.clone())
        .context("undefined recovery partition")?;

    let mut recovery_state = deploy_recovery_image(
        config,
        &spec.recovery_system.source,
        &recovery_mount,
        &spec.recovery_system,
    )
    .context("upgrade failed deploying the recovery system")?;
    recovery_state.from_action = "upgrade-recovery".to_string();

    let mut state = spec.state.clone().unwrap_or_default();
    state.date = crate::types::now_stamp();
    state
        .partitions
        .entry(constants::RECOVERY_PART_NAME.to_string())
        .or_insert_with(|| PartitionState {
            fs_label: constants::RECOVERY_LABEL.to_string(),
            ..Default::default()
        })
        .recovery_image = Some(recovery_state);
    write_install_state(&state, &spec.partitions)
        .context("upgrade failed persisting the state file")?;
    spec.state = Some(state);
    Ok(())
}

fn updated_install_state(
    spec: &UpgradeSpec,
    snap_config: &crate::types::SnapshotterConfig,
    new_id: u32,
    digest: Option<String>,
    current_ids: &[u32],
) -> InstallState {
    let mut state = spec.state.clone().unwrap_or_default();
    state.date = crate::types::now_stamp();
    state.snapshotter = snap_config.clone();

    let part_state = state
        .partitions
        .entry(constants::STATE_PART_NAME.to_string())
        .or_insert_with(|| PartitionState {
            fs_label: constants::STATE_LABEL.to_string(),
            ..Default::default()
        });
    for snapshot in part_state.snapshots.values_mut() {
        snapshot.active = false;
    }
    part_state.snapshots.insert(
        new_id,
        SystemState {
            source: Some(spec.system.clone()),
            digest,
            active: true,
            label: String::new(),
            fs: None,
            labels: spec.snapshot_labels.clone(),
            date: state.date.clone(),
            from_action: "upgrade".to_string(),
        },
    );
    // drop entries for snapshots the retention pass pruned
    part_state
        .snapshots
        .retain(|id, _| current_ids.contains(id) || *id == new_id);
    state
}
