//! The install action: partition a blank device and deploy the first
//! snapshot plus the recovery image onto it.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::info;

use super::{
    deploy_recovery_image, finalize, mount_partitions, run_chroot_hook, run_hook,
    unmount_partitions, with_snapshot_root, write_install_state,
};
use crate::bootloader::Grub;
use crate::config::RunConfig;
use crate::constants;
use crate::partitioner;
use crate::snapshotter::{new_snapshotter, Snapshotter};
use crate::source;
use crate::types::{
    InstallSpec, InstallState, PartitionState, SystemState,
};

pub fn run_install(run_config: &RunConfig, spec: &mut InstallSpec) -> Result<()> {
    let config = &run_config.config;
    spec.sanitize().context("invalid install spec")?;
    info!("Installing on device {}", spec.target);

    run_hook(config, constants::BEFORE_INSTALL_HOOK)?;

    if spec.no_format {
        info!("Skipping partitioning as requested");
    } else {
        info!("Partitioning device...");
        partitioner::partition_and_format(
            config,
            &spec.target,
            spec.part_table,
            &mut spec.partitions,
            &mut spec.extra_partitions,
        )
        .context("install failed during partitioning")?;
    }

    mount_partitions(config, &spec.partitions)?;
    let result = install_deployments(run_config, spec);
    unmount_partitions(config, &spec.partitions);
    result?;

    finalize(run_config)
}

fn install_deployments(run_config: &RunConfig, spec: &mut InstallSpec) -> Result<()> {
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
    let recovery_mount = spec
        .partitions
        .recovery
        .as_ref()
        .and_then(|p| p.mount_point.clone())
        .context("undefined recovery partition")?;
    let boot_mount = spec
        .partitions
        .boot
        .as_ref()
        .and_then(|p| p.mount_point.clone());
    let env_dir = Grub::env_dir(boot_mount.as_ref(), &state_mount);

    if let Some(oem_mount) = spec.partitions.oem.as_ref().and_then(|p| p.mount_point.clone()) {
        copy_cloud_config(config, &oem_mount, &spec.cloud_init)?;
    }

    let grub = Grub::new(config);
    let mut snapshotter = new_snapshotter(config, run_config.snapshotter.clone(), &grub)?;
    let mut state_part_mut = state_part.clone();
    snapshotter
        .init(&mut state_part_mut, &env_dir)
        .context("install failed initializing the snapshotter")?;

    let mut snapshot = snapshotter
        .start_transaction()
        .context("install failed starting the transaction")?;
    snapshot.labels = spec.snapshot_labels.clone();

    info!("Copying {} image...", constants::ACTIVE_LABEL);
    let populate = source::unpack(config, &spec.system, &snapshot.work_dir)
        .context("install failed during extract")
        .and_then(|digest| {
            run_chroot_hook(config, &snapshot.work_dir, constants::AFTER_INSTALL_CHROOT_HOOK)?;
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
        .context("install failed during commit")?;

    // the recovery image is a separate materialization; reuse the committed
    // snapshot when it comes from the same source to avoid a second pull
    let recovery_source = if spec.recovery_system.source == spec.system {
        snapshotter
            .snapshot_to_image_source(&snapshot)
            .unwrap_or_else(|_| spec.recovery_system.source.clone())
    } else {
        spec.recovery_system.source.clone()
    };
    let mut recovery_state =
        deploy_recovery_image(config, &recovery_source, &recovery_mount, &spec.recovery_system)
            .context("install failed deploying the recovery system")?;
    recovery_state.source = Some(spec.recovery_system.source.clone());
    recovery_state.from_action = "install".to_string();

    // the state file must be durable before the bootloader default can
    // point at the new snapshot
    let state = build_install_state(run_config, spec, snapshot.id, digest, recovery_state);
    write_install_state(&state, &spec.partitions)
        .context("install failed persisting the state file")?;

    with_snapshot_root(config, snapshotter.as_ref(), &snapshot, |root| {
        grub.install(
            root,
            &state_mount,
            boot_mount.as_deref(),
            &spec.target,
            spec.firmware,
            spec.disable_boot_entry,
        )
    })
    .context("install failed during bootloader setup")?;
    grub.set_default_entry(&env_dir, &spec.grub_def_entry)?;
    grub.enable_boot_assessment(&state_mount)?;

    run_hook(config, constants::AFTER_INSTALL_HOOK)?;
    Ok(())
}

/// Place the user provided cloud-init files on the OEM partition so the
/// installed system picks them up on first boot.
fn copy_cloud_config(
    config: &crate::config::Config,
    oem_mount: &std::path::Path,
    files: &[String],
) -> Result<()> {
    for (index, file) in files.iter().enumerate() {
        let name = format!("{}_custom.yaml", 90 + index);
        let dest = oem_mount.join(&name);
        if file.starts_with("http://") || file.starts_with("https://") {
            config.http.get_file(file, &dest)?;
        } else {
            std::fs::copy(file, &dest)
                .with_context(|| format!("cannot copy cloud config {}", file))?;
        }
        info!("Copied cloud config {}", name);
    }
    Ok(())
}

fn build_install_state(
    run_config: &RunConfig,
    spec: &InstallSpec,
    snapshot_id: u32,
    digest: Option<String>,
    recovery_state: SystemState,
) -> InstallState {
    let date = crate::types::now_stamp();
    let mut partitions: BTreeMap<String, PartitionState> = BTreeMap::new();

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
            date: date.clone(),
            from_action: "install".to_string(),
        },
    );

    let mut insert = |name: &str, label: Option<String>, state: PartitionState| {
        let mut state = state;
        if let Some(label) = label {
            state.fs_label = label;
        }
        partitions.insert(name.to_string(), state);
    };
    if let Some(boot) = &spec.partitions.boot {
        insert(
            constants::BOOT_PART_NAME,
            Some(boot.filesystem_label.clone()),
            PartitionState::default(),
        );
    }
    if let Some(oem) = &spec.partitions.oem {
        insert(
            constants::OEM_PART_NAME,
            Some(oem.filesystem_label.clone()),
            PartitionState::default(),
        );
    }
    if let Some(persistent) = &spec.partitions.persistent {
        insert(
            constants::PERSISTENT_PART_NAME,
            Some(persistent.filesystem_label.clone()),
            PartitionState::default(),
        );
    }
    if let Some(recovery) = &spec.partitions.recovery {
        insert(
            constants::RECOVERY_PART_NAME,
            Some(recovery.filesystem_label.clone()),
            PartitionState {
                recovery_image: Some(recovery_state),
                ..Default::default()
            },
        );
    }
    if let Some(state_part) = &spec.partitions.state {
        insert(
            constants::STATE_PART_NAME,
            Some(state_part.filesystem_label.clone()),
            PartitionState {
                snapshots,
                ..Default::default()
            },
        );
    }

    InstallState {
        date,
        snapshotter: run_config.snapshotter.clone(),
        partitions,
    }
}
