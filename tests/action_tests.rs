//! End to end action pipelines over fully faked collaborators: install,
//! upgrade and reset against a loop device deployment.

mod helpers;

use std::fs;

use helpers::{faked_run_config, script_loop_device_commands, TestEnv};
use elemental::action::{run_install, run_reset_from, run_upgrade, BootMode};
use elemental::constants;
use elemental::types::{
    Firmware, ImageSource, InstallSpec, InstallState, PartTable, ResetSpec, UpgradeSpec,
};

fn install_spec(env: &TestEnv) -> InstallSpec {
    InstallSpec {
        target: "/dev/sda".to_string(),
        firmware: Firmware::Bios,
        part_table: PartTable::Msdos,
        partitions: env.partitions(),
        system: ImageSource::Oci("registry.io/os:v1".to_string()),
        no_format: true,
        ..Default::default()
    }
}

fn installed_state(env: &TestEnv) -> InstallState {
    InstallState::load_from(&[env.state.clone()]).expect("state file written")
}

#[test]
fn test_install_produces_consistent_state() {
    let env = TestEnv::new();
    let (run_config, fakes) = faked_run_config(&env);
    script_loop_device_commands(&fakes.runner);

    let mut spec = install_spec(&env);
    run_install(&run_config, &mut spec).unwrap();

    // both deployments exist on the state partition
    let images = env.state.join(constants::IMAGES_SUBDIR);
    assert!(images.join(constants::ACTIVE_IMG_FILE).exists());
    assert!(images.join(constants::PASSIVE_IMG_FILE).exists());
    // the recovery partition holds its own image
    assert!(env
        .recovery
        .join(constants::IMAGES_SUBDIR)
        .join(constants::RECOVERY_IMG_FILE)
        .exists());

    // the state file lands on both partitions, header first
    let raw = fs::read_to_string(env.state.join(constants::INSTALL_STATE_FILE)).unwrap();
    assert!(raw.starts_with(constants::INSTALL_STATE_HEADER));
    assert!(env.recovery.join(constants::INSTALL_STATE_FILE).exists());

    // exactly one active snapshot is recorded
    let state = installed_state(&env);
    let snapshots = &state.partitions[constants::STATE_PART_NAME].snapshots;
    assert_eq!(snapshots.values().filter(|s| s.active).count(), 1);
    assert_eq!(state.active_snapshot(), Some(1));
    assert_eq!(snapshots[&1].from_action, "install");
    assert_eq!(
        snapshots[&1].digest.as_deref(),
        Some("sha256:fakedigest"),
        "digest reported by the extractor is recorded"
    );
    let recovery_entry = state.partitions[constants::RECOVERY_PART_NAME]
        .recovery_image
        .as_ref()
        .unwrap();
    assert_eq!(recovery_entry.from_action, "install");

    // hooks ran at their fixed points
    assert_eq!(
        fakes.cloud_init.stages(),
        vec!["before-install", "after-install"]
    );
    assert!(fakes
        .runner
        .called_with("chroot", constants::AFTER_INSTALL_CHROOT_HOOK));
    // BIOS firmware installs grub on the target disk
    assert!(fakes.runner.called_with("grub2-install", "/dev/sda"));
    // no reboot was requested
    assert!(!*fakes.syscall.rebooted.borrow());
}

#[test]
fn test_install_requires_a_source() {
    let env = TestEnv::new();
    let (run_config, _fakes) = faked_run_config(&env);
    let mut spec = install_spec(&env);
    spec.system = ImageSource::Empty;
    let err = run_install(&run_config, &mut spec).unwrap_err();
    assert!(err.to_string().contains("invalid install spec"));
}

#[test]
fn test_failed_extract_rolls_back_the_transaction() {
    let env = TestEnv::new();
    let (mut run_config, fakes) = faked_run_config(&env);
    script_loop_device_commands(&fakes.runner);
    // the extractor blows up after the transaction started
    run_config.config.extractor = Box::new(BrokenExtractor);

    let mut spec = install_spec(&env);
    let err = run_install(&run_config, &mut spec).unwrap_err();
    assert!(err.to_string().contains("extract"));

    let images = env.state.join(constants::IMAGES_SUBDIR);
    assert!(!images.join(constants::ACTIVE_IMG_FILE).exists());
    assert!(!images.join(constants::TRANSITION_IMG_FILE).exists());
    assert!(!env.state.join(constants::INSTALL_STATE_FILE).exists());
}

#[derive(Debug)]
struct BrokenExtractor;

impl elemental::source::ImageExtractor for BrokenExtractor {
    fn extract(
        &self,
        _image_ref: &str,
        _dest: &std::path::Path,
        _platform: &elemental::types::Platform,
        _local: bool,
        _tls_verify: bool,
    ) -> anyhow::Result<String> {
        anyhow::bail!("registry unreachable")
    }
}

#[test]
fn test_upgrade_adds_a_snapshot_and_keeps_one_active() {
    let env = TestEnv::new();
    let (run_config, fakes) = faked_run_config(&env);
    script_loop_device_commands(&fakes.runner);

    let mut spec = install_spec(&env);
    run_install(&run_config, &mut spec).unwrap();

    let mut state = installed_state(&env);
    state.snapshotter.work_mount = Some(env.work_mount.clone());
    let mut upgrade = UpgradeSpec {
        system: ImageSource::Oci("registry.io/os:v2".to_string()),
        partitions: env.partitions(),
        state: Some(state),
        ..Default::default()
    };
    run_upgrade(&run_config, &mut upgrade).unwrap();

    let state = installed_state(&env);
    let snapshots = &state.partitions[constants::STATE_PART_NAME].snapshots;
    assert_eq!(
        snapshots.values().filter(|s| s.active).count(),
        1,
        "exactly one snapshot stays active"
    );
    assert_eq!(state.active_snapshot(), Some(2));
    assert_eq!(snapshots[&2].from_action, "upgrade");
    // the demoted deployment is still tracked
    assert!(snapshots.contains_key(&1));

    // upgrades arm one-shot boot assessment
    assert!(fakes
        .runner
        .called_with("grub2-editenv", "enable_boot_assessment=yes"));
    assert_eq!(
        fakes.cloud_init.stages(),
        vec![
            "before-install",
            "after-install",
            "before-upgrade",
            "after-upgrade"
        ]
    );
}

#[test]
fn test_recovery_only_upgrade_leaves_snapshots_alone() {
    let env = TestEnv::new();
    let (run_config, fakes) = faked_run_config(&env);
    script_loop_device_commands(&fakes.runner);

    let mut spec = install_spec(&env);
    run_install(&run_config, &mut spec).unwrap();
    let before = installed_state(&env);

    let source_dir = env._temp_dir.path().join("new-recovery");
    fs::create_dir_all(&source_dir).unwrap();
    let mut upgrade = UpgradeSpec {
        recovery_upgrade: true,
        system: ImageSource::Dir(source_dir.clone()),
        partitions: env.partitions(),
        state: Some(before.clone()),
        ..Default::default()
    };
    upgrade.recovery_system.source = ImageSource::Dir(source_dir);
    run_upgrade(&run_config, &mut upgrade).unwrap();

    let after = installed_state(&env);
    assert_eq!(
        after.partitions[constants::STATE_PART_NAME].snapshots,
        before.partitions[constants::STATE_PART_NAME].snapshots,
        "snapshots are untouched by a recovery-only upgrade"
    );
    let recovery_entry = after.partitions[constants::RECOVERY_PART_NAME]
        .recovery_image
        .as_ref()
        .unwrap();
    assert_eq!(recovery_entry.from_action, "upgrade-recovery");
    assert!(!fakes.cloud_init.stages().contains(&"before-upgrade".to_string()));
}

#[test]
fn test_reset_refuses_outside_recovery() {
    let env = TestEnv::new();
    let (run_config, _fakes) = faked_run_config(&env);
    let mut spec = ResetSpec {
        system: ImageSource::Oci("registry.io/os:v1".to_string()),
        partitions: env.partitions(),
        ..Default::default()
    };
    let err = run_reset_from(&run_config, &mut spec, BootMode::Active).unwrap_err();
    assert!(err.to_string().contains("recovery"));
}

#[test]
fn test_reset_reformats_and_redeploys() {
    let env = TestEnv::new();
    let (run_config, fakes) = faked_run_config(&env);
    script_loop_device_commands(&fakes.runner);

    let mut spec = install_spec(&env);
    run_install(&run_config, &mut spec).unwrap();
    let mut state = installed_state(&env);
    state.snapshotter.work_mount = Some(env.work_mount.clone());

    let mut reset = ResetSpec {
        system: ImageSource::Oci("registry.io/os:v1".to_string()),
        format_persistent: true,
        partitions: env.partitions(),
        state: Some(state),
        ..Default::default()
    };
    run_reset_from(&run_config, &mut reset, BootMode::Recovery).unwrap();

    assert_eq!(
        reset.target, "/dev/sda",
        "target is derived from the state partition disk"
    );
    assert!(fakes.runner.called_with("mkfs.ext4", "-L COS_STATE /dev/sda4"));
    assert!(fakes
        .runner
        .called_with("mkfs.ext4", "-L COS_PERSISTENT /dev/sda5"));

    let state = installed_state(&env);
    let snapshots = &state.partitions[constants::STATE_PART_NAME].snapshots;
    assert_eq!(snapshots.values().filter(|s| s.active).count(), 1);
    let (_, active) = snapshots.iter().find(|(_, s)| s.active).unwrap();
    assert_eq!(active.from_action, "reset");
    assert!(fakes
        .cloud_init
        .stages()
        .contains(&"before-reset".to_string()));
}
