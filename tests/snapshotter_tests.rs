//! Snapshotter contract tests for both backends: monotonic ids, atomic
//! failure handling and retention.

mod helpers;

use std::fs;

use helpers::{faked_config, script_loop_device_commands, TestEnv};
use elemental::bootloader::Grub;
use elemental::constants;
use elemental::snapshotter::{new_snapshotter, BtrfsSnapshotter, Snapshotter};
use elemental::types::{ImageSource, SnapshotterConfig, SnapshotterKind};

fn loop_config(env: &TestEnv) -> SnapshotterConfig {
    SnapshotterConfig {
        kind: SnapshotterKind::LoopDevice,
        size: 8,
        work_mount: Some(env.work_mount.clone()),
        ..Default::default()
    }
}

fn btrfs_config(env: &TestEnv) -> SnapshotterConfig {
    SnapshotterConfig {
        kind: SnapshotterKind::Btrfs,
        work_mount: Some(env.work_mount.clone()),
        ..Default::default()
    }
}

#[test]
fn test_loop_device_commit_swaps_images_atomically() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    script_loop_device_commands(&fakes.runner);
    let grub = Grub::new(&config);
    let mut snapshotter = new_snapshotter(&config, loop_config(&env), &grub).unwrap();

    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let mut snapshot = snapshotter.start_transaction().unwrap();
    assert_eq!(snapshot.id, 1);
    assert!(snapshot.in_progress);
    let images = env.state.join(constants::IMAGES_SUBDIR);
    assert!(images.join(constants::TRANSITION_IMG_FILE).exists());

    snapshotter.close_transaction(&mut snapshot).unwrap();
    assert!(!snapshot.in_progress);
    assert!(images.join(constants::ACTIVE_IMG_FILE).exists());
    // the first deployment seeds the fallback image
    assert!(images.join(constants::PASSIVE_IMG_FILE).exists());
    assert!(!images.join(constants::TRANSITION_IMG_FILE).exists());
    assert_eq!(snapshotter.active_id(), 1);
    assert!(fakes.runner.called_with("tune2fs", "-L COS_PASSIVE"));
    assert!(fakes.runner.called_with("grub2-editenv", "snapshotter=loop-device"));
}

#[test]
fn test_loop_device_ids_are_monotonic() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    script_loop_device_commands(&fakes.runner);
    let grub = Grub::new(&config);
    let mut snapshotter = new_snapshotter(&config, loop_config(&env), &grub).unwrap();
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let mut previous = 0;
    for _ in 0..3 {
        let mut snapshot = snapshotter.start_transaction().unwrap();
        assert!(snapshot.id > previous, "ids must strictly increase");
        previous = snapshot.id;
        snapshotter.close_transaction(&mut snapshot).unwrap();
        // at most two durable deployments
        assert!(snapshotter.get_snapshots().unwrap().len() <= 2);
    }
    assert_eq!(snapshotter.active_id(), 3);
    assert_eq!(snapshotter.get_snapshots().unwrap(), vec![2, 3]);
}

#[test]
fn test_loop_device_failed_transaction_leaves_no_trace() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    script_loop_device_commands(&fakes.runner);
    let grub = Grub::new(&config);
    let mut snapshotter = new_snapshotter(&config, loop_config(&env), &grub).unwrap();
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let mut first = snapshotter.start_transaction().unwrap();
    snapshotter.close_transaction(&mut first).unwrap();
    let before = snapshotter.get_snapshots().unwrap();
    let active_before = snapshotter.active_id();

    let second = snapshotter.start_transaction().unwrap();
    snapshotter.close_transaction_on_error(&second).unwrap();

    assert_eq!(snapshotter.get_snapshots().unwrap(), before);
    assert_eq!(snapshotter.active_id(), active_before);
    assert!(!env
        .state
        .join(constants::IMAGES_SUBDIR)
        .join(constants::TRANSITION_IMG_FILE)
        .exists());
}

#[test]
fn test_loop_device_only_one_open_transaction() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    script_loop_device_commands(&fakes.runner);
    let grub = Grub::new(&config);
    let mut snapshotter = new_snapshotter(&config, loop_config(&env), &grub).unwrap();
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let _snapshot = snapshotter.start_transaction().unwrap();
    let err = snapshotter.start_transaction().unwrap_err();
    assert!(err.to_string().contains("transaction already in progress"));
}

#[test]
fn test_loop_device_snapshot_source_is_the_image_file() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    script_loop_device_commands(&fakes.runner);
    let grub = Grub::new(&config);
    let mut snapshotter = new_snapshotter(&config, loop_config(&env), &grub).unwrap();
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let mut snapshot = snapshotter.start_transaction().unwrap();
    snapshotter.close_transaction(&mut snapshot).unwrap();

    let source = snapshotter.snapshot_to_image_source(&snapshot).unwrap();
    match source {
        ImageSource::File(path) => {
            assert!(path.ends_with("cOS/active.img"));
        }
        other => panic!("unexpected source {:?}", other),
    }
}

#[test]
fn test_btrfs_first_transaction_initializes_partition() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    // pristine partition: no default subvolume resolvable yet
    fakes.runner.set_output("btrfs", "get-default", "ID 5 gen 4 top level 0 path ");
    fakes
        .runner
        .set_output("btrfs", "subvolume list", "ID 257 gen 7 top level 5 path @");
    let grub = Grub::new(&config);
    let mut snapshotter = BtrfsSnapshotter::new(&config, btrfs_config(&env), &grub);

    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();
    assert!(fakes.runner.called_with("btrfs", "subvolume create"));
    assert!(fakes.runner.called_with("btrfs", "set-default 257"));
    // the state partition gets remounted at the top level subvolume
    assert!(fakes
        .mounter
        .mounts()
        .iter()
        .any(|(_, _, opts)| opts.contains("subvol=@")));

    // no snapshots yet: the first transaction creates snapshot 1
    fakes.runner.set_output("btrfs", "subvolume list", "");
    let snapshot = snapshotter.start_transaction().unwrap();
    assert_eq!(snapshot.id, 1);
    assert_eq!(snapshot.work_dir, snapshot.path);
    assert!(snapshot
        .path
        .to_string_lossy()
        .ends_with(".snapshots/1/snapshot"));
}

#[test]
fn test_btrfs_upgrade_transaction_commits_and_prunes() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    let root = env.state.to_string_lossy().into_owned();
    fakes.runner.set_output(
        "btrfs",
        "get-default",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    fakes.runner.set_output(
        "btrfs",
        "subvolume list",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    let grub = Grub::new(&config);
    let mut snapshotter = BtrfsSnapshotter::new(&config, btrfs_config(&env), &grub);
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();
    assert_eq!(snapshotter.active_id(), 1);

    let mut snapshot = snapshotter.start_transaction().unwrap();
    assert_eq!(snapshot.id, 2, "ids keep increasing");
    assert!(snapshot
        .work_dir
        .to_string_lossy()
        .ends_with("snapshot.workDir"));

    // the new snapshot becomes visible to the subvolume listing
    fakes.runner.set_output(
        "btrfs",
        "subvolume list",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot\n\
         ID 261 gen 95 top level 258 path @/.snapshots/2/snapshot\n",
    );
    snapshotter.close_transaction(&mut snapshot).unwrap();

    assert_eq!(snapshotter.active_id(), 2);
    assert!(fakes.runner.called_with("btrfs", "property set"));
    assert!(fakes.runner.called_with("btrfs", "set-default 261"));
    assert!(fakes.runner.called_with("rsync", &root));
    assert!(fakes.runner.called_with("grub2-editenv", "passive_snapshots=1"));
    assert!(fakes.runner.called_with("grub2-editenv", "fallback=0 1 recovery"));
}

#[test]
fn test_btrfs_failed_transaction_deletes_the_snapshot() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    fakes.runner.set_output(
        "btrfs",
        "get-default",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    fakes.runner.set_output(
        "btrfs",
        "subvolume list",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    let grub = Grub::new(&config);
    let mut snapshotter = BtrfsSnapshotter::new(&config, btrfs_config(&env), &grub);
    let mut state = env.partitions().state.unwrap();
    snapshotter.init(&mut state, &env.efi).unwrap();

    let snapshot = snapshotter.start_transaction().unwrap();
    assert_eq!(snapshot.id, 2);
    assert!(env.state.join(".snapshots/2").exists());
    snapshotter.close_transaction_on_error(&snapshot).unwrap();

    assert!(!env.state.join(".snapshots/2").exists());
    assert_eq!(snapshotter.active_id(), 1, "active deployment is untouched");
}

#[test]
fn test_btrfs_snapshot_source_is_the_subvolume() {
    let env = TestEnv::new();
    let (config, fakes) = faked_config();
    fakes.runner.set_output(
        "btrfs",
        "get-default",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    fakes.runner.set_output(
        "btrfs",
        "subvolume list",
        "ID 259 gen 90 top level 258 path @/.snapshots/1/snapshot",
    );
    let grub = Grub::new(&config);
    let snapshotter = BtrfsSnapshotter::new(&config, btrfs_config(&env), &grub);

    let path = env.state.join(".snapshots/1/snapshot");
    fs::create_dir_all(&path).unwrap();
    let snapshot = elemental::snapshotter::Snapshot {
        id: 1,
        path: path.clone(),
        work_dir: path.clone(),
        ..Default::default()
    };
    match snapshotter.snapshot_to_image_source(&snapshot).unwrap() {
        ImageSource::Dir(dir) => assert_eq!(dir, path),
        other => panic!("unexpected source {:?}", other),
    }
}
