//! Spec validation against realistic configuration inputs: layout files,
//! source URIs and boot-time mount specs.

use elemental::constants;
use elemental::types::{
    DiskLayout, EphemeralKind, Firmware, FsKind, ImageSource, InstallSpec, MountMode, MountSpec,
    PartTable, PersistentMode,
};

const LAYOUT_YAML: &str = r#"
partitions:
  oem:
    label: COS_OEM
    size: 10
    fs: ext4
  recovery:
    label: COS_RECOVERY
    size: 4000
    fs: ext2
  state:
    label: COS_STATE
    size: 8192
    fs: ext4
  persistent:
    label: COS_PERSISTENT
    size: 100
    fs: ext2
"#;

#[test]
fn test_layout_file_round_trip() {
    let layout: DiskLayout = serde_yaml::from_str(LAYOUT_YAML).unwrap();
    let mut partitions = layout.partitions;
    partitions.normalize();

    let state = partitions.state.as_ref().unwrap();
    assert_eq!(state.size, 8192);
    assert_eq!(state.fs, FsKind::Ext4);
    assert_eq!(state.filesystem_label, "COS_STATE");
    assert_eq!(state.name, constants::STATE_PART_NAME);

    let recovery = partitions.recovery.as_ref().unwrap();
    assert_eq!(recovery.size, 4000);
    assert_eq!(recovery.fs, FsKind::Ext2);

    let persistent = partitions.persistent.as_ref().unwrap();
    assert_eq!(persistent.size, 100);
    assert_eq!(persistent.fs, FsKind::Ext2);
}

#[test]
fn test_layout_install_order_is_stable() {
    let layout: DiskLayout = serde_yaml::from_str(LAYOUT_YAML).unwrap();
    let mut partitions = layout.partitions;
    partitions.normalize();
    partitions
        .set_firmware_partitions(Firmware::Bios, PartTable::Gpt)
        .unwrap();

    let names: Vec<String> = partitions
        .by_install_order(&[])
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(
        names,
        vec!["p.bios", "p.oem", "p.recovery", "p.state", "p.persistent"]
    );
}

#[test]
fn test_install_spec_from_yaml_section() {
    let yaml = r#"
target: /dev/vda
system: oci://registry.io/os:v2
grub-entry-name: myOS
snapshot-labels:
  flavor: green
"#;
    let mut spec: InstallSpec = serde_yaml::from_str(yaml).unwrap();
    assert_eq!(spec.target, "/dev/vda");
    assert_eq!(
        spec.system,
        ImageSource::Oci("registry.io/os:v2".to_string())
    );
    assert_eq!(spec.grub_def_entry, "myOS");
    assert_eq!(spec.snapshot_labels["flavor"], "green");

    // a partitionless spec picks up the default layout before sanitizing
    spec.partitions = elemental::types::ElementalPartitions::default_layout();
    spec.partitions.normalize();
    spec.firmware = Firmware::Efi;
    spec.part_table = PartTable::Gpt;
    spec.sanitize().unwrap();
    assert_eq!(spec.recovery_system.source, spec.system);
}

#[test]
fn test_mount_spec_defaults_cover_system_dirs() {
    let spec = MountSpec::default();
    for path in ["/etc", "/home", "/var"] {
        assert!(
            spec.persistent.paths.iter().any(|p| p == path),
            "{} should be persistent by default",
            path
        );
    }
    assert_eq!(spec.ephemeral.size, "25%");
    assert!(spec
        .persistent
        .volume
        .device
        .contains(constants::PERSISTENT_LABEL));
}

#[test]
fn test_mount_spec_from_yaml() {
    let yaml = r#"
sysroot: /sysroot
mode: passive
persistent:
  mode: bind
  paths:
    - /var/lib/extra
ephemeral:
  type: block
  device: /dev/vdb
  size: ""
"#;
    let mut spec: MountSpec = serde_yaml::from_str(yaml).unwrap();
    spec.sanitize().unwrap();
    assert_eq!(spec.mode, MountMode::Passive);
    assert_eq!(spec.persistent.mode, PersistentMode::Bind);
    assert_eq!(spec.persistent.paths, vec!["/var/lib/extra"]);
    assert_eq!(spec.ephemeral.kind, EphemeralKind::Block);
}

#[test]
fn test_source_uri_error_reports_scheme() {
    let err = ImageSource::from_uri("gopher://old/net").unwrap_err();
    assert!(err.to_string().contains("gopher"));
}
