//! Core data model: partitions, images, action specs and install state.

pub mod image;
pub mod partition;
pub mod platform;
pub mod spec;
pub mod state;

pub use image::{Image, ImageSource};
pub use partition::{
    ElementalPartitions, Firmware, FsKind, PartTable, Partition, PartitionList,
};
pub use platform::Platform;
pub use spec::{
    DiskLayout, EphemeralKind, EphemeralMounts, InstallSpec, MountMode, MountSpec, PersistentMode,
    PersistentMounts, ResetSpec, UpgradeSpec, VolumeMount,
};
pub use state::{
    now_stamp, InstallState, PartitionState, SnapshotterConfig, SnapshotterKind, SystemState,
};
