//! Immutable OS lifecycle engine.
//!
//! Installs, upgrades, resets and recovers systems whose root filesystem is
//! delivered as a read-only image. The deployment engine transforms a
//! declarative action spec plus an image source into an atomically committed
//! on-disk state: partition planning, image materialization, snapshot
//! versioning and the boot fallback contract with the initramfs stage.

pub mod action;
pub mod bootloader;
pub mod cloudinit;
pub mod config;
pub mod constants;
pub mod fsutils;
pub mod http;
pub mod logging;
pub mod mounter;
pub mod partitioner;
pub mod process;
pub mod selinux;
pub mod snapshotter;
pub mod source;
pub mod syscall;
pub mod testing;
pub mod types;
