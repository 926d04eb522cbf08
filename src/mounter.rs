//! Mount and unmount operations behind a fakeable trait.
//!
//! The production implementation issues mount(2)/umount(2) directly. Option
//! strings follow mount(8): known flag words are translated to mount flags,
//! everything else is passed through as filesystem data.

use anyhow::{Context, Result};
use nix::mount::{mount, umount, MsFlags};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Mount operations used across the engine.
pub trait Mounter: fmt::Debug {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Whether the target path is a mountpoint right now.
    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

/// Production mounter issuing real syscalls.
#[derive(Debug, Default)]
pub struct SystemMounter;

fn split_options(options: &[&str]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for opt in options {
        match *opt {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => (),
            "remount" => flags |= MsFlags::MS_REMOUNT,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            other => data.push(other.to_string()),
        }
    }
    (flags, data.join(","))
}

impl Mounter for SystemMounter {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &[&str]) -> Result<()> {
        debug!(
            "Mounting {} at {} type {} ({})",
            source,
            target.display(),
            fstype,
            options.join(",")
        );
        fs::create_dir_all(target)?;
        let (flags, data) = split_options(options);
        let fstype = if fstype.is_empty() { None } else { Some(fstype) };
        let data = if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        };
        mount(Some(source), target, fstype, flags, data)
            .with_context(|| format!("failed mounting {} at {}", source, target.display()))?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        debug!("Unmounting {}", target.display());
        umount(target).with_context(|| format!("failed unmounting {}", target.display()))?;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        let target = target.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|mnt| mnt == target))
    }
}
