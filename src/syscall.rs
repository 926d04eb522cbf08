//! Host control syscalls: reboot, poweroff and filesystem sync.

use anyhow::{Context, Result};
use nix::sys::reboot::{reboot, RebootMode};
use nix::unistd::sync;
use std::fmt;

/// Host-level finalization calls, faked in tests.
pub trait Syscall: fmt::Debug {
    fn reboot(&self) -> Result<()>;
    fn power_off(&self) -> Result<()>;
    fn sync(&self);
}

/// Production implementation using reboot(2).
#[derive(Debug, Default)]
pub struct SystemSyscall;

impl Syscall for SystemSyscall {
    fn reboot(&self) -> Result<()> {
        sync();
        reboot(RebootMode::RB_AUTOBOOT).context("reboot syscall failed")?;
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        sync();
        reboot(RebootMode::RB_POWER_OFF).context("poweroff syscall failed")?;
        Ok(())
    }

    fn sync(&self) {
        sync();
    }
}
