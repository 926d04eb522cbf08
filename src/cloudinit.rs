//! Cloud-init hook execution.
//!
//! Hooks run at fixed points of every action (`before-install`,
//! `after-upgrade-chroot`, ...). The engine only knows stage names; the
//! actual execution is delegated to the system's cloud-init binary.

use anyhow::Result;
use std::fmt;
use std::process::Command;
use tracing::{debug, warn};

use crate::constants;

/// Stage runner for cloud-init style hooks.
pub trait CloudInitRunner: fmt::Debug {
    /// Run the given stage against the configured snippet directories.
    fn run_stage(&self, stage: &str, dirs: &[String]) -> Result<()>;
}

/// Production runner invoking the system cloud-init binary.
#[derive(Debug, Default)]
pub struct SystemCloudInit;

impl CloudInitRunner for SystemCloudInit {
    fn run_stage(&self, stage: &str, dirs: &[String]) -> Result<()> {
        debug!("Running cloud-init stage {}", stage);
        let status = Command::new(constants::CLOUD_INIT_BINARY)
            .arg(stage)
            .args(dirs)
            .status();
        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => {
                warn!("cloud-init stage {} exited with {}", stage, s);
                anyhow::bail!("cloud-init stage {} failed", stage)
            }
            Err(e) => {
                warn!("cloud-init binary unavailable: {}", e);
                anyhow::bail!("failed running cloud-init stage {}: {}", stage, e)
            }
        }
    }
}
