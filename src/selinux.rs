//! SELinux relabeling of freshly populated system trees.
//!
//! Relabeling runs `setfiles` chrooted into the target so the target's own
//! policy is applied. Systems without a policy are silently skipped.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::process::run_checked;

const FILE_CONTEXTS: &str = "etc/selinux/targeted/contexts/files/file_contexts";

/// Relabel the given root tree. `extra_binds` are (source, target-in-root)
/// pairs mounted for the duration of the relabel, e.g. the real snapshots
/// subvolume of a btrfs deployment.
pub fn relabel(config: &Config, root: &Path, extra_binds: &[(PathBuf, String)]) -> Result<()> {
    let contexts = root.join(FILE_CONTEXTS);
    if !contexts.exists() {
        debug!("No SELinux policy in {}, skipping relabel", root.display());
        return Ok(());
    }
    info!("Relabeling {}", root.display());

    let mut mounted: Vec<PathBuf> = Vec::new();
    let mut mount_all = || -> Result<()> {
        for dir in ["proc", "sys", "dev"] {
            let target = root.join(dir);
            config.mounter.mount(&format!("/{}", dir), &target, "", &["bind"])?;
            mounted.push(target);
        }
        for (source, target) in extra_binds {
            let target = root.join(target.trim_start_matches('/'));
            config
                .mounter
                .mount(&source.to_string_lossy(), &target, "", &["bind"])?;
            mounted.push(target);
        }
        Ok(())
    };

    let result = mount_all().and_then(|_| {
        let root_str = root.to_string_lossy();
        run_checked(
            config.runner.as_ref(),
            "chroot",
            &[
                &root_str,
                "setfiles",
                "-i",
                "-F",
                &format!("/{}", FILE_CONTEXTS),
                "/",
            ],
            "setfiles failed",
        )
        .map(|_| ())
    });

    for target in mounted.iter().rev() {
        if let Err(e) = config.mounter.unmount(target) {
            warn!("failed unmounting {}: {}", target.display(), e);
        }
    }
    result
}
