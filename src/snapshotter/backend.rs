//! Subvolume management backends for the btrfs snapshotter.
//!
//! The outer snapshotter is oblivious to whether subvolumes are handled by
//! direct `btrfs` commands or delegated to snapper; both implement
//! [`SubvolumeBackend`].

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Snapshot;
use crate::config::Config;
use crate::process::run_checked;
use crate::types::now_stamp;

pub const ROOT_SUBVOL: &str = "@";
pub const SNAPSHOTS_PATH: &str = ".snapshots";

/// Result of probing a state partition.
#[derive(Debug, Clone, Default)]
pub struct BackendStat {
    /// Active snapshot id, zero when uninitialized.
    pub active_id: u32,
    /// Mountpoint of the top-level subvolume, when mounted there.
    pub root_dir: Option<PathBuf>,
    /// Whether the partition carries the expected subvolume structure.
    pub initiated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotList {
    pub ids: Vec<u32>,
    pub active_id: u32,
}

/// Operations on the snapshot subvolumes of a state partition. `root` is
/// always the mountpoint of the top-level `@` subvolume.
pub trait SubvolumeBackend: fmt::Debug {
    fn probe(&self, device: &str, mountpoint: &Path) -> Result<BackendStat>;

    /// First-install initialization: create `@` and `@/.snapshots` and make
    /// `@` the default subvolume.
    fn init_partition(&self, mountpoint: &Path) -> Result<()>;

    /// Create snapshot `base_id + n` as a writable copy of the base, or an
    /// empty subvolume when `base_id` is zero.
    fn create_snapshot(&self, root: &Path, base_id: u32) -> Result<Snapshot>;

    /// Make the snapshot the default deployment.
    fn commit_snapshot(&self, root: &Path, snapshot: &Snapshot) -> Result<()>;

    fn list_snapshots(&self, root: &Path) -> Result<SnapshotList>;

    fn delete_snapshot(&self, root: &Path, id: u32) -> Result<()>;

    /// Apply retention: prune oldest snapshots beyond `max_snaps`, never
    /// touching the ids in `keep`.
    fn cleanup(&self, root: &Path, max_snaps: u32, keep: &[u32]) -> Result<()>;
}

pub fn snapshot_path(root: &Path, id: u32) -> PathBuf {
    root.join(SNAPSHOTS_PATH).join(id.to_string()).join("snapshot")
}

pub fn snapshot_work_dir(root: &Path, id: u32) -> PathBuf {
    root.join(SNAPSHOTS_PATH)
        .join(id.to_string())
        .join("snapshot.workDir")
}

/// Direct btrfs CLI backend. Snapshot metadata is emitted as `info.xml` so
/// externally run snapper commands keep working against the layout.
#[derive(Debug)]
pub struct BtrfsBackend<'a> {
    config: &'a Config,
}

impl<'a> BtrfsBackend<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn subvolume_id(&self, root: &Path, id: u32) -> Result<u32> {
        let root_str = root.to_string_lossy().into_owned();
        let result = run_checked(
            self.config.runner.as_ref(),
            "btrfs",
            &["subvolume", "list", &root_str],
            "btrfs subvolume list failed",
        )?;
        let re = Regex::new(r"ID (\d+) .*path .*\.snapshots/(\d+)/snapshot$").expect("static regex");
        for line in result.stdout.lines() {
            if let Some(cap) = re.captures(line.trim()) {
                if cap[2].parse::<u32>() == Ok(id) {
                    return cap[1]
                        .parse::<u32>()
                        .context("unparseable subvolume id");
                }
            }
        }
        bail!("no subvolume found for snapshot {}", id)
    }

    fn write_info_xml(&self, root: &Path, id: u32, description: &str) -> Result<()> {
        let info = format!(
            "<?xml version=\"1.0\"?>\n<snapshot>\n  <type>single</type>\n  <num>{}</num>\n  <date>{}</date>\n  <description>{}</description>\n  <cleanup>number</cleanup>\n</snapshot>\n",
            id,
            now_stamp(),
            description
        );
        crate::fsutils::write_file_with_dirs(
            root.join(SNAPSHOTS_PATH).join(id.to_string()).join("info.xml"),
            info,
        )
    }

    fn btrfs(&self, args: &[&str], error: &str) -> Result<String> {
        run_checked(self.config.runner.as_ref(), "btrfs", args, error)
            .map(|r| r.stdout_trimmed().to_string())
    }
}

/// Parse the snapshot id out of a default-subvolume line such as
/// `ID 259 gen 96 top level 258 path @/.snapshots/1/snapshot`.
pub fn parse_default_snapshot(output: &str) -> Option<u32> {
    let re = Regex::new(r"\.snapshots/(\d+)/snapshot").expect("static regex");
    re.captures(output)
        .and_then(|cap| cap[1].parse::<u32>().ok())
}

impl SubvolumeBackend for BtrfsBackend<'_> {
    fn probe(&self, device: &str, mountpoint: &Path) -> Result<BackendStat> {
        let mount_str = mountpoint.to_string_lossy().into_owned();
        let result = self.config.runner.as_ref().run(
            "btrfs",
            &["subvolume", "get-default", &mount_str],
        )?;
        if !result.success() {
            // not a managed btrfs filesystem yet
            return Ok(BackendStat::default());
        }
        let output = result.stdout_trimmed().to_string();
        let active_id = parse_default_snapshot(&output).unwrap_or(0);
        let initiated = active_id > 0 || output.ends_with(&format!("path {}", ROOT_SUBVOL));

        // inspect where the top-level subvolume is mounted, if anywhere
        let findmnt = self
            .config
            .runner
            .as_ref()
            .run("findmnt", &["-lno", "TARGET,OPTIONS", device])?;
        let mut root_dir = None;
        for line in findmnt.stdout.lines() {
            let mut fields = line.split_whitespace();
            let (Some(target), Some(options)) = (fields.next(), fields.next()) else {
                continue;
            };
            if options
                .split(',')
                .any(|o| o == format!("subvol=/{}", ROOT_SUBVOL))
            {
                root_dir = Some(PathBuf::from(target));
                break;
            }
        }
        Ok(BackendStat {
            active_id,
            root_dir,
            initiated,
        })
    }

    fn init_partition(&self, mountpoint: &Path) -> Result<()> {
        debug!("Initializing btrfs structure at {}", mountpoint.display());
        let root = mountpoint.join(ROOT_SUBVOL);
        let root_str = root.to_string_lossy().into_owned();
        self.btrfs(
            &["subvolume", "create", &root_str],
            "failed creating root subvolume",
        )?;
        let snapshots = root.join(SNAPSHOTS_PATH);
        let snapshots_str = snapshots.to_string_lossy().into_owned();
        self.btrfs(
            &["subvolume", "create", &snapshots_str],
            "failed creating snapshots subvolume",
        )?;

        // make @ the default so an unconfigured mount lands on it
        let mount_str = mountpoint.to_string_lossy().into_owned();
        let list = self.btrfs(
            &["subvolume", "list", &mount_str],
            "btrfs subvolume list failed",
        )?;
        let re = Regex::new(&format!(r"ID (\d+) .*path {}$", ROOT_SUBVOL)).expect("static regex");
        let subvol_id = list
            .lines()
            .find_map(|l| re.captures(l.trim()))
            .and_then(|cap| cap[1].parse::<u32>().ok())
            .context("could not determine the root subvolume id")?;
        self.btrfs(
            &["subvolume", "set-default", &subvol_id.to_string(), &mount_str],
            "failed setting default subvolume",
        )?;
        Ok(())
    }

    fn create_snapshot(&self, root: &Path, base_id: u32) -> Result<Snapshot> {
        let list = self.list_snapshots(root)?;
        let id = list.ids.iter().max().copied().unwrap_or(0) + 1;
        let path = snapshot_path(root, id);
        fs::create_dir_all(path.parent().expect("snapshot dir"))?;
        let path_str = path.to_string_lossy().into_owned();

        let work_dir;
        if base_id == 0 {
            self.btrfs(
                &["subvolume", "create", &path_str],
                "failed creating first snapshot",
            )?;
            work_dir = path.clone();
            self.write_info_xml(root, id, "first root filesystem")?;
        } else {
            let base = snapshot_path(root, base_id);
            let base_str = base.to_string_lossy().into_owned();
            self.btrfs(
                &["subvolume", "snapshot", &base_str, &path_str],
                "failed creating snapshot",
            )?;
            work_dir = snapshot_work_dir(root, id);
            let work_str = work_dir.to_string_lossy().into_owned();
            self.btrfs(
                &["subvolume", "snapshot", &base_str, &work_str],
                "failed creating snapshot work area",
            )?;
            self.write_info_xml(root, id, &format!("snapshot of {}", base_id))?;
        }

        Ok(Snapshot {
            id,
            path,
            work_dir,
            mount_point: None,
            in_progress: false,
            labels: Default::default(),
        })
    }

    fn commit_snapshot(&self, root: &Path, snapshot: &Snapshot) -> Result<()> {
        let path_str = snapshot.path.to_string_lossy().into_owned();
        self.btrfs(
            &["property", "set", &path_str, "ro", "true"],
            "failed setting the snapshot read-only",
        )?;
        let subvol_id = self.subvolume_id(root, snapshot.id)?;
        let root_str = root.to_string_lossy().into_owned();
        self.btrfs(
            &["subvolume", "set-default", &subvol_id.to_string(), &root_str],
            "failed setting default subvolume",
        )?;
        Ok(())
    }

    fn list_snapshots(&self, root: &Path) -> Result<SnapshotList> {
        let root_str = root.to_string_lossy().into_owned();
        let result = run_checked(
            self.config.runner.as_ref(),
            "btrfs",
            &["subvolume", "list", &root_str],
            "btrfs subvolume list failed",
        )?;
        let re = Regex::new(r"path .*\.snapshots/(\d+)/snapshot$").expect("static regex");
        let mut ids: Vec<u32> = result
            .stdout
            .lines()
            .filter_map(|l| re.captures(l.trim()))
            .filter_map(|cap| cap[1].parse().ok())
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let default = self.config.runner.as_ref().run(
            "btrfs",
            &["subvolume", "get-default", &root_str],
        )?;
        let active_id = parse_default_snapshot(default.stdout_trimmed()).unwrap_or(0);
        Ok(SnapshotList { ids, active_id })
    }

    fn delete_snapshot(&self, root: &Path, id: u32) -> Result<()> {
        let work_dir = snapshot_work_dir(root, id);
        if work_dir.exists() {
            let work_str = work_dir.to_string_lossy().into_owned();
            self.btrfs(
                &["subvolume", "delete", &work_str],
                "failed deleting snapshot work area",
            )?;
        }
        let path = snapshot_path(root, id);
        if path.exists() {
            let path_str = path.to_string_lossy().into_owned();
            self.btrfs(
                &["subvolume", "delete", &path_str],
                "failed deleting snapshot subvolume",
            )?;
        }
        let dir = root.join(SNAPSHOTS_PATH).join(id.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed removing {}", dir.display()))?;
        }
        Ok(())
    }

    fn cleanup(&self, root: &Path, max_snaps: u32, keep: &[u32]) -> Result<()> {
        let list = self.list_snapshots(root)?;
        let mut total = list.ids.len();
        for id in &list.ids {
            if total <= max_snaps as usize {
                break;
            }
            if keep.contains(id) || *id == list.active_id {
                continue;
            }
            debug!("Pruning snapshot {}", id);
            self.delete_snapshot(root, *id)?;
            total -= 1;
        }
        Ok(())
    }
}
