//! Snapper-managed subvolume backend.
//!
//! Delegates snapshot bookkeeping to the external `snapper` tool so its
//! metadata, listing and retention features keep working on the deployed
//! system. Partition initialization and the first snapshot still go through
//! plain btrfs commands; snapper requires an existing configuration.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

use super::backend::{
    snapshot_path, snapshot_work_dir, BackendStat, BtrfsBackend, SnapshotList, SubvolumeBackend,
};
use super::Snapshot;
use crate::config::Config;
use crate::constants;
use crate::fsutils::find_first_existing;
use crate::process::run_checked;

#[derive(Debug)]
pub struct SnapperBackend<'a> {
    config: &'a Config,
    /// Subvolume-level operations snapper does not cover.
    inner: BtrfsBackend<'a>,
}

impl<'a> SnapperBackend<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            inner: BtrfsBackend::new(config),
        }
    }

    fn snapper(&self, root: &Path, args: &[&str], error: &str) -> Result<String> {
        let root_str = root.to_string_lossy().into_owned();
        let mut full_args = vec!["--no-dbus", "--root", root_str.as_str()];
        full_args.extend(args);
        run_checked(self.config.runner.as_ref(), "snapper", &full_args, error)
            .map(|r| r.stdout_trimmed().to_string())
    }
}

impl SubvolumeBackend for SnapperBackend<'_> {
    fn probe(&self, device: &str, mountpoint: &Path) -> Result<BackendStat> {
        self.inner.probe(device, mountpoint)
    }

    fn init_partition(&self, mountpoint: &Path) -> Result<()> {
        self.inner.init_partition(mountpoint)?;
        let root = mountpoint.join(super::backend::ROOT_SUBVOL);
        let mut args = vec!["create-config", "--fstype", "btrfs"];
        let template = find_first_existing(
            &constants::SNAPPER_TEMPLATE_PATHS
                .iter()
                .map(|p| std::path::PathBuf::from(*p))
                .collect::<Vec<_>>(),
        );
        if template.is_some() {
            args.extend(["--template", "default"]);
        }
        args.push("/");
        self.snapper(&root, &args, "snapper create-config failed")
            .map(|_| ())
    }

    fn create_snapshot(&self, root: &Path, base_id: u32) -> Result<Snapshot> {
        if base_id == 0 {
            // snapper cannot create the very first snapshot of a fresh
            // configuration, fall back to plain subvolume management
            return self.inner.create_snapshot(root, base_id);
        }
        let base = base_id.to_string();
        let output = self.snapper(
            root,
            &[
                "create",
                "--from",
                &base,
                "--read-write",
                "--print-number",
                "--description",
                "in progress deployment",
                "--cleanup-algorithm",
                "number",
            ],
            "snapper create failed",
        )?;
        let id: u32 = output
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .context("unparseable snapper snapshot number")?;

        // snapper created the snapshot subvolume; add the work area next to it
        let base_path = snapshot_path(root, base_id);
        let work_dir = snapshot_work_dir(root, id);
        let base_str = base_path.to_string_lossy().into_owned();
        let work_str = work_dir.to_string_lossy().into_owned();
        run_checked(
            self.config.runner.as_ref(),
            "btrfs",
            &["subvolume", "snapshot", &base_str, &work_str],
            "failed creating snapshot work area",
        )?;

        Ok(Snapshot {
            id,
            path: snapshot_path(root, id),
            work_dir,
            mount_point: None,
            in_progress: false,
            labels: Default::default(),
        })
    }

    fn commit_snapshot(&self, root: &Path, snapshot: &Snapshot) -> Result<()> {
        if snapshot.id == 1 {
            // the first snapshot was created outside snapper
            return self.inner.commit_snapshot(root, snapshot);
        }
        self.snapper(
            root,
            &["modify", "--default", &snapshot.id.to_string()],
            "snapper modify failed",
        )
        .map(|_| ())
    }

    fn list_snapshots(&self, root: &Path) -> Result<SnapshotList> {
        let output = self.snapper(
            root,
            &["--csvout", "list", "--columns", "number,default"],
            "snapper list failed",
        )?;
        let mut ids = Vec::new();
        let mut active_id = 0;
        for line in output.lines().skip(1) {
            let mut fields = line.trim().split(',');
            let (Some(number), Some(default)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(id) = number.parse::<u32>() else {
                continue;
            };
            if id == 0 {
                // snapper's "current" pseudo snapshot
                continue;
            }
            ids.push(id);
            if default.eq_ignore_ascii_case("yes") {
                active_id = id;
            }
        }
        ids.sort_unstable();
        Ok(SnapshotList { ids, active_id })
    }

    fn delete_snapshot(&self, root: &Path, id: u32) -> Result<()> {
        let work_dir = snapshot_work_dir(root, id);
        if work_dir.exists() {
            let work_str = work_dir.to_string_lossy().into_owned();
            run_checked(
                self.config.runner.as_ref(),
                "btrfs",
                &["subvolume", "delete", &work_str],
                "failed deleting snapshot work area",
            )?;
        }
        self.snapper(
            root,
            &["delete", "--sync", &id.to_string()],
            "snapper delete failed",
        )
        .map(|_| ())
    }

    fn cleanup(&self, root: &Path, max_snaps: u32, keep: &[u32]) -> Result<()> {
        debug!(
            "Delegating snapshot retention to snapper (limit {}, keeping {:?})",
            max_snaps, keep
        );
        self.snapper(
            root,
            &["cleanup", "number"],
            "snapper cleanup failed",
        )
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use std::rc::Rc;

    fn snapper_config() -> (Config, Rc<FakeRunner>) {
        let mut config = Config::for_tests();
        let runner = Rc::new(FakeRunner::default());
        config.runner = Box::new(runner.clone());
        (config, runner)
    }

    #[test]
    fn test_create_snapshot_parses_number() {
        let (config, runner) = snapper_config();
        runner.on_output("snapper", "create --from 3", "4\n");
        let backend = SnapperBackend::new(&config);
        let snapshot = backend
            .create_snapshot(Path::new("/run/cos/state"), 3)
            .unwrap();
        assert_eq!(snapshot.id, 4);
        assert!(snapshot
            .path
            .to_string_lossy()
            .ends_with(".snapshots/4/snapshot"));
        assert!(runner.called_with("btrfs", "snapshot.workDir"));
    }

    #[test]
    fn test_list_snapshots_parses_csv() {
        let (config, runner) = snapper_config();
        runner.on_output(
            "snapper",
            "--csvout list",
            "number,default\n0,no\n1,no\n2,yes\n",
        );
        let backend = SnapperBackend::new(&config);
        let list = backend.list_snapshots(Path::new("/run/cos/state")).unwrap();
        assert_eq!(list.ids, vec![1, 2]);
        assert_eq!(list.active_id, 2);
    }

    #[test]
    fn test_commit_goes_through_snapper_modify() {
        let (config, runner) = snapper_config();
        let backend = SnapperBackend::new(&config);
        let snapshot = Snapshot {
            id: 5,
            ..Default::default()
        };
        backend
            .commit_snapshot(Path::new("/run/cos/state"), &snapshot)
            .unwrap();
        assert!(runner.called_with("snapper", "modify --default 5"));
    }
}
