//! Shared test utilities: a disposable partition environment plus a fully
//! faked configuration with handles on every fake.
#![allow(dead_code)]

use std::path::PathBuf;
use std::rc::Rc;

use tempfile::TempDir;

use elemental::config::{Config, RunConfig};
use elemental::testing::{
    FakeCloudInit, FakeExtractor, FakeHttp, FakeMounter, FakeRunner, FakeSyscall,
};
use elemental::types::ElementalPartitions;

/// Test environment simulating the partition mountpoints of a host.
pub struct TestEnv {
    /// Temporary directory (kept alive for the lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub state: PathBuf,
    pub recovery: PathBuf,
    pub oem: PathBuf,
    pub persistent: PathBuf,
    pub efi: PathBuf,
    pub work_mount: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        Self {
            state: base.join("state"),
            recovery: base.join("recovery"),
            oem: base.join("oem"),
            persistent: base.join("persistent"),
            efi: base.join("efi"),
            work_mount: base.join("workingtree"),
            _temp_dir: temp_dir,
        }
    }

    /// A partition set whose mountpoints live inside this environment and
    /// whose device paths look like a plain SATA disk.
    pub fn partitions(&self) -> ElementalPartitions {
        let mut partitions = ElementalPartitions::default_layout();
        partitions.normalize();
        let remap = [
            ("p.grub", &self.efi, "/dev/sda1"),
            ("p.oem", &self.oem, "/dev/sda2"),
            ("p.recovery", &self.recovery, "/dev/sda3"),
            ("p.state", &self.state, "/dev/sda4"),
            ("p.persistent", &self.persistent, "/dev/sda5"),
        ];
        for (name, mount, device) in remap {
            if let Some(p) = partitions.get_mut(name) {
                p.mount_point = Some((*mount).clone());
                p.path = Some(PathBuf::from(device));
                p.disk = "/dev/sda".to_string();
            }
        }
        partitions
    }

}

/// Fully faked configuration plus handles on each fake for assertions.
pub struct Fakes {
    pub runner: Rc<FakeRunner>,
    pub mounter: Rc<FakeMounter>,
    pub syscall: Rc<FakeSyscall>,
    pub cloud_init: Rc<FakeCloudInit>,
    pub extractor: Rc<FakeExtractor>,
    pub http: Rc<FakeHttp>,
}

pub fn faked_config() -> (Config, Fakes) {
    let fakes = Fakes {
        runner: Rc::new(FakeRunner::default()),
        mounter: Rc::new(FakeMounter::default()),
        syscall: Rc::new(FakeSyscall::default()),
        cloud_init: Rc::new(FakeCloudInit::default()),
        extractor: Rc::new(FakeExtractor::default()),
        http: Rc::new(FakeHttp::default()),
    };
    let mut config = Config::for_tests();
    config.runner = Box::new(fakes.runner.clone());
    config.mounter = Box::new(fakes.mounter.clone());
    config.syscall = Box::new(fakes.syscall.clone());
    config.cloud_init = Box::new(fakes.cloud_init.clone());
    config.extractor = Box::new(fakes.extractor.clone());
    config.http = Box::new(fakes.http.clone());
    (config, fakes)
}

/// Run configuration over a faked [`Config`], with the transaction work
/// area redirected into the test environment.
pub fn faked_run_config(env: &TestEnv) -> (RunConfig, Fakes) {
    let (config, fakes) = faked_config();
    let mut run_config = RunConfig::for_tests();
    run_config.config = config;
    run_config.snapshotter.work_mount = Some(env.work_mount.clone());
    (run_config, fakes)
}

/// Script the common external commands of a loop device deployment.
pub fn script_loop_device_commands(runner: &FakeRunner) {
    runner.on_output("lsblk", "-b -dn -o SIZE", &(64_u64 * 1024 * 1024 * 1024).to_string());
    runner.on_output("losetup", "--show", "/dev/loop7");
}
