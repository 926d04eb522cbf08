//! Runtime configuration.
//!
//! The [`Config`] aggregate is the sole carrier of cross-cutting
//! dependencies: command runner, mounter, syscalls, cloud-init, image
//! extractor and HTTP client. It is passed explicitly, never accessed
//! through globals; tests inject fakes for every collaborator.
//!
//! Plain configuration values are read from YAML files merged in order
//! (`/etc/elemental/config.yaml`, OEM snippets, `--config FILE`), then
//! overridden by `ELEMENTAL_*` environment variables and finally by flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::cloudinit::{CloudInitRunner, SystemCloudInit};
use crate::constants;
use crate::http::{CurlClient, HttpClient};
use crate::mounter::{Mounter, SystemMounter};
use crate::process::{Runner, SystemRunner};
use crate::source::{ImageExtractor, SkopeoExtractor};
use crate::syscall::{Syscall, SystemSyscall};
use crate::types::spec::{InstallSpec, MountSpec, ResetSpec, UpgradeSpec};
use crate::types::{Platform, SnapshotterConfig};

/// A package repository consulted by channel sources.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Repository {
    pub name: String,
    pub uri: String,
    pub priority: i32,
    #[serde(rename = "type")]
    pub kind: String,
    pub arch: String,
}

/// Cross-cutting dependencies and generic engine settings.
pub struct Config {
    pub runner: Box<dyn Runner>,
    pub mounter: Box<dyn Mounter>,
    pub syscall: Box<dyn Syscall>,
    pub cloud_init: Box<dyn CloudInitRunner>,
    pub extractor: Box<dyn ImageExtractor>,
    pub http: Box<dyn HttpClient>,
    pub platform: Platform,
    /// Validate image signatures with cosign before pulling.
    pub verify: bool,
    pub cosign_pub_key: String,
    pub tls_verify: bool,
    /// Resolve OCI references from the local store only.
    pub local_image: bool,
    pub repositories: Vec<Repository>,
    pub squash_compression: Vec<String>,
    pub cloud_init_paths: Vec<String>,
    /// Fail the action on hook errors instead of logging them.
    pub strict: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("platform", &self.platform)
            .field("verify", &self.verify)
            .field("tls_verify", &self.tls_verify)
            .field("local_image", &self.local_image)
            .field("strict", &self.strict)
            .finish()
    }
}

impl Config {
    /// Configuration wired to the real system.
    pub fn system(data: &ConfigData) -> Result<Self> {
        let platform = match data.arch.as_deref() {
            Some(arch) => Platform::from_arch(arch)?,
            None => Platform::host(),
        };
        let squash_compression = if data.squash_no_compression {
            constants::squashfs_no_compression_options()
        } else if data.squash_compression.is_empty() {
            constants::squashfs_compression_options(&platform.arch)
        } else {
            data.squash_compression.clone()
        };
        let mut cloud_init_paths = constants::cloud_init_paths();
        cloud_init_paths.extend(data.cloud_init_paths.iter().cloned());

        Ok(Self {
            runner: Box::new(SystemRunner),
            mounter: Box::new(SystemMounter),
            syscall: Box::new(SystemSyscall),
            cloud_init: Box::new(SystemCloudInit),
            extractor: Box::new(SkopeoExtractor),
            http: Box::new(CurlClient::default()),
            platform,
            verify: data.verify,
            cosign_pub_key: data.cosign_key.clone(),
            tls_verify: data.tls_verify,
            local_image: data.local,
            repositories: data.repositories.clone(),
            squash_compression,
            cloud_init_paths,
            strict: data.strict,
        })
    }

    /// Configuration wired with test doubles. Used across the test suite.
    pub fn for_tests() -> Self {
        use crate::testing::{
            FakeCloudInit, FakeExtractor, FakeHttp, FakeMounter, FakeRunner, FakeSyscall,
        };
        Self {
            runner: Box::new(FakeRunner::default()),
            mounter: Box::new(FakeMounter::default()),
            syscall: Box::new(FakeSyscall::default()),
            cloud_init: Box::new(FakeCloudInit::default()),
            extractor: Box::new(FakeExtractor::default()),
            http: Box::new(FakeHttp::default()),
            platform: Platform::from_arch("x86_64").expect("known arch"),
            verify: false,
            cosign_pub_key: String::new(),
            tls_verify: true,
            local_image: false,
            repositories: vec![],
            squash_compression: constants::squashfs_compression_options("x86_64"),
            cloud_init_paths: constants::cloud_init_paths(),
            strict: false,
        }
    }
}

/// Plain configuration values as read from YAML and the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigData {
    pub arch: Option<String>,
    pub verify: bool,
    #[serde(rename = "cosign-key")]
    pub cosign_key: String,
    #[serde(rename = "tls-verify", default = "default_true")]
    pub tls_verify: bool,
    pub local: bool,
    pub repositories: Vec<Repository>,
    #[serde(rename = "squash-compression")]
    pub squash_compression: Vec<String>,
    #[serde(rename = "squash-no-compression")]
    pub squash_no_compression: bool,
    #[serde(rename = "cloud-init-paths")]
    pub cloud_init_paths: Vec<String>,
    pub strict: bool,
    pub reboot: bool,
    pub poweroff: bool,
    #[serde(rename = "eject-cd")]
    pub eject_cd: bool,
    pub snapshotter: SnapshotterConfig,
    pub install: InstallSpec,
    pub upgrade: UpgradeSpec,
    pub reset: ResetSpec,
    pub mount: MountSpec,
}

fn default_true() -> bool {
    true
}

impl ConfigData {
    /// Load and merge configuration from the well-known locations plus an
    /// optional explicit file, then apply environment overrides.
    pub fn load(extra_config: Option<&Path>) -> Result<Self> {
        let mut files = vec![std::path::PathBuf::from(constants::SYSTEM_CONFIG_FILE)];
        if let Ok(entries) = fs::read_dir(constants::OEM_CONFIG_DIR) {
            let mut oem: Vec<_> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|e| e == "yaml").unwrap_or(false))
                .collect();
            oem.sort();
            files.extend(oem);
        }
        if let Some(path) = extra_config {
            files.push(path.to_path_buf());
        }
        Self::load_from_files(&files)
    }

    /// Merge the given YAML files in order; later files win key by key.
    pub fn load_from_files(files: &[std::path::PathBuf]) -> Result<Self> {
        let mut merged = serde_yaml::Value::Mapping(Default::default());
        for file in files {
            let content = match fs::read_to_string(file) {
                Ok(c) => c,
                Err(_) => continue,
            };
            debug!("Merging configuration from {}", file.display());
            let value: serde_yaml::Value = serde_yaml::from_str(&content)
                .with_context(|| format!("invalid configuration file {}", file.display()))?;
            merge_values(&mut merged, value);
        }
        apply_env_overrides(&mut merged);
        serde_yaml::from_value(merged).context("invalid configuration")
    }
}

/// Recursively merge `over` into `base`; mappings merge key by key, any
/// other value replaces the previous one.
fn merge_values(base: &mut serde_yaml::Value, over: serde_yaml::Value) {
    match (base, over) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(over_map)) => {
            for (k, v) in over_map {
                match base_map.get_mut(&k) {
                    Some(slot) => merge_values(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base, over) => *base = over,
    }
}

/// Apply `ELEMENTAL_*` environment variables as top-level overrides.
/// `ELEMENTAL_TLS_VERIFY=false` maps to the `tls-verify` key.
fn apply_env_overrides(value: &mut serde_yaml::Value) {
    let map = match value {
        serde_yaml::Value::Mapping(m) => m,
        _ => return,
    };
    for (key, val) in env::vars() {
        let Some(name) = key.strip_prefix(constants::ENV_PREFIX) else {
            continue;
        };
        if name == "LOG" {
            continue;
        }
        let yaml_key = name.to_lowercase().replace('_', "-");
        let parsed = match val.as_str() {
            "true" => serde_yaml::Value::Bool(true),
            "false" => serde_yaml::Value::Bool(false),
            other => match other.parse::<u64>() {
                Ok(n) => serde_yaml::Value::Number(n.into()),
                Err(_) => serde_yaml::Value::String(other.to_string()),
            },
        };
        map.insert(serde_yaml::Value::String(yaml_key), parsed);
    }
}

/// Top-level run settings: what to do after the action and which
/// snapshotter to use.
#[derive(Debug)]
pub struct RunConfig {
    pub reboot: bool,
    pub poweroff: bool,
    pub eject_cd: bool,
    pub snapshotter: SnapshotterConfig,
    pub config: Config,
}

impl RunConfig {
    pub fn new(data: &ConfigData) -> Result<Self> {
        Ok(Self {
            reboot: data.reboot,
            poweroff: data.poweroff,
            eject_cd: data.eject_cd,
            snapshotter: data.snapshotter.clone(),
            config: Config::system(data)?,
        })
    }

    /// Run configuration wired with test doubles.
    pub fn for_tests() -> Self {
        Self {
            reboot: false,
            poweroff: false,
            eject_cd: false,
            snapshotter: SnapshotterConfig::default(),
            config: Config::for_tests(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutils::write_file_with_dirs;
    use tempfile::TempDir;

    #[test]
    fn test_merge_later_files_win() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.yaml");
        let over = tmp.path().join("over.yaml");
        write_file_with_dirs(&base, "verify: true\nstrict: true\n").unwrap();
        write_file_with_dirs(&over, "verify: false\n").unwrap();
        let data = ConfigData::load_from_files(&[base, over]).unwrap();
        assert!(!data.verify);
        assert!(data.strict);
    }

    #[test]
    fn test_nested_sections_merge() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join("base.yaml");
        let over = tmp.path().join("over.yaml");
        write_file_with_dirs(&base, "snapshotter:\n  type: btrfs\n  max-snaps: 6\n").unwrap();
        write_file_with_dirs(&over, "snapshotter:\n  max-snaps: 2\n").unwrap();
        let data = ConfigData::load_from_files(&[base, over]).unwrap();
        assert_eq!(data.snapshotter.max_snaps, 2);
        assert_eq!(data.snapshotter.kind, crate::types::SnapshotterKind::Btrfs);
    }

    #[test]
    fn test_missing_files_are_skipped() {
        let data =
            ConfigData::load_from_files(&[std::path::PathBuf::from("/nonexistent/config.yaml")])
                .unwrap();
        assert!(data.tls_verify, "defaults apply when nothing merges");
    }

    #[test]
    fn test_env_overrides() {
        // modifies process environment: keep key unique to this test
        env::set_var("ELEMENTAL_COSIGN_KEY", "/tmp/key.pub");
        let data = ConfigData::load_from_files(&[]).unwrap();
        env::remove_var("ELEMENTAL_COSIGN_KEY");
        assert_eq!(data.cosign_key, "/tmp/key.pub");
    }
}
