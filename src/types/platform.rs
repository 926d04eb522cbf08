//! Target platform description for image pulls.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Platform a source image is resolved for. `arch` follows the kernel
/// convention (`x86_64`), `oci_arch` the registry convention (`amd64`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn from_arch(arch: &str) -> Result<Self> {
        let (arch, variant) = match arch {
            "x86_64" | "amd64" => ("x86_64", ""),
            "aarch64" | "arm64" => ("aarch64", "v8"),
            "riscv64" => ("riscv64", ""),
            other => bail!("unsupported architecture: {}", other),
        };
        Ok(Self {
            os: "linux".to_string(),
            arch: arch.to_string(),
            variant: variant.to_string(),
        })
    }

    /// Platform of the running host.
    pub fn host() -> Self {
        // every arch this binary builds for is convertible
        Self::from_arch(std::env::consts::ARCH).unwrap_or(Self {
            os: "linux".to_string(),
            arch: std::env::consts::ARCH.to_string(),
            variant: String::new(),
        })
    }

    /// Architecture name used by OCI registries.
    pub fn oci_arch(&self) -> &str {
        match self.arch.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::host()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.variant.is_empty() {
            write!(f, "{}/{}", self.os, self.oci_arch())
        } else {
            write!(f, "{}/{}/{}", self.os, self.oci_arch(), self.variant)
        }
    }
}
