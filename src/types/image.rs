//! Filesystem images and the sources they are materialized from.

use anyhow::{bail, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::types::partition::FsKind;

/// Where the content of an image comes from.
///
/// Serialized as a URI string: `oci://`, `dir://`, `file://` or
/// `channel://` prefixed; an unprefixed reference is an OCI image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ImageSource {
    #[default]
    Empty,
    /// Container image reference, e.g. `registry.io/repo/image:tag`.
    Oci(String),
    /// Local directory mirrored into the destination.
    Dir(PathBuf),
    /// Single file, either a local path or an http(s) URL.
    File(PathBuf),
    /// Package reference resolved by the external package manager.
    Channel(String),
}

impl ImageSource {
    pub fn is_empty(&self) -> bool {
        matches!(self, ImageSource::Empty)
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Ok(ImageSource::Empty);
        }
        if let Some((scheme, rest)) = uri.split_once("://") {
            match scheme {
                "oci" | "docker" | "registry" => Ok(ImageSource::Oci(rest.to_string())),
                "dir" => Ok(ImageSource::Dir(PathBuf::from(rest))),
                "file" => Ok(ImageSource::File(PathBuf::from(rest))),
                // remote files keep their full URL
                "http" | "https" => Ok(ImageSource::File(PathBuf::from(uri))),
                "channel" => Ok(ImageSource::Channel(rest.to_string())),
                other => bail!("unknown image source scheme: {}", other),
            }
        } else {
            Ok(ImageSource::Oci(uri.to_string()))
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Empty => Ok(()),
            ImageSource::Oci(r) => write!(f, "oci://{}", r),
            ImageSource::Dir(p) => write!(f, "dir://{}", p.display()),
            ImageSource::File(p) => {
                let s = p.to_string_lossy();
                if s.starts_with("http://") || s.starts_with("https://") {
                    f.write_str(&s)
                } else {
                    write!(f, "file://{}", s)
                }
            }
            ImageSource::Channel(p) => write!(f, "channel://{}", p),
        }
    }
}

impl FromStr for ImageSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_uri(s)
    }
}

impl Serialize for ImageSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ImageSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ImageSource::from_uri(&s).map_err(D::Error::custom)
    }
}

/// A filesystem image with its configurable values, size in MiB.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Image {
    #[serde(skip)]
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub fs: FsKind,
    #[serde(rename = "uri", default, skip_serializing_if = "ImageSource::is_empty")]
    pub source: ImageSource,
    #[serde(skip)]
    pub mount_point: Option<PathBuf>,
    #[serde(skip)]
    pub loop_device: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_round_trip() {
        for uri in [
            "oci://registry.io/repo/image:v1",
            "dir:///var/tmp/rootfs",
            "file:///tmp/rootfs.squashfs",
            "channel://system/os",
            "https://example.org/rootfs.squashfs",
        ] {
            let src = ImageSource::from_uri(uri).unwrap();
            assert_eq!(src.to_string(), uri, "round trip of {}", uri);
        }
    }

    #[test]
    fn test_unprefixed_reference_is_oci() {
        let src = ImageSource::from_uri("registry.io/repo/image:v1").unwrap();
        assert_eq!(src, ImageSource::Oci("registry.io/repo/image:v1".into()));
    }

    #[test]
    fn test_empty_uri() {
        assert!(ImageSource::from_uri("").unwrap().is_empty());
        assert_eq!(ImageSource::Empty.to_string(), "");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(ImageSource::from_uri("ftp://example.org/x").is_err());
    }

    #[test]
    fn test_serde_through_yaml() {
        let src: ImageSource = serde_yaml::from_str("\"dir:///srv/root\"").unwrap();
        assert_eq!(src, ImageSource::Dir(PathBuf::from("/srv/root")));
        let out = serde_yaml::to_string(&src).unwrap();
        assert!(out.contains("dir:///srv/root"));
    }
}
