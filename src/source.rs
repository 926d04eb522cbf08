//! Image source resolution.
//!
//! Materializes the content of an [`ImageSource`] into a destination
//! directory, dispatching on the source variant. All variants write into a
//! work directory owned by the snapshotter; the atomic commit happens there.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::constants;
use crate::fsutils::{copy_into_dir, ensure_exists, mirror_dir, sha256_of_file};
use crate::process::{run_checked, Runner};
use crate::types::{ImageSource, Platform};

/// Extracts OCI images into a directory tree.
pub trait ImageExtractor: fmt::Debug {
    /// Pull and unpack the image for the given platform, returning the
    /// canonical digest. With `local` set the image must come from the local
    /// store and the network is never hit.
    fn extract(
        &self,
        image_ref: &str,
        dest: &Path,
        platform: &Platform,
        local: bool,
        tls_verify: bool,
    ) -> Result<String>;
}

/// Production extractor driving skopeo and umoci.
#[derive(Debug, Default)]
pub struct SkopeoExtractor;

impl SkopeoExtractor {
    fn transport(image_ref: &str, local: bool) -> String {
        if local {
            format!("containers-storage:{}", image_ref)
        } else {
            format!("docker://{}", image_ref)
        }
    }
}

impl ImageExtractor for SkopeoExtractor {
    fn extract(
        &self,
        image_ref: &str,
        dest: &Path,
        platform: &Platform,
        local: bool,
        tls_verify: bool,
    ) -> Result<String> {
        let runner = crate::process::SystemRunner;
        let staging = tempfile::tempdir().context("failed creating staging directory")?;
        let layout = format!("oci:{}:image", staging.path().join("layout").display());
        let source = Self::transport(image_ref, local);

        let mut copy_args: Vec<String> = vec![
            "copy".into(),
            "--override-os".into(),
            platform.os.clone(),
            "--override-arch".into(),
            platform.oci_arch().into(),
        ];
        if !platform.variant.is_empty() {
            copy_args.push("--override-variant".into());
            copy_args.push(platform.variant.clone());
        }
        if !tls_verify {
            copy_args.push("--src-tls-verify=false".into());
        }
        copy_args.push(source.clone());
        copy_args.push(layout.clone());

        let copy_refs: Vec<&str> = copy_args.iter().map(|s| s.as_str()).collect();
        with_retries(local, || {
            run_checked(&runner, "skopeo", &copy_refs, "skopeo copy failed").map(|_| ())
        })?;

        let bundle = staging.path().join("bundle");
        let bundle_str = bundle.to_string_lossy().into_owned();
        let image_arg = layout;
        run_checked(
            &runner,
            "umoci",
            &["unpack", "--image", &image_arg, &bundle_str],
            "umoci unpack failed",
        )?;
        mirror_dir(&runner, &bundle.join("rootfs"), dest)?;

        let digest = with_retries(local, || {
            run_checked(
                &runner,
                "skopeo",
                &["inspect", "--format", "{{.Digest}}", &source],
                "skopeo inspect failed",
            )
            .map(|r| r.stdout_trimmed().to_string())
        })?;
        Ok(digest)
    }
}

/// Retry transient registry operations with exponential backoff. Local
/// store operations are never retried.
fn with_retries<T>(local: bool, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let attempts = if local { 1 } else { constants::TRANSIENT_RETRIES };
    let mut backoff = Duration::from_secs(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < attempts {
                    warn!("registry operation failed, retrying in {:?}: {}", backoff, e);
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                last = Some(e);
            }
        }
    }
    Err(last.expect("at least one attempt"))
}

/// Verify the signature of an OCI image with cosign before it is pulled.
fn verify_signature(runner: &dyn Runner, image_ref: &str, pub_key: &str) -> Result<()> {
    info!("Verifying signature of {}", image_ref);
    let mut args = vec!["verify"];
    if !pub_key.is_empty() {
        args.push("--key");
        args.push(pub_key);
    }
    args.push(image_ref);
    run_checked(runner, "cosign", &args, "cosign verification failed").map(|_| ())
}

/// Materialize the given source into `dest`, returning its digest when the
/// source has a meaningful one.
pub fn unpack(config: &Config, source: &ImageSource, dest: &Path) -> Result<Option<String>> {
    fs::create_dir_all(dest)?;
    match source {
        ImageSource::Oci(image_ref) => {
            info!("Unpacking OCI image {}", image_ref);
            if config.verify {
                verify_signature(config.runner.as_ref(), image_ref, &config.cosign_pub_key)
                    .context("image signature verification")?;
            }
            let digest = config.extractor.extract(
                image_ref,
                dest,
                &config.platform,
                config.local_image,
                config.tls_verify,
            )?;
            debug!("Unpacked {} ({})", image_ref, digest);
            Ok(Some(digest))
        }
        ImageSource::Dir(path) => {
            info!("Mirroring directory {}", path.display());
            ensure_exists(path, "source directory")?;
            mirror_dir(config.runner.as_ref(), path, dest)?;
            Ok(None)
        }
        ImageSource::File(path) => {
            let uri = path.to_string_lossy();
            let local = if uri.starts_with("http://") || uri.starts_with("https://") {
                let name = uri.rsplit('/').next().unwrap_or("image");
                let target = dest.join(name);
                config.http.get_file(&uri, &target)?;
                target
            } else {
                ensure_exists(path, "source file")?;
                copy_into_dir(path, dest)?
            };
            let digest = sha256_of_file(&local)?;
            Ok(Some(format!("sha256:{}", digest)))
        }
        ImageSource::Channel(package) => {
            info!("Installing channel package {}", package);
            let dest_str = dest.to_string_lossy().into_owned();
            let mut args: Vec<String> = vec![
                "install".into(),
                "--no-spinner".into(),
                "-y".into(),
                "--system-target".into(),
                dest_str,
            ];
            for repo in &config.repositories {
                args.push("--repository".into());
                args.push(repo.uri.clone());
            }
            args.push(package.clone());
            let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            run_checked(
                config.runner.as_ref(),
                "luet",
                &arg_refs,
                "package installation failed",
            )?;
            Ok(None)
        }
        ImageSource::Empty => bail!("undefined image source"),
    }
}
