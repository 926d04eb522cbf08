//! Remote file retrieval for http(s) image sources.
//!
//! Downloads are delegated to curl. Transient failures are retried with
//! exponential backoff; everything else in the engine is deliberately not
//! retried.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::constants;

/// HTTP fetcher used by file sources with a remote URI.
pub trait HttpClient: fmt::Debug {
    /// Download the url into the given destination file.
    fn get_file(&self, url: &str, dest: &Path) -> Result<()>;
}

/// curl-backed client with bounded retries.
#[derive(Debug)]
pub struct CurlClient {
    timeout_secs: u32,
    retries: u32,
}

impl Default for CurlClient {
    fn default() -> Self {
        Self {
            timeout_secs: constants::HTTP_TIMEOUT_SECS,
            retries: constants::TRANSIENT_RETRIES,
        }
    }
}

impl HttpClient for CurlClient {
    fn get_file(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let dest_str = dest.to_string_lossy().into_owned();
        let timeout = self.timeout_secs.to_string();

        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=self.retries {
            info!("Downloading {} (attempt {}/{})", url, attempt, self.retries);
            let status = Command::new("curl")
                .args(["-L", "--fail", "--silent", "--show-error"])
                .args(["--max-time", &timeout])
                .args(["-o", &dest_str, url])
                .status()
                .context("Failed to run curl. Is it installed?")?;

            if status.success() {
                return Ok(());
            }

            // Clean up partial download before retrying
            let _ = fs::remove_file(dest);
            if attempt < self.retries {
                warn!("Download of {} failed, retrying in {:?}", url, backoff);
                thread::sleep(backoff);
                backoff *= 2;
            }
        }
        bail!("failed downloading {} after {} attempts", url, self.retries);
    }
}
