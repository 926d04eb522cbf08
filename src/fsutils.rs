//! Utilities for file operations with automatic parent directory creation.

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::process::{run_checked, Runner};

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

/// Write a file with specific Unix permissions, creating parent directories
/// as needed.
pub fn write_file_mode<P: AsRef<Path>, C: AsRef<[u8]>>(
    path: P,
    content: C,
    mode: u32,
) -> Result<()> {
    let path = path.as_ref();
    write_file_with_dirs(path, content)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Fail with a descriptive error if the given path does not exist.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found: {}", what, path.display());
    }
    Ok(())
}

/// Return the first existing path from the candidate list.
pub fn find_first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.exists()).cloned()
}

/// Create a sparse file of the given size in MiB, replacing any previous one.
pub fn create_sparse_file(path: &Path, size_mib: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("failed creating image file {}", path.display()))?;
    file.set_len(u64::from(size_mib) * 1024 * 1024)?;
    Ok(())
}

/// Copy a file into a directory under its base name, returning the
/// destination path.
pub fn copy_into_dir(src: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = src
        .file_name()
        .ok_or_else(|| anyhow!("source file has no base name: {}", src.display()))?;
    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(name);
    fs::copy(src, &dest)
        .with_context(|| format!("failed copying {} to {}", src.display(), dest.display()))?;
    Ok(dest)
}

/// Mirror a directory tree into another, preserving permissions, xattrs and
/// sparse files. Extraneous files in the destination are deleted, so the
/// destination ends up as an exact replica.
pub fn mirror_dir(runner: &dyn Runner, src: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)?;
    // rsync treats "src/" as the content of src
    let src_arg = format!("{}/", src.display());
    let dest_arg = dest.display().to_string();
    run_checked(
        runner,
        "rsync",
        &["-aqAX", "--sparse", "--delete", &src_arg, &dest_arg],
        "rsync failed",
    )?;
    Ok(())
}

/// Compute the sha256 digest of a file, hex encoded.
pub fn sha256_of_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Depth of a path measured as its number of separators. Used to mount
/// parents before children.
pub fn path_depth(path: &str) -> usize {
    path.matches('/').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_with_dirs_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a/b/c.txt");
        write_file_with_dirs(&path, "content").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "content");
    }

    #[test]
    fn test_write_file_mode() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("script.sh");
        write_file_mode(&path, "#!/bin/sh\n", 0o755).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_create_sparse_file_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("disk.img");
        create_sparse_file(&path, 8).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 8 * 1024 * 1024);
    }

    #[test]
    fn test_copy_into_dir() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("image.squashfs");
        fs::write(&src, "data").unwrap();
        let dest_dir = tmp.path().join("out");
        let dest = copy_into_dir(&src, &dest_dir).unwrap();
        assert_eq!(dest, dest_dir.join("image.squashfs"));
        assert_eq!(fs::read_to_string(dest).unwrap(), "data");
    }

    #[test]
    fn test_sha256_of_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(
            sha256_of_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_path_depth_ordering() {
        assert!(path_depth("/var") < path_depth("/var/lib"));
        assert!(path_depth("/var/lib") < path_depth("/var/lib/rancher"));
    }
}
