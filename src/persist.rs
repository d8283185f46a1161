//! File persistence helpers for key material.
//!
//! Artifacts are written to a temporary sibling and renamed into place so a
//! concurrent reader never observes a half-written file. Files are created
//! with owner-only permissions (0600) on Unix.

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{BootError, Result};

/// Atomically write `contents` to `path` with owner-only permissions.
///
/// Replaces an existing file, including a read-only one, since the rename
/// only needs write access to the parent directory.
pub fn write_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| {
            BootError::io(
                format!("Invalid file path {}", path.display()),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            )
        })?
        .to_string_lossy();
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, suffix));

    let mut file = open_owner_only(&tmp_path)
        .map_err(|e| BootError::io(format!("Failed to create {}", tmp_path.display()), e))?;
    let written = file
        .write_all(contents)
        .and_then(|_| file.sync_all())
        .and_then(|_| fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(BootError::io(
            format!("Failed to write {}", path.display()),
            e,
        ));
    }
    Ok(())
}

/// Create `path` exclusively with owner-only permissions; fails if it exists.
pub fn create_new_owner_only(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = open_owner_only(path)
        .map_err(|e| BootError::io(format!("Failed to create {}", path.display()), e))?;
    file.write_all(contents)
        .map_err(|e| BootError::io(format!("Failed to write {}", path.display()), e))
}

/// Create `dir` and its parents if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| BootError::io(format!("Failed to create directory {}", dir.display()), e))
}

pub fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| BootError::io(format!("Failed to read {}", path.display()), e))
}

fn open_owner_only(path: &Path) -> std::io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_owner_only_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.pem");

        write_owner_only(&path, b"first").unwrap();
        write_owner_only(&path, b"second").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_owner_only_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        write_owner_only(&path, b"key").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_create_new_owner_only_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");

        create_new_owner_only(&path, b"one").unwrap();
        assert!(create_new_owner_only(&path, b"two").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"one");
    }
}
