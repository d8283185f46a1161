//! Serial number allocation
//!
//! The certificate authority draws every serial number from a [`SerialStore`].
//! [`FileSerialStore`] persists the next free value as a decimal number in a
//! single file (`ca.srl`) and serializes read-increment-write behind a mutex,
//! so concurrent signers within the process never receive the same value and
//! the sequence continues across restarts.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{BootError, Result};
use crate::persist;

/// A monotonic counter handing out certificate serial numbers.
pub trait SerialStore: Send + Sync {
    /// Atomically return the current value and advance the counter by one.
    fn next_serial(&self) -> Result<u64>;

    /// The value the next call to `next_serial` will return.
    fn peek(&self) -> Result<u64>;
}

#[derive(Debug)]
pub struct FileSerialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSerialStore {
    /// Open an existing counter file.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BootError::SerialAllocation(format!(
                "serial record {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    /// Create the counter file starting at `initial`, or open it if present.
    pub fn open_or_init(path: &Path, initial: u64) -> Result<Self> {
        if !path.exists() {
            write_value(path, initial)?;
        }
        Self::open(path)
    }
}

impl SerialStore for FileSerialStore {
    fn next_serial(&self) -> Result<u64> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| BootError::SerialAllocation("serial lock poisoned".to_string()))?;
        let current = read_value(&self.path)?;
        let next = current.checked_add(1).ok_or_else(|| {
            BootError::SerialAllocation("serial number space exhausted".to_string())
        })?;
        write_value(&self.path, next)?;
        debug!("Allocated serial number {}", current);
        Ok(current)
    }

    fn peek(&self) -> Result<u64> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| BootError::SerialAllocation("serial lock poisoned".to_string()))?;
        read_value(&self.path)
    }
}

fn read_value(path: &Path) -> Result<u64> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        BootError::SerialAllocation(format!("Failed to read {}: {}", path.display(), e))
    })?;
    raw.trim().parse::<u64>().map_err(|e| {
        BootError::SerialAllocation(format!("Corrupt serial record {}: {}", path.display(), e))
    })
}

fn write_value(path: &Path, value: u64) -> Result<()> {
    persist::write_owner_only(path, format!("{}\n", value).as_bytes())
        .map_err(|e| BootError::SerialAllocation(e.to_string()))
}
