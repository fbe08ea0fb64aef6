// ABOUTME: Per-resource run lock so two processes never replicate the same kind at once
// ABOUTME: The lock is a file created exclusively and removed when the guard drops

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ReplicationError, Result};
use crate::resource::ResourceKind;

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock for `resource`, failing with [`ReplicationError::Locked`] if held.
    ///
    /// A lock left behind by a killed process has to be removed by hand.
    pub fn acquire(dir: &Path, lock_file: &str, resource: ResourceKind) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ReplicationError::persistence(dir, e))?;
        let path = dir.join(lock_file);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ReplicationError::Locked { resource, path });
            }
            Err(e) => return Err(ReplicationError::persistence(&path, e)),
        };

        // From here on, dropping the guard removes the file
        let lock = Self { path };
        file.write_all(std::process::id().to_string().as_bytes())
            .map_err(|e| ReplicationError::persistence(&lock.path, e))?;

        tracing::debug!("Acquired run lock {:?}", lock.path);
        Ok(lock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}
