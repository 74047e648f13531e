//! Advisory lock guarding an installation's metadata.
//!
//! Two provisioning operations against the same installation would diff
//! against and mutate the same on-disk state, so they must be mutually
//! exclusive. The lock is a plain `flock`-style advisory lock on a file
//! under the installation's metadata directory.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use fs2::FileExt;

use crate::errors::{CaravelError, CaravelResult};

const MAX_RETRIES: u32 = 5;

/// Exclusive advisory lock on an installation.
///
/// Held for the duration of one provisioning operation; released when
/// dropped.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
}

impl InstallLock {
    /// Acquire the lock at `path`, retrying with exponential backoff.
    ///
    /// Tries at 0ms, 100ms, 200ms, 400ms, 800ms before giving up.
    pub fn acquire(path: &Path) -> CaravelResult<Self> {
        if let Some(parent) = path.parent() {
            crate::fs::ensure_dir(parent).map_err(CaravelError::Io)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(CaravelError::Io)?;

        let mut last_error = None;
        for attempt in 0..MAX_RETRIES {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < MAX_RETRIES - 1 {
                        std::thread::sleep(Duration::from_millis(100 * (1 << attempt)));
                    }
                }
            }
        }

        if let Some(e) = last_error {
            return Err(CaravelError::Config {
                message: format!(
                    "could not lock installation at {}: another provisioning \
                     operation may be in progress ({e})",
                    path.display()
                ),
            }
            .into());
        }

        Ok(Self { file })
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("failed to release installation lock: {e}");
        }
    }
}
