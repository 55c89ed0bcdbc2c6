use std::{fs::File, path::Path, time::Instant};

use fs4::fs_std::FileExt;
use log::{debug, trace};
use thiserror::Error;

/// Exclusive advisory lock on a file, held until the guard is dropped.
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] std::io::Error);

impl FileLock {
    /// Blocks until the lock is acquired. Other processes fetching into the
    /// same mirror queue up behind the holder.
    pub fn new(path: &Path) -> Result<Self, Error> {
        let file = File::create(path)?;
        let start = Instant::now();
        trace!("Acquiring a lock on {}", path.display());
        file.lock_exclusive()?;
        debug!(
            "Acquired a lock on {} after {:?}",
            path.display(),
            start.elapsed()
        );
        Ok(Self { _file: file })
    }
}
