mod file;

use thiserror::Error;

use crate::{
    model::Attrs,
    store::{Store, StorePath},
};

pub use file::FileCache;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Locked cache entry for {key} already points to {existing}, refusing to replace it with {new}")]
    Conflict {
        key: String,
        existing: String,
        new: String,
    },
    #[error("Cannot serialize cache entry: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

/// Maps fetch inputs to store paths plus the attributes learned while
/// fetching them.
///
/// Locked entries describe immutable content and never expire; unlocked ones
/// describe mutable references and expire after the cache's time-to-live.
/// Entries whose store path is no longer valid are reported as misses.
pub trait Cache: Send + Sync {
    fn add(
        &self,
        store: &dyn Store,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), CacheError>;

    fn lookup(
        &self,
        store: &dyn Store,
        key: &Attrs,
    ) -> Result<Option<(Attrs, StorePath)>, CacheError>;
}
