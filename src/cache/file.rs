use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    model::Attrs,
    store::{Store, StorePath},
};

use super::{Cache, CacheError};

const CACHE_DIR: &str = "fetcher-cache-v1";

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    store_path: StorePath,
    locked: bool,
    timestamp: u64,
    key: Attrs,
    info: Attrs,
}

/// One TOML file per key under `<cache dir>/fetcher-cache-v1/`, named after
/// the SHA-256 of the key's canonical form.
pub struct FileCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FileCache {
    pub fn new(cache_dir: &Path, ttl: Duration) -> Result<FileCache, CacheError> {
        let dir = cache_dir.join(CACHE_DIR);
        fs::create_dir_all(&dir)?;
        Ok(FileCache { dir, ttl })
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        if self.dir.exists() {
            info!("Clearing fetcher cache {}", self.dir.display());
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn entry_path(&self, key: &Attrs) -> Result<PathBuf, CacheError> {
        let canonical = toml::to_string(key)?;
        let hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        Ok(self.dir.join(format!("{hash}.toml")))
    }

    fn read_entry(&self, path: &Path) -> Result<Option<Entry>, CacheError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        match toml::from_str(&contents) {
            Ok(entry) => Ok(Some(entry)),
            Err(error) => {
                warn!("Ignoring corrupt cache entry {}: {}", path.display(), error);
                Ok(None)
            }
        }
    }

    fn write_entry(&self, path: &Path, entry: &Entry) -> Result<(), CacheError> {
        let contents = toml::to_string(entry)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        file.write_all(contents.as_bytes())?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl Cache for FileCache {
    fn add(
        &self,
        store: &dyn Store,
        key: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), CacheError> {
        let path = self.entry_path(key)?;

        if let Some(existing) = self.read_entry(&path)? {
            if existing.locked && existing.key == *key && store.is_valid_path(&existing.store_path)
            {
                if existing.store_path == *store_path && existing.info == *info {
                    trace!("Locked cache entry {} is already up to date", path.display());
                    return Ok(());
                }
                return Err(CacheError::Conflict {
                    key: format!("{key:?}"),
                    existing: existing.store_path.to_string(),
                    new: store_path.to_string(),
                });
            }
        }

        debug!(
            "Caching {} as {} (locked: {})",
            store_path,
            path.display(),
            locked
        );
        self.write_entry(
            &path,
            &Entry {
                store_path: store_path.clone(),
                locked,
                timestamp: now(),
                key: key.clone(),
                info: info.clone(),
            },
        )
    }

    fn lookup(
        &self,
        store: &dyn Store,
        key: &Attrs,
    ) -> Result<Option<(Attrs, StorePath)>, CacheError> {
        let path = self.entry_path(key)?;
        let Some(entry) = self.read_entry(&path)? else {
            return Ok(None);
        };
        if entry.key != *key {
            return Ok(None);
        }
        if !entry.locked && now() >= entry.timestamp.saturating_add(self.ttl.as_secs()) {
            debug!("Cache entry {} has expired", path.display());
            return Ok(None);
        }
        if !store.is_valid_path(&entry.store_path) {
            debug!(
                "Cache entry {} points to missing store path {}",
                path.display(),
                entry.store_path
            );
            return Ok(None);
        }
        Ok(Some((entry.info, entry.store_path)))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        accessor::{accept_all, MemoryInputAccessor, SourcePath},
        model::Attr,
        store::{FileIngestionMethod, HashAlgorithm, LocalStore},
    };

    use super::*;

    use pretty_assertions::assert_eq;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: LocalStore,
        cache_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let store = LocalStore::new(dir.path().join("store")).unwrap();
            let cache_dir = dir.path().join("cache");
            Fixture {
                _dir: dir,
                store,
                cache_dir,
            }
        }

        fn add_path(&self, contents: &str) -> StorePath {
            let mut accessor = MemoryInputAccessor::new();
            accessor.add_file("/file", contents.as_bytes().to_vec()).unwrap();
            self.store
                .add_to_store(
                    "file",
                    &SourcePath::new(&accessor, crate::accessor::CanonPath::new("/file").unwrap()),
                    FileIngestionMethod::Flat,
                    HashAlgorithm::Sha256,
                    &accept_all,
                )
                .unwrap()
        }
    }

    fn attrs(pairs: &[(&str, Attr)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn key() -> Attrs {
        attrs(&[
            ("type", Attr::from("git")),
            ("name", Attr::from("source")),
            ("rev", Attr::from("0123456789abcdef0123456789abcdef01234567")),
        ])
    }

    #[test]
    fn locked_entries_persist_and_refuse_conflicts() {
        let fixture = Fixture::new();
        let cache = FileCache::new(&fixture.cache_dir, Duration::from_secs(3600)).unwrap();
        let path = fixture.add_path("one");
        let info = attrs(&[("lastModified", Attr::Int(1700000000))]);

        assert_eq!(cache.lookup(&fixture.store, &key()).unwrap(), None);
        cache.add(&fixture.store, &key(), &info, &path, true).unwrap();
        assert_eq!(
            cache.lookup(&fixture.store, &key()).unwrap(),
            Some((info.clone(), path.clone()))
        );

        // Same content again is a no-op.
        cache.add(&fixture.store, &key(), &info, &path, true).unwrap();

        let other = fixture.add_path("two");
        assert!(matches!(
            cache.add(&fixture.store, &key(), &info, &other, true),
            Err(CacheError::Conflict { .. })
        ));
    }

    #[test]
    fn unlocked_entries_expire() {
        let fixture = Fixture::new();
        let path = fixture.add_path("one");
        let info = Attrs::new();

        let expired = FileCache::new(&fixture.cache_dir, Duration::ZERO).unwrap();
        expired.add(&fixture.store, &key(), &info, &path, false).unwrap();
        assert_eq!(expired.lookup(&fixture.store, &key()).unwrap(), None);

        let fresh = FileCache::new(&fixture.cache_dir, Duration::from_secs(3600)).unwrap();
        assert!(fresh.lookup(&fixture.store, &key()).unwrap().is_some());

        // Unlocked entries are simply replaced.
        let other = fixture.add_path("two");
        fresh.add(&fixture.store, &key(), &info, &other, false).unwrap();
        assert_eq!(
            fresh.lookup(&fixture.store, &key()).unwrap().map(|(_, p)| p),
            Some(other)
        );
    }

    #[test]
    fn invalid_store_paths_are_misses() {
        let fixture = Fixture::new();
        let cache = FileCache::new(&fixture.cache_dir, Duration::from_secs(3600)).unwrap();
        let path = fixture.add_path("one");
        cache.add(&fixture.store, &key(), &Attrs::new(), &path, true).unwrap();

        fs::remove_file(fixture.store.real_path(&path)).unwrap();
        assert_eq!(cache.lookup(&fixture.store, &key()).unwrap(), None);

        // With the old path gone the locked entry may be replaced.
        let other = fixture.add_path("two");
        cache.add(&fixture.store, &key(), &Attrs::new(), &other, true).unwrap();

        cache.clear().unwrap();
        assert_eq!(cache.lookup(&fixture.store, &key()).unwrap(), None);
    }
}
