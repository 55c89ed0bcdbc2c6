use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{cache::FileCache, config::FetchSettings, git::GitFetcher, store::LocalStore, Srcfetch};

#[derive(Default)]
pub struct SrcfetchBuilder {
    settings: Option<FetchSettings>,
    cache_directory_path: Option<PathBuf>,
    store_directory_path: Option<PathBuf>,
    ttl: Option<Duration>,
    force_remote: Option<bool>,
}

impl SrcfetchBuilder {
    /// Complete settings to start from.
    ///
    /// Defaults to the configuration file and `SRCFETCH_*` environment
    /// variables, see [`FetchSettings::load`].
    pub fn settings(mut self, settings: FetchSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Location of the cache directory holding Git mirrors and fetch results.
    /// A store left at its default location moves along with it.
    ///
    /// Defaults to `$XDG_CACHE_HOME/srcfetch`.
    pub fn cache_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_directory_path = Some(path.into());
        self
    }

    /// Location of the store.
    ///
    /// Defaults to `store` inside the cache directory.
    pub fn store_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_directory_path = Some(path.into());
        self
    }

    /// How long fetched branches are reused before they are fetched again.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Treat `file://` working trees like remote repositories.
    pub fn force_remote(mut self, force_remote: bool) -> Self {
        self.force_remote = Some(force_remote);
        self
    }

    pub fn try_build(self) -> anyhow::Result<Srcfetch> {
        let Self {
            settings,
            cache_directory_path,
            store_directory_path,
            ttl,
            force_remote,
        } = self;
        let mut settings = match settings {
            Some(settings) => settings,
            None => FetchSettings::load()?,
        };

        if let Some(cache_directory) = cache_directory_path {
            // A store that still sits at its default place follows the cache.
            if settings.store_dir == FetchSettings::new(&settings.cache_dir).store_dir {
                settings.store_dir = FetchSettings::new(&cache_directory).store_dir;
            }
            settings.cache_dir = cache_directory;
        }
        if let Some(store_directory) = store_directory_path {
            settings.store_dir = store_directory;
        }
        if let Some(ttl) = ttl {
            settings.ttl = ttl;
        }
        if let Some(force_remote) = force_remote {
            settings.force_remote = force_remote;
        }

        let store = LocalStore::new(&settings.store_dir)?;
        let cache = Arc::new(FileCache::new(&settings.cache_dir, settings.ttl)?);
        let fetcher = GitFetcher::new(settings.clone(), cache.clone());

        Ok(Srcfetch {
            settings,
            store,
            cache,
            fetcher,
        })
    }
}
