use std::{fs, path::Path};

use log::info;

use crate::{
    accessor::{accept_all, FsInputAccessor, SourcePath},
    api::Fetched,
    cache::FileCache,
    git::{mirror::Mirror, GitFetcher},
    model::{Input, Rev},
    store::{hash_path, ContentHash, HashAlgorithm, LocalStore, Store},
};

/// Handler to fetch command
pub fn do_fetch(fetcher: &GitFetcher, store: &LocalStore, input: &Input) -> anyhow::Result<Fetched> {
    let (store_path, input) = fetcher.fetch(store, input)?;
    let nar_hash = store.query_nar_hash(&store_path)?;
    let path = store.real_path(&store_path);
    info!("Fetched {} into {}", input, path.display());
    Ok(Fetched {
        store_path,
        path,
        input,
        nar_hash,
    })
}

/// Handler to hash-path command
pub fn do_hash_path(path: &Path, algorithm: HashAlgorithm) -> anyhow::Result<ContentHash> {
    let accessor = FsInputAccessor::new(path, None)?;
    Ok(hash_path(&SourcePath::root(&accessor), algorithm, &accept_all)?)
}

/// Handler to to-url command
pub fn do_to_url(url: &str, reference: Option<&str>, rev: Option<&str>) -> anyhow::Result<String> {
    let input = Input::from_url(url)?;
    let rev = rev.map(str::parse::<Rev>).transpose()?;
    let input = input.apply_overrides(reference, rev.as_ref())?;
    Ok(input.to_url()?.to_string())
}

/// Handler to clear-cache command
pub fn do_clear_cache(cache: &FileCache, cache_dir: &Path) -> anyhow::Result<()> {
    cache.clear()?;
    let mirrors = Mirror::root(cache_dir);
    if mirrors.exists() {
        info!("Removing Git mirrors in {}", mirrors.display());
        fs::remove_dir_all(&mirrors)?;
    }
    Ok(())
}
