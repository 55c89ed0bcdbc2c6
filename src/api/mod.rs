use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;

use crate::{
    accessor::InputAccessor,
    cache::FileCache,
    cli::command_handlers::{do_clear_cache, do_fetch, do_hash_path},
    config::FetchSettings,
    git::GitFetcher,
    model::Input,
    store::{ContentHash, HashAlgorithm, LocalStore, Store, StorePath},
};

mod builder;

pub use builder::SrcfetchBuilder;

pub struct Srcfetch {
    settings: FetchSettings,
    store: LocalStore,
    cache: Arc<FileCache>,
    fetcher: GitFetcher,
}

/// Result of [`Srcfetch::fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub store_path: StorePath,
    /// Location of the fetched tree on disk.
    pub path: PathBuf,
    /// The input with everything learned while fetching filled in.
    pub input: Input,
    pub nar_hash: ContentHash,
}

impl Srcfetch {
    pub fn builder() -> SrcfetchBuilder {
        SrcfetchBuilder::default()
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn fetcher(&self) -> &GitFetcher {
        &self.fetcher
    }

    /// Fetches a Git input into the store. If the input pins a `narHash`, the
    /// fetched tree must match it.
    pub fn fetch(&self, input: &Input) -> anyhow::Result<Fetched> {
        let fetched = do_fetch(&self.fetcher, &self.store, input)?;
        if let Some(expected) = input.nar_hash() {
            let expected: ContentHash = expected.parse()?;
            let actual = if expected.algorithm == fetched.nar_hash.algorithm {
                fetched.nar_hash.clone()
            } else {
                do_hash_path(&fetched.path, expected.algorithm)?
            };
            if actual != expected {
                bail!(
                    "NAR hash mismatch in input '{}': expected '{}' but got '{}'",
                    input,
                    expected,
                    actual
                );
            }
        }
        Ok(fetched)
    }

    /// Gives access to the tree of a Git input, fetching it only if it is
    /// not a local working tree.
    pub fn lazy_fetch(&self, input: &Input) -> anyhow::Result<(Arc<dyn InputAccessor>, Input)> {
        Ok(self.fetcher.lazy_fetch(&self.store, input)?)
    }

    /// Clones the repository of `input` into `dest`.
    pub fn clone(&self, input: &Input, dest: impl AsRef<Path>) -> anyhow::Result<()> {
        Ok(self.fetcher.clone(input, dest.as_ref())?)
    }

    /// Hashes the canonical dump of a directory tree.
    pub fn hash_path(&self, path: impl AsRef<Path>) -> anyhow::Result<ContentHash> {
        do_hash_path(path.as_ref(), HashAlgorithm::Sha256)
    }

    /// Forgets all cached fetch results and Git mirrors. The store is kept.
    pub fn clear_cache(&self) -> anyhow::Result<()> {
        do_clear_cache(&self.cache, &self.settings.cache_dir)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, process::Command};

    use crate::model::Attr;

    use super::*;

    use pretty_assertions::assert_eq;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args([
                "-c",
                "init.defaultBranch=main",
                "-c",
                "user.name=Test",
                "-c",
                "user.email=test@example.org",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn fixture() -> (tempfile::TempDir, Srcfetch, Input) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        fs::write(repo.join("README"), "hello\n").unwrap();
        git(&repo, &["add", "README"]);
        git(&repo, &["commit", "--quiet", "-m", "init"]);

        let srcfetch = Srcfetch::builder()
            .settings(FetchSettings::new(dir.path().join("cache")))
            .try_build()
            .unwrap();
        let input = Input::from_url(&format!("git+file://{}?ref=main", repo.display())).unwrap();
        (dir, srcfetch, input)
    }

    fn with_nar_hash(input: &Input, nar_hash: &str) -> Input {
        let mut attrs = input.to_attrs();
        attrs.insert("narHash".to_owned(), Attr::from(nar_hash));
        Input::from_attrs(&attrs).unwrap()
    }

    #[test]
    fn fetch_verifies_pinned_nar_hash() {
        let (_dir, srcfetch, input) = fixture();

        let fetched = srcfetch.fetch(&input).unwrap();
        assert_eq!(fetched.path, srcfetch.store().real_path(&fetched.store_path));
        assert_eq!(srcfetch.hash_path(&fetched.path).unwrap(), fetched.nar_hash);

        let pinned = with_nar_hash(&input, &fetched.nar_hash.to_string());
        assert_eq!(srcfetch.fetch(&pinned).unwrap().store_path, fetched.store_path);

        let wrong = with_nar_hash(&input, &format!("sha256:{}", "0".repeat(64)));
        let error = srcfetch.fetch(&wrong).unwrap_err();
        assert!(error.to_string().contains("NAR hash mismatch"), "{error}");
    }

    #[test]
    fn clear_cache_removes_mirrors_and_entries() {
        let (dir, srcfetch, input) = fixture();
        let srcfetch = Srcfetch {
            fetcher: GitFetcher::new(
                FetchSettings {
                    force_remote: true,
                    ..srcfetch.settings.clone()
                },
                srcfetch.cache.clone(),
            ),
            ..srcfetch
        };

        srcfetch.fetch(&input).unwrap();
        let mirrors = dir.path().join("cache/gitv3");
        assert!(fs::read_dir(&mirrors).unwrap().next().is_some());

        srcfetch.clear_cache().unwrap();
        assert!(!mirrors.exists());
        let entries = dir.path().join("cache/fetcher-cache-v1");
        assert!(fs::read_dir(entries).unwrap().next().is_none());

        // The store itself survives.
        assert!(dir.path().join("cache/store").exists());
    }
}
