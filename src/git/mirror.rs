use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::{flock::FileLock, model::Rev};

use super::{
    INITIAL_BRANCH,
    command::{ExitOutcome, Git, GitError},
    FetchError,
};

const MIRRORS_DIR: &str = "gitv3";

/// A bare repository under the cache directory that accumulates fetched refs
/// of one remote URL.
pub struct Mirror<'a> {
    git: &'a Git,
    dir: PathBuf,
}

impl<'a> Mirror<'a> {
    /// Directory holding all mirrors (and their lock files).
    pub fn root(cache_dir: &Path) -> PathBuf {
        cache_dir.join(MIRRORS_DIR)
    }

    pub fn path_for(cache_dir: &Path, url: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(url.as_bytes()));
        Self::root(cache_dir).join(hash)
    }

    /// Locks the mirror for `url` (creating it if needed). The returned lock
    /// must be held while refs are fetched or written.
    pub fn open(
        git: &'a Git,
        cache_dir: &Path,
        url: &str,
    ) -> Result<(Mirror<'a>, FileLock), FetchError> {
        let dir = Self::path_for(cache_dir, url);
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut lock_path = dir.clone().into_os_string();
        lock_path.push(".lock");
        let lock = FileLock::new(Path::new(&lock_path))?;

        let mirror = Mirror { git, dir };
        if !mirror.dir.exists() {
            info!("Creating mirror of {} at {}", url, mirror.dir.display());
            git.cmd()
                .arg("-c")
                .arg(format!("init.defaultBranch={INITIAL_BRANCH}"))
                .args(["init", "--quiet", "--bare"])
                .arg(&mirror.dir)
                .run()?;
        }
        Ok((mirror, lock))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file that tracks `reference` inside the mirror. Its mtime records
    /// when the reference was last fetched.
    pub fn ref_file(&self, reference: &str) -> PathBuf {
        if reference.starts_with("refs/") {
            self.dir.join(reference)
        } else {
            self.dir.join("refs/heads").join(reference)
        }
    }

    pub fn has_rev(&self, rev: &Rev) -> Result<bool, GitError> {
        let (outcome, _) = self
            .git
            .cmd()
            .dir(&self.dir)
            .args(["cat-file", "-e", rev.as_str()])
            .status()?;
        Ok(outcome == ExitOutcome::Success)
    }

    /// Whether the tracking file of `reference` is missing or older than
    /// `ttl`.
    pub fn is_stale(&self, reference: &str, ttl: Duration) -> bool {
        let modified = fs::metadata(self.ref_file(reference)).and_then(|m| m.modified());
        match modified {
            Ok(modified) => match SystemTime::now().duration_since(modified) {
                Ok(age) => age >= ttl,
                // Modified in the future.
                Err(_) => ttl.is_zero(),
            },
            Err(_) => true,
        }
    }

    /// Fetches `reference` (or every ref) from `url`. A failed fetch is not
    /// fatal if an older copy of the reference is available.
    pub fn fetch(&self, url: &str, reference: &str, all_refs: bool) -> Result<(), FetchError> {
        let source = if all_refs {
            "refs/*".to_owned()
        } else if reference.starts_with("refs/") || reference == "HEAD" {
            reference.to_owned()
        } else {
            format!("refs/heads/{reference}")
        };

        info!("Fetching Git repository {}", url);
        let result = self
            .git
            .cmd()
            .dir(&self.dir)
            .args(["fetch", "--quiet", "--force", "--", url])
            .arg(format!("{source}:{source}"))
            .run();

        let ref_file = self.ref_file(reference);
        if let Err(error) = result {
            if !ref_file.exists() {
                return Err(error.into());
            }
            warn!(
                "Could not update local clone of Git repository '{}'; continuing with the most recent version: {}",
                url, error
            );
        }

        if ref_file.exists() {
            fs::File::options()
                .write(true)
                .open(&ref_file)?
                .set_modified(SystemTime::now())?;
        }
        Ok(())
    }

    pub fn read_ref(&self, reference: &str) -> Result<Rev, FetchError> {
        let ref_file = self.ref_file(reference);
        let contents = fs::read_to_string(&ref_file)?;
        let rev = contents.trim().parse::<Rev>().map_err(|_| GitError::UnexpectedOutput {
            args: format!("(contents of {})", ref_file.display()),
            output: contents.clone(),
        })?;
        debug!("Reference {} of {} is at {}", reference, self.dir.display(), rev);
        Ok(rev)
    }
}
