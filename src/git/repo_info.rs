use std::{collections::BTreeSet, path::Path};

use git2::{BranchType, Repository};
use log::{debug, warn};

use crate::{config::FetchSettings, model::Input};

use super::{
    command::{ExitOutcome, Git, GitError},
    FetchError,
};

/// What the fetcher learns about a repository before touching the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub shallow: bool,
    pub submodules: bool,
    pub all_refs: bool,
    /// Namespaces cache entries by the flags that change the fetched tree.
    pub cache_type: String,
    /// A working tree on this machine that is used in place, without a
    /// mirror.
    pub is_local: bool,
    /// Whether the working tree has uncommitted changes (or no commits at
    /// all). Only determined for local inputs without `ref` and `rev`.
    pub is_dirty: bool,
    /// Assumed true unless the dirty check found no local branches.
    pub has_commits: bool,
    /// Filesystem path for local repositories, URL without query otherwise.
    pub url: String,
}

impl RepoInfo {
    pub fn resolve(
        input: &Input,
        settings: &FetchSettings,
        git: &Git,
    ) -> Result<RepoInfo, FetchError> {
        let shallow = input.is_shallow();
        let submodules = input.has_submodules();
        let all_refs = input.all_refs();

        let mut cache_type = "git".to_owned();
        if shallow {
            cache_type.push_str("-shallow");
        }
        if submodules {
            cache_type.push_str("-submodules");
        }
        if all_refs {
            cache_type.push_str("-all-refs");
        }

        // Bare repositories behind file:// URLs are cloned like remote ones.
        let local_path = input
            .file_path()
            .filter(|path| !settings.force_remote && path.join(".git").exists());
        let url = match &local_path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => {
                let mut url = input.url().clone();
                url.set_query(None);
                url.set_fragment(None);
                url.to_string()
            }
        };

        let mut repo_info = RepoInfo {
            shallow,
            submodules,
            all_refs,
            cache_type,
            is_local: local_path.is_some(),
            is_dirty: false,
            has_commits: true,
            url,
        };

        if let Some(path) = local_path {
            if input.git_ref().is_none() && input.rev().is_none() {
                repo_info.has_commits = has_commits(&path)?;
                repo_info.is_dirty = !repo_info.has_commits || has_changes(&path, git)?;
                debug!(
                    "Working tree {} is {}",
                    path.display(),
                    if repo_info.is_dirty { "dirty" } else { "clean" }
                );
            }
        }

        Ok(repo_info)
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.url)
    }

    /// Applies the dirty-tree policy.
    pub fn check_dirty(&self, settings: &FetchSettings) -> Result<(), FetchError> {
        if self.is_dirty {
            if !settings.allow_dirty {
                return Err(FetchError::DirtyTree {
                    url: self.url.clone(),
                });
            }
            if settings.warn_dirty {
                warn!("Git tree '{}' is dirty", self.url);
            }
        }
        Ok(())
    }

    /// Paths of all tracked files, relative to the working tree root.
    pub fn list_files(&self, git: &Git) -> Result<BTreeSet<String>, FetchError> {
        let mut command = git.cmd().dir(self.path()).args(["ls-files", "-z"]);
        if self.submodules {
            command = command.arg("--recurse-submodules");
        }
        let output = command.run()?;
        Ok(output
            .split('\0')
            .filter(|file| !file.is_empty())
            .map(str::to_owned)
            .collect())
    }
}

fn has_commits(path: &Path) -> Result<bool, GitError> {
    let repo = Repository::open(path)?;
    let mut branches = repo.branches(Some(BranchType::Local))?;
    let found = branches.next().transpose()?.is_some();
    Ok(found)
}

fn has_changes(path: &Path, git: &Git) -> Result<bool, GitError> {
    let command = git
        .cmd()
        .dir(path)
        .args(["diff-index", "--quiet", "HEAD", "--"]);
    match command.status()? {
        (ExitOutcome::Success, _) => Ok(false),
        (ExitOutcome::Code(1), _) => Ok(true),
        (ExitOutcome::Code(code), output) => Err(GitError::Failed {
            args: "diff-index --quiet HEAD --".to_owned(),
            code,
            stderr: output.trim().to_owned(),
        }),
    }
}
