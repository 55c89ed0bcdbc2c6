pub mod command;
pub mod export;
pub mod fetcher;
pub mod mirror;
pub mod repo_info;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::{
    accessor::AccessorError, cache::CacheError, model::ParseError, store::StoreError,
};

pub use command::{ExitOutcome, Git, GitError};
pub use fetcher::GitFetcher;
pub use repo_info::RepoInfo;

/// Branch name given to repositories we initialise ourselves, so that git
/// does not print its hint about the default branch name.
pub(crate) const INITIAL_BRANCH: &str = "__srcfetch_dummy_branch";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error("Mirror lock cannot be acquired: {0}")]
    Lock(#[from] crate::flock::Error),
    #[error("Git tree '{url}' is dirty")]
    DirtyTree { url: String },
    #[error("'{url}' is a shallow Git repository, but shallow repositories are only allowed when `shallow = true;` is specified")]
    ShallowMismatch { url: String },
    #[error("Cannot find Git revision '{rev}' in ref '{reference}' of repository '{url}'! Please make sure that the rev exists on the ref you've specified or add `allRefs = true;` to fetchGit.")]
    RevisionNotFound {
        rev: String,
        reference: String,
        url: String,
    },
    #[error("Cache entry for {0} lacks the `{1}` attribute")]
    MissingCacheAttribute(String, &'static str),
    #[error("Cloning a specific revision of '{0}' is not implemented")]
    CloneWithRev(String),
    #[error("'{0}' is not a local working tree")]
    NotAWorkingTree(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}
