use std::{io, path::Path};

use log::debug;
use tempfile::TempDir;

use crate::{accessor::CanonPath, model::Rev};

use super::{
    INITIAL_BRANCH,
    command::{ExitOutcome, Git},
    FetchError,
};

/// A revision checked out into a scratch directory. Everything is removed
/// when the value is dropped.
pub struct ScratchTree {
    dir: TempDir,
    _git_dir: Option<TempDir>,
    /// Submodule checkouts contain `.git` files that are not part of the
    /// source.
    skip_git_entries: bool,
}

impl ScratchTree {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn keep(&self, path: &CanonPath) -> bool {
        !(self.skip_git_entries && path.base_name() == Some(".git"))
    }
}

/// Makes sure `rev` exists in `repo_dir` before exporting it.
pub fn ensure_commit(
    git: &Git,
    repo_dir: &Path,
    rev: &Rev,
    reference: &str,
    url: &str,
) -> Result<(), FetchError> {
    let (outcome, output) = git
        .cmd()
        .dir(repo_dir)
        .args(["cat-file", "commit", rev.as_str()])
        .status()?;
    if outcome == ExitOutcome::Code(128) && output.contains("bad file") {
        return Err(FetchError::RevisionNotFound {
            rev: rev.to_string(),
            reference: reference.to_owned(),
            url: url.to_owned(),
        });
    }
    Ok(())
}

/// Writes the tree of `rev` into a fresh scratch directory.
pub fn export(
    git: &Git,
    repo_dir: &Path,
    rev: &Rev,
    submodules: bool,
    url: &str,
) -> Result<ScratchTree, FetchError> {
    let dir = tempfile::Builder::new().prefix("srcfetch-").tempdir()?;
    if submodules {
        let git_dir = tempfile::Builder::new().prefix("srcfetch-git-").tempdir()?;
        checkout_with_submodules(git, repo_dir, rev, url, dir.path(), git_dir.path())?;
        Ok(ScratchTree {
            dir,
            _git_dir: Some(git_dir),
            skip_git_entries: true,
        })
    } else {
        archive(git, repo_dir, rev, dir.path())?;
        Ok(ScratchTree {
            dir,
            _git_dir: None,
            skip_git_entries: false,
        })
    }
}

fn archive(git: &Git, repo_dir: &Path, rev: &Rev, dest: &Path) -> Result<(), FetchError> {
    debug!("Exporting {} from {} to {}", rev, repo_dir.display(), dest.display());
    let mut stream = git
        .cmd()
        .dir(repo_dir)
        .args(["archive", rev.as_str()])
        .stream()?;
    tar::Archive::new(&mut stream).unpack(dest)?;
    // Drain the end-of-archive padding so that git exits normally.
    io::copy(&mut stream, &mut io::sink())?;
    stream.finish()?;
    Ok(())
}

fn checkout_with_submodules(
    git: &Git,
    repo_dir: &Path,
    rev: &Rev,
    url: &str,
    dest: &Path,
    git_dir: &Path,
) -> Result<(), FetchError> {
    debug!(
        "Checking out {} from {} with submodules to {}",
        rev,
        repo_dir.display(),
        dest.display()
    );
    git.cmd()
        .arg("-c")
        .arg(format!("init.defaultBranch={INITIAL_BRANCH}"))
        .args(["init", "--quiet"])
        .arg(dest)
        .arg("--separate-git-dir")
        .arg(git_dir)
        .run()?;
    // The mirror may only have the revision without the ref, so take
    // everything it has.
    git.cmd()
        .dir(dest)
        .args(["fetch", "--quiet", "--force", "--update-head-ok", "--"])
        .arg(repo_dir)
        .arg("refs/*:refs/*")
        .run()?;
    git.cmd()
        .dir(dest)
        .args(["checkout", "--quiet", rev.as_str()])
        .run()?;
    git.cmd()
        .dir(dest)
        .args(["remote", "add", "origin", url])
        .run()?;
    git.cmd()
        .dir(dest)
        .args(["submodule", "--quiet", "update", "--init", "--recursive"])
        .run()?;
    Ok(())
}
