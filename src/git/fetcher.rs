use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};

use crate::{
    accessor::{CanonPath, FileType, FsInputAccessor, InputAccessor, SourcePath},
    cache::Cache,
    config::FetchSettings,
    model::{Attr, Attrs, Input, Rev},
    store::{FileIngestionMethod, HashAlgorithm, Store, StorePath},
};

use super::{
    command::Git,
    export::{ensure_commit, export},
    mirror::Mirror,
    repo_info::RepoInfo,
    FetchError,
};

/// Fetches Git inputs into a store, consulting and populating a cache of
/// previous results.
pub struct GitFetcher {
    settings: FetchSettings,
    git: Git,
    cache: Arc<dyn Cache>,
}

impl GitFetcher {
    pub fn new(settings: FetchSettings, cache: Arc<dyn Cache>) -> GitFetcher {
        let git = Git::new(settings.git_program.clone());
        GitFetcher {
            settings,
            git,
            cache,
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Copies the tree described by `input` into `store`. The returned input
    /// has its reference, revision and commit metadata filled in.
    pub fn fetch(&self, store: &dyn Store, input: &Input) -> Result<(StorePath, Input), FetchError> {
        let repo_info = RepoInfo::resolve(input, &self.settings, &self.git)?;
        let requested_rev = input.rev().cloned();
        let mut input = input.clone();
        let name = input.name().to_owned();

        if let Some(rev) = &requested_rev {
            let key = immutable_key(&repo_info, &name, rev);
            if let Some((info, store_path)) = self.cache.lookup(store, &key)? {
                debug!("Found {} in the cache: {}", rev, store_path);
                return make_result(&repo_info, input, &info, store_path);
            }
        }

        if repo_info.is_dirty {
            return self.fetch_working_tree(store, &repo_info, input);
        }

        let reference = match input.git_ref() {
            Some(reference) => reference.to_owned(),
            None => {
                let reference = if repo_info.is_local {
                    self.git
                        .cmd()
                        .dir(repo_info.path())
                        .args(["rev-parse", "--abbrev-ref", "HEAD"])
                        .run_line()?
                } else {
                    self.settings.default_ref.clone()
                };
                input.set_ref(reference.clone());
                reference
            }
        };

        let mutable_key = mutable_key(&repo_info, &name, &reference);

        let (repo_dir, rev) = if repo_info.is_local {
            let rev = match &requested_rev {
                Some(rev) => rev.clone(),
                None => self
                    .git
                    .cmd()
                    .dir(repo_info.path())
                    .args(["rev-parse", &reference])
                    .run_parsed::<Rev>()?,
            };
            (repo_info.path().to_path_buf(), rev)
        } else {
            if let Some((info, store_path)) = self.cache.lookup(store, &mutable_key)? {
                let cached_rev = info.get("rev").and_then(Attr::as_str).ok_or_else(|| {
                    FetchError::MissingCacheAttribute(repo_info.url.clone(), "rev")
                })?;
                let cached_rev = cached_rev.parse::<Rev>()?;
                if requested_rev.as_ref().map_or(true, |rev| *rev == cached_rev) {
                    debug!("Found {} of {} in the cache: {}", reference, repo_info.url, cached_rev);
                    input.set_rev(cached_rev);
                    return make_result(&repo_info, input, &info, store_path);
                }
            }
            self.update_mirror(&repo_info, &reference, requested_rev.as_ref())?
        };
        input.set_rev(rev.clone());

        let shallow = self
            .git
            .cmd()
            .dir(&repo_dir)
            .args(["rev-parse", "--is-shallow-repository"])
            .run_line()?;
        if shallow == "true" && !repo_info.shallow {
            return Err(FetchError::ShallowMismatch {
                url: repo_info.url.clone(),
            });
        }

        // Another process may have finished the same revision in the meantime.
        let immutable_key = immutable_key(&repo_info, &name, &rev);
        if let Some((info, store_path)) = self.cache.lookup(store, &immutable_key)? {
            debug!("Found {} in the cache: {}", rev, store_path);
            return make_result(&repo_info, input, &info, store_path);
        }

        ensure_commit(&self.git, &repo_dir, &rev, &reference, &repo_info.url)?;
        info!("Copying Git revision {} of {}", rev, repo_info.url);
        let scratch = export(
            &self.git,
            &repo_dir,
            &rev,
            repo_info.submodules,
            &repo_info.url,
        )?;
        let accessor = FsInputAccessor::new(scratch.path(), None)?;
        let store_path = store.add_to_store(
            &name,
            &SourcePath::root(&accessor),
            FileIngestionMethod::Recursive,
            HashAlgorithm::Sha256,
            &|path: &CanonPath| scratch.keep(path),
        )?;

        let last_modified = self
            .git
            .cmd()
            .dir(&repo_dir)
            .args(["log", "-1", "--format=%ct", "--no-show-signature", rev.as_str()])
            .run_parsed::<u64>()?;
        let mut info = Attrs::from([
            ("rev".to_owned(), Attr::from(rev.as_str())),
            ("lastModified".to_owned(), Attr::from(last_modified)),
        ]);
        if !repo_info.shallow {
            let rev_count = self
                .git
                .cmd()
                .dir(&repo_dir)
                .args(["rev-list", "--count", rev.as_str()])
                .run_parsed::<u64>()?;
            info.insert("revCount".to_owned(), Attr::from(rev_count));
        }

        if requested_rev.is_none() {
            self.cache
                .add(store, &mutable_key, &info, &store_path, false)?;
        }
        self.cache
            .add(store, &immutable_key, &info, &store_path, true)?;

        make_result(&repo_info, input, &info, store_path)
    }

    /// Brings the mirror of a remote repository up to date as far as needed
    /// and resolves the revision. Returns the mirror directory and the
    /// revision.
    fn update_mirror(
        &self,
        repo_info: &RepoInfo,
        reference: &str,
        requested_rev: Option<&Rev>,
    ) -> Result<(PathBuf, Rev), FetchError> {
        let (mirror, _lock) = Mirror::open(&self.git, &self.settings.cache_dir, &repo_info.url)?;

        let needs_fetch = match requested_rev {
            Some(rev) => !mirror.has_rev(rev)?,
            None => repo_info.all_refs || mirror.is_stale(reference, self.settings.ttl),
        };
        if needs_fetch {
            mirror.fetch(&repo_info.url, reference, repo_info.all_refs)?;
        } else {
            debug!(
                "Reusing {} of {} from {}",
                reference,
                repo_info.url,
                mirror.dir().display()
            );
        }

        let rev = match requested_rev {
            Some(rev) => rev.clone(),
            None => mirror.read_ref(reference)?,
        };
        Ok((mirror.dir().to_path_buf(), rev))
    }

    /// Copies the tracked files of an uncommitted working tree as they are
    /// on disk. Such trees have no stable identity, so nothing is cached.
    fn fetch_working_tree(
        &self,
        store: &dyn Store,
        repo_info: &RepoInfo,
        mut input: Input,
    ) -> Result<(StorePath, Input), FetchError> {
        repo_info.check_dirty(&self.settings)?;

        let files = repo_info.list_files(&self.git)?;
        let accessor = FsInputAccessor::new(repo_info.path(), None)?;
        let store_path = store.add_to_store(
            input.name(),
            &SourcePath::root(&accessor),
            FileIngestionMethod::Recursive,
            HashAlgorithm::Sha256,
            &|path: &CanonPath| is_tracked(&accessor, &files, path),
        )?;

        let last_modified = if repo_info.has_commits {
            self.git
                .cmd()
                .dir(repo_info.path())
                .args(["log", "-1", "--format=%ct", "--no-show-signature", "HEAD"])
                .run_parsed::<u64>()?
        } else {
            0
        };
        input.set_last_modified(last_modified);
        Ok((store_path, input))
    }

    /// Like [`GitFetcher::fetch`], but gives access to the tree instead of a
    /// store path. Working trees are read in place, limited to tracked files.
    pub fn lazy_fetch(
        &self,
        store: &dyn Store,
        input: &Input,
    ) -> Result<(Arc<dyn InputAccessor>, Input), FetchError> {
        let repo_info = RepoInfo::resolve(input, &self.settings, &self.git)?;
        if repo_info.is_local && input.git_ref().is_none() && input.rev().is_none() {
            repo_info.check_dirty(&self.settings)?;
            let files = repo_info.list_files(&self.git)?;
            let accessor = FsInputAccessor::new(repo_info.path(), Some(files))?;
            return Ok((Arc::new(accessor), input.clone()));
        }

        let (store_path, input) = self.fetch(store, input)?;
        let accessor = FsInputAccessor::new(store.real_path(&store_path), None)?;
        Ok((Arc::new(accessor), input))
    }

    /// Clones the repository into `dest`, checking out `ref` if given.
    pub fn clone(&self, input: &Input, dest: &Path) -> Result<(), FetchError> {
        if input.rev().is_some() {
            return Err(FetchError::CloneWithRev(input.to_string()));
        }
        let repo_info = RepoInfo::resolve(input, &self.settings, &self.git)?;

        let mut command = self.git.cmd().arg("clone").arg(&repo_info.url);
        if let Some(reference) = input.git_ref() {
            command = command.args(["--branch", reference]);
        }
        info!("Cloning {} into {}", repo_info.url, dest.display());
        command.arg(dest).run()?;
        Ok(())
    }

    /// The working tree an input refers to, if it is used in place.
    pub fn source_path(&self, input: &Input) -> Option<PathBuf> {
        if input.git_ref().is_some() || input.rev().is_some() {
            return None;
        }
        input.file_path()
    }

    /// Makes a new file in the working tree visible to later fetches by
    /// adding it to the index, and optionally commits it.
    pub fn mark_changed_file(
        &self,
        input: &Input,
        file: &str,
        commit_message: Option<&str>,
    ) -> Result<(), FetchError> {
        let source_path = self
            .source_path(input)
            .ok_or_else(|| FetchError::NotAWorkingTree(input.to_string()))?;

        self.git
            .cmd()
            .dir(&source_path)
            .args(["add", "--force", "--intent-to-add", "--", file])
            .run()?;
        if let Some(message) = commit_message {
            self.git
                .cmd()
                .dir(&source_path)
                .args(["commit", file, "-m", message])
                .run()?;
        }
        Ok(())
    }
}

fn immutable_key(repo_info: &RepoInfo, name: &str, rev: &Rev) -> Attrs {
    Attrs::from([
        ("type".to_owned(), Attr::from(repo_info.cache_type.as_str())),
        ("name".to_owned(), Attr::from(name)),
        ("rev".to_owned(), Attr::from(rev.as_str())),
    ])
}

fn mutable_key(repo_info: &RepoInfo, name: &str, reference: &str) -> Attrs {
    Attrs::from([
        ("type".to_owned(), Attr::from(repo_info.cache_type.as_str())),
        ("name".to_owned(), Attr::from(name)),
        ("url".to_owned(), Attr::from(repo_info.url.as_str())),
        ("ref".to_owned(), Attr::from(reference)),
    ])
}

fn make_result(
    repo_info: &RepoInfo,
    mut input: Input,
    info: &Attrs,
    store_path: StorePath,
) -> Result<(StorePath, Input), FetchError> {
    let int_attr = |name: &'static str| {
        info.get(name)
            .and_then(Attr::as_int)
            .ok_or_else(|| FetchError::MissingCacheAttribute(repo_info.url.clone(), name))
    };
    if !repo_info.shallow {
        input.set_rev_count(int_attr("revCount")?);
    }
    input.set_last_modified(int_attr("lastModified")?);
    Ok((store_path, input))
}

/// Accepts tracked files and the directories that lead to them.
fn is_tracked(accessor: &FsInputAccessor, files: &BTreeSet<String>, path: &CanonPath) -> bool {
    if path.is_root() {
        return true;
    }
    let file = path.rel();
    match accessor.lstat(path) {
        Ok(stat) if stat.file_type == FileType::Directory => {
            let prefix = format!("{file}/");
            files
                .range(prefix.clone()..)
                .next()
                .is_some_and(|tracked| tracked.starts_with(&prefix))
        }
        Ok(_) => files.contains(file),
        Err(_) => false,
    }
}
