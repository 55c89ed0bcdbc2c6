use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use log::trace;

use super::{
    next_accessor_number, AccessorError, CanonPath, DirEntries, FileType, InputAccessor, Stat,
};

/// Exposes a directory tree, optionally restricted to a set of allowed
/// sub-paths (e.g. the tracked files of a Git working tree).
pub struct FsInputAccessor {
    number: usize,
    root: PathBuf,
    real_root: PathBuf,
    allowed_paths: Option<BTreeSet<String>>,
}

impl FsInputAccessor {
    pub fn new(
        root: impl Into<PathBuf>,
        allowed_paths: Option<BTreeSet<String>>,
    ) -> Result<FsInputAccessor, AccessorError> {
        let root = root.into();
        if let Some(allowed_paths) = &allowed_paths {
            if let Some(invalid) = allowed_paths
                .iter()
                .find(|p| p.is_empty() || p.starts_with('/') || p.ends_with('/'))
            {
                return Err(AccessorError::InvalidAllowedPath(invalid.clone()));
            }
        }
        let real_root = fs::canonicalize(&root).map_err(|e| AccessorError::io(root.display(), e))?;
        Ok(FsInputAccessor {
            number: next_accessor_number(),
            root,
            real_root,
            allowed_paths,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` is covered by the allowed set: it must be a member, an
    /// ancestor of a member or a descendant of one.
    pub fn is_allowed(&self, path: &CanonPath) -> bool {
        let Some(allowed_paths) = &self.allowed_paths else {
            return true;
        };
        let sub_path = path.rel();
        if sub_path.is_empty() {
            return true;
        }

        if allowed_paths.contains(sub_path) {
            return true;
        }

        // Ancestor of a member.
        let prefix = format!("{sub_path}/");
        if allowed_paths
            .range(prefix.clone()..)
            .next()
            .is_some_and(|candidate| candidate.starts_with(&prefix))
        {
            return true;
        }

        // Descendant of a member.
        let mut ancestor = sub_path;
        while let Some(index) = ancestor.rfind('/') {
            ancestor = &ancestor[..index];
            if allowed_paths.contains(ancestor) {
                return true;
            }
        }
        false
    }

    fn check_allowed(&self, path: &CanonPath) -> Result<(), AccessorError> {
        if self.is_allowed(path) {
            Ok(())
        } else {
            Err(AccessorError::NotAllowed {
                path: path.to_string(),
            })
        }
    }

    fn make_abs_path(&self, path: &CanonPath) -> PathBuf {
        if path.is_root() {
            self.root.clone()
        } else {
            self.root.join(path.rel())
        }
    }

    /// Resolves `path` to a location on disk that is guaranteed to lie under
    /// the root. With `follow`, symlinks in the final component are resolved
    /// as well; otherwise only the parent directory is.
    fn resolve(&self, path: &CanonPath, follow: bool) -> Result<PathBuf, AccessorError> {
        self.check_allowed(path)?;
        let abs_path = self.make_abs_path(path);
        trace!("Accessor #{} resolving {}", self.number, abs_path.display());

        let real_path = if follow || path.is_root() {
            fs::canonicalize(&abs_path).map_err(|e| AccessorError::io(path, e))?
        } else {
            let parent = abs_path.parent().unwrap_or(&self.root);
            let real_parent = fs::canonicalize(parent).map_err(|e| AccessorError::io(path, e))?;
            match path.base_name() {
                Some(name) => real_parent.join(name),
                None => real_parent,
            }
        };

        if !real_path.starts_with(&self.real_root) {
            return Err(AccessorError::NotAllowed {
                path: path.to_string(),
            });
        }
        Ok(real_path)
    }
}

impl InputAccessor for FsInputAccessor {
    fn number(&self) -> usize {
        self.number
    }

    fn read_file(&self, path: &CanonPath) -> Result<Vec<u8>, AccessorError> {
        let real_path = self.resolve(path, true)?;
        fs::read(real_path).map_err(|e| AccessorError::io(path, e))
    }

    fn path_exists(&self, path: &CanonPath) -> Result<bool, AccessorError> {
        if !self.is_allowed(path) {
            return Ok(false);
        }
        match self.resolve(path, false) {
            Ok(real_path) => Ok(fs::symlink_metadata(real_path).is_ok()),
            Err(AccessorError::NotFound { .. }) | Err(AccessorError::NotAllowed { .. }) => {
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    fn lstat(&self, path: &CanonPath) -> Result<Stat, AccessorError> {
        let real_path = self.resolve(path, false)?;
        let metadata = fs::symlink_metadata(real_path).map_err(|e| AccessorError::io(path, e))?;
        let file_type = metadata.file_type();
        Ok(if file_type.is_file() {
            Stat::regular(is_executable(&metadata))
        } else if file_type.is_dir() {
            Stat::of(FileType::Directory)
        } else if file_type.is_symlink() {
            Stat::of(FileType::Symlink)
        } else {
            Stat::of(FileType::Other)
        })
    }

    fn read_directory(&self, path: &CanonPath) -> Result<DirEntries, AccessorError> {
        let real_path = self.resolve(path, true)?;
        let mut entries = DirEntries::new();
        for entry in fs::read_dir(real_path).map_err(|e| AccessorError::io(path, e))? {
            let entry = entry.map_err(|e| AccessorError::io(path, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.is_allowed(&path.join(&name)) {
                continue;
            }
            let file_type = entry.file_type().ok().map(|file_type| {
                if file_type.is_file() {
                    FileType::Regular
                } else if file_type.is_dir() {
                    FileType::Directory
                } else if file_type.is_symlink() {
                    FileType::Symlink
                } else {
                    FileType::Other
                }
            });
            entries.insert(name, file_type);
        }
        Ok(entries)
    }

    fn read_link(&self, path: &CanonPath) -> Result<String, AccessorError> {
        let real_path = self.resolve(path, false)?;
        let target = fs::read_link(real_path).map_err(|e| AccessorError::io(path, e))?;
        Ok(target.to_string_lossy().into_owned())
    }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}
