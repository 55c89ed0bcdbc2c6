//! Read-only, capability-restricted access to file trees.
//!
//! An [`InputAccessor`] exposes a tree rooted at an opaque base (a directory,
//! a zip archive, an in-memory file set) through five operations. Paths are
//! always [`CanonPath`]s, so backends never see `.` or `..` components.

pub mod archive;
mod canon_path;
pub mod fs;
pub mod memory;
pub mod patching;
pub mod registry;

use std::{
    collections::BTreeMap,
    fmt::Display,
    io::Write,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

use crate::nar::{self, DumpOptions, NarError};

pub use archive::ZipInputAccessor;
pub use canon_path::CanonPath;
pub use fs::FsInputAccessor;
pub use memory::MemoryInputAccessor;
pub use patching::PatchingInputAccessor;
pub use registry::AccessorRegistry;

#[derive(Error, Debug)]
pub enum AccessorError {
    #[error("Path `{path}` does not exist")]
    NotFound { path: String },
    #[error("Access to path `{path}` is not allowed")]
    NotAllowed { path: String },
    #[error("{operation} is not implemented by the {accessor} accessor")]
    Unsupported {
        operation: &'static str,
        accessor: &'static str,
    },
    #[error("Allowed path `{0}` must be relative and must not end with `/`")]
    InvalidAllowedPath(String),
    #[error("File `{path}` has unsupported type {mode:o}")]
    UnsupportedType { path: String, mode: u32 },
    #[error("Unknown virtual accessor #{0}")]
    UnknownAccessor(usize),
    #[error("Zip error in `{path}`: {source}")]
    Zip {
        path: String,
        source: ::zip::result::ZipError,
    },
    #[error("Patch for `{path}` failed: {message}")]
    Patch { path: String, message: String },
    #[error("IO error on `{path}`: {source}")]
    IO {
        path: String,
        source: std::io::Error,
    },
}

impl AccessorError {
    pub(crate) fn io(path: impl Display, source: std::io::Error) -> AccessorError {
        if source.kind() == std::io::ErrorKind::NotFound {
            AccessorError::NotFound {
                path: path.to_string(),
            }
        } else {
            AccessorError::IO {
                path: path.to_string(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AccessorError::NotFound { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub file_type: FileType,
    /// Only meaningful for regular files.
    pub is_executable: bool,
}

impl Stat {
    pub fn regular(is_executable: bool) -> Stat {
        Stat {
            file_type: FileType::Regular,
            is_executable,
        }
    }

    pub fn of(file_type: FileType) -> Stat {
        Stat {
            file_type,
            is_executable: false,
        }
    }
}

/// Directory listing; the type is `None` when the backend cannot tell it
/// without a separate `lstat`.
pub type DirEntries = BTreeMap<String, Option<FileType>>;

/// Decides, for an accessor path, whether it takes part in a dump.
pub type PathFilter<'a> = dyn Fn(&CanonPath) -> bool + 'a;

pub fn accept_all(_: &CanonPath) -> bool {
    true
}

static NEXT_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Allocates the process-unique number every accessor carries.
pub(crate) fn next_accessor_number() -> usize {
    NEXT_NUMBER.fetch_add(1, Ordering::Relaxed)
}

pub trait InputAccessor: Send + Sync {
    /// Process-unique identifier, used to correlate diagnostics and to pack
    /// source paths into plain strings.
    fn number(&self) -> usize;

    fn read_file(&self, path: &CanonPath) -> Result<Vec<u8>, AccessorError>;

    fn path_exists(&self, path: &CanonPath) -> Result<bool, AccessorError>;

    fn lstat(&self, path: &CanonPath) -> Result<Stat, AccessorError>;

    fn read_directory(&self, path: &CanonPath) -> Result<DirEntries, AccessorError>;

    fn read_link(&self, path: &CanonPath) -> Result<String, AccessorError>;

    /// Writes the canonical archive dump of `path` to `sink`.
    fn dump_path(
        &self,
        path: &CanonPath,
        sink: &mut dyn Write,
        filter: &PathFilter<'_>,
    ) -> Result<(), NarError> {
        nar::dump(self, path, sink, filter, &DumpOptions::default())
    }
}

/// A path inside a particular accessor. It borrows the accessor, so it cannot
/// outlive it.
#[derive(Clone)]
pub struct SourcePath<'a> {
    pub accessor: &'a dyn InputAccessor,
    pub path: CanonPath,
}

impl<'a> SourcePath<'a> {
    pub fn new(accessor: &'a dyn InputAccessor, path: CanonPath) -> SourcePath<'a> {
        SourcePath { accessor, path }
    }

    pub fn root(accessor: &'a dyn InputAccessor) -> SourcePath<'a> {
        SourcePath::new(accessor, CanonPath::root())
    }

    pub fn base_name(&self) -> &str {
        self.path.base_name().unwrap_or("source")
    }

    pub fn join(&self, name: &str) -> SourcePath<'a> {
        SourcePath::new(self.accessor, self.path.join(name))
    }

    pub fn parent(&self) -> Option<SourcePath<'a>> {
        self.path
            .parent()
            .map(|parent| SourcePath::new(self.accessor, parent))
    }

    pub fn read_file(&self) -> Result<Vec<u8>, AccessorError> {
        self.accessor.read_file(&self.path)
    }

    pub fn path_exists(&self) -> Result<bool, AccessorError> {
        self.accessor.path_exists(&self.path)
    }

    pub fn lstat(&self) -> Result<Stat, AccessorError> {
        self.accessor.lstat(&self.path)
    }

    pub fn read_directory(&self) -> Result<DirEntries, AccessorError> {
        self.accessor.read_directory(&self.path)
    }

    pub fn read_link(&self) -> Result<String, AccessorError> {
        self.accessor.read_link(&self.path)
    }

    pub fn dump(&self, sink: &mut dyn Write, filter: &PathFilter<'_>) -> Result<(), NarError> {
        self.accessor.dump_path(&self.path, sink, filter)
    }
}

impl std::fmt::Debug for SourcePath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourcePath(#{}:{})", self.accessor.number(), self.path)
    }
}

impl Display for SourcePath<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
