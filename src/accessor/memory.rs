use std::collections::BTreeMap;

use super::{next_accessor_number, AccessorError, CanonPath, DirEntries, InputAccessor, Stat};

/// A flat set of synthetic files. Directory listings and symlinks are not
/// modelled.
pub struct MemoryInputAccessor {
    number: usize,
    files: BTreeMap<CanonPath, Vec<u8>>,
}

impl MemoryInputAccessor {
    pub fn new() -> MemoryInputAccessor {
        MemoryInputAccessor {
            number: next_accessor_number(),
            files: BTreeMap::new(),
        }
    }

    pub fn add_file(&mut self, path: &str, contents: Vec<u8>) -> Result<(), AccessorError> {
        self.files.insert(CanonPath::new(path)?, contents);
        Ok(())
    }
}

impl Default for MemoryInputAccessor {
    fn default() -> Self {
        Self::new()
    }
}

impl InputAccessor for MemoryInputAccessor {
    fn number(&self) -> usize {
        self.number
    }

    fn read_file(&self, path: &CanonPath) -> Result<Vec<u8>, AccessorError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| AccessorError::NotFound {
                path: path.to_string(),
            })
    }

    fn path_exists(&self, path: &CanonPath) -> Result<bool, AccessorError> {
        Ok(self.files.contains_key(path))
    }

    fn lstat(&self, path: &CanonPath) -> Result<Stat, AccessorError> {
        if self.files.contains_key(path) {
            Ok(Stat::regular(false))
        } else {
            Err(AccessorError::NotFound {
                path: path.to_string(),
            })
        }
    }

    fn read_directory(&self, _path: &CanonPath) -> Result<DirEntries, AccessorError> {
        Err(AccessorError::Unsupported {
            operation: "read_directory",
            accessor: "in-memory",
        })
    }

    fn read_link(&self, _path: &CanonPath) -> Result<String, AccessorError> {
        Err(AccessorError::Unsupported {
            operation: "read_link",
            accessor: "in-memory",
        })
    }
}
