use std::sync::Arc;

use dashmap::DashMap;
use log::trace;

use super::{AccessorError, CanonPath, FsInputAccessor, InputAccessor};

const VIRTUAL_MARKER: &str = "/__virtual/";

/// Keeps accessors alive by number so that source paths can travel through
/// plain strings (`/__virtual/<number>/<path>`) and be turned back into
/// accessor paths later.
pub struct AccessorRegistry {
    accessors: DashMap<usize, Arc<dyn InputAccessor>>,
    root_fs: Arc<dyn InputAccessor>,
}

impl AccessorRegistry {
    pub fn new() -> Result<AccessorRegistry, AccessorError> {
        let root_fs: Arc<dyn InputAccessor> = Arc::new(FsInputAccessor::new("/", None)?);
        Ok(AccessorRegistry {
            accessors: DashMap::new(),
            root_fs,
        })
    }

    pub fn pack(&self, accessor: &Arc<dyn InputAccessor>, path: &CanonPath) -> String {
        let number = accessor.number();
        self.accessors
            .entry(number)
            .or_insert_with(|| accessor.clone());
        let packed = format!("{VIRTUAL_MARKER}{number}{path}");
        trace!("Packed {} as {}", path, packed);
        packed
    }

    /// Reverses [`AccessorRegistry::pack`]. Absolute paths without the
    /// virtual marker refer to the host filesystem.
    pub fn unpack(
        &self,
        packed: &str,
    ) -> Result<(Arc<dyn InputAccessor>, CanonPath), AccessorError> {
        let Some(rest) = packed.strip_prefix(VIRTUAL_MARKER) else {
            if !packed.starts_with('/') {
                return Err(AccessorError::NotAllowed {
                    path: packed.to_owned(),
                });
            }
            return Ok((self.root_fs.clone(), CanonPath::new(packed)?));
        };

        let (number, path) = match rest.find('/') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        };
        let number: usize = number.parse().map_err(|_| AccessorError::NotFound {
            path: packed.to_owned(),
        })?;
        let accessor = self
            .accessors
            .get(&number)
            .map(|entry| entry.value().clone())
            .ok_or(AccessorError::UnknownAccessor(number))?;
        Ok((accessor, CanonPath::new(path)?))
    }

    pub fn root_fs(&self) -> &Arc<dyn InputAccessor> {
        &self.root_fs
    }
}
