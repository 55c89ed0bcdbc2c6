use std::fmt::Display;

use super::AccessorError;

/// An absolute, lexically canonical path inside an accessor: it always starts
/// with `/`, never ends with `/` (except for the root) and contains no empty,
/// `.` or `..` components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonPath(String);

impl CanonPath {
    pub fn root() -> CanonPath {
        CanonPath("/".to_owned())
    }

    /// Canonicalizes `path`, interpreting it relative to the root. `..`
    /// components that would climb above the root are a confinement error.
    pub fn new(path: &str) -> Result<CanonPath, AccessorError> {
        let mut components: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(AccessorError::NotAllowed {
                            path: path.to_owned(),
                        });
                    }
                }
                other => components.push(other),
            }
        }
        Ok(CanonPath(format!("/{}", components.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path without its leading `/`; empty for the root.
    pub fn rel(&self) -> &str {
        &self.0[1..]
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn base_name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    pub fn parent(&self) -> Option<CanonPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(CanonPath::root()),
            Some(index) => Some(CanonPath(self.0[..index].to_owned())),
        }
    }

    /// Appends a single directory entry name.
    pub fn join(&self, name: &str) -> CanonPath {
        debug_assert!(!name.is_empty() && !name.contains('/'));
        if self.is_root() {
            CanonPath(format!("/{name}"))
        } else {
            CanonPath(format!("{}/{name}", self.0))
        }
    }

    /// Whether `self` equals `other` or lies below it.
    pub fn is_within(&self, other: &CanonPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes()[other.0.len()] == b'/')
    }
}

impl Display for CanonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
