//! Content-addressed destination of fetched trees.

use std::{
    fmt::Display,
    fs,
    io::{self, BufReader, Seek, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::{
    accessor::{accept_all, AccessorError, FileType, FsInputAccessor, PathFilter, SourcePath},
    nar::{self, DumpOptions, NarError},
};

const HASH_PART_LEN: usize = 32;
const MAX_NAME_LEN: usize = 211;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid store path name `{0}`")]
    InvalidName(String),
    #[error("Invalid store path `{0}`")]
    InvalidPath(String),
    #[error("Invalid hash `{0}`")]
    InvalidHash(String),
    #[error("Flat ingestion requires a regular file, `{0}` is not one")]
    NotARegularFile(String),
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Nar(#[from] NarError),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIngestionMethod {
    /// A single regular file, hashed by its contents.
    Flat,
    /// A whole tree, hashed by its archive dump.
    Recursive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(StoreError::InvalidHash(other.to_owned())),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn finish(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(hasher) => hasher.finalize().to_vec(),
            Hasher::Sha512(hasher) => hasher.finalize().to_vec(),
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Hasher::Sha256(hasher) => hasher.update(buf),
            Hasher::Sha512(hasher) => hasher.update(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Feeds everything written to both a hasher and an inner writer.
struct HashingWriter<W> {
    hasher: Hasher,
    inner: W,
    size: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.write_all(&buf[..written])?;
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A digest together with its algorithm, rendered as `<algorithm>:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHash {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), hex::encode(&self.digest))
    }
}

impl FromStr for ContentHash {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s
            .split_once(':')
            .ok_or_else(|| StoreError::InvalidHash(s.to_owned()))?;
        let algorithm = algorithm.parse()?;
        let digest = hex::decode(digest).map_err(|_| StoreError::InvalidHash(s.to_owned()))?;
        let expected_len = match algorithm {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        };
        if digest.len() != expected_len {
            return Err(StoreError::InvalidHash(s.to_owned()));
        }
        Ok(ContentHash { algorithm, digest })
    }
}

/// Hashes the archive dump of `source`, restricted by `filter`.
pub fn hash_path(
    source: &SourcePath<'_>,
    algorithm: HashAlgorithm,
    filter: &PathFilter<'_>,
) -> Result<ContentHash, StoreError> {
    let mut hasher = algorithm.hasher();
    nar::dump(
        source.accessor,
        &source.path,
        &mut hasher,
        filter,
        &DumpOptions::default(),
    )?;
    Ok(ContentHash {
        algorithm,
        digest: hasher.finish(),
    })
}

/// Name of an entry in the store: `<32 hex digits>-<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath {
    hash_part: String,
    name: String,
}

impl StorePath {
    pub fn hash_part(&self) -> &str {
        &self.hash_part
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for StorePath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidPath(s.to_owned());
        let (hash_part, name) = s.split_once('-').ok_or_else(invalid)?;
        if hash_part.len() != HASH_PART_LEN
            || !hash_part
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }
        check_name(name)?;
        Ok(StorePath {
            hash_part: hash_part.to_owned(),
            name: name.to_owned(),
        })
    }
}

impl TryFrom<String> for StorePath {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StorePath> for String {
    fn from(value: StorePath) -> Self {
        value.to_string()
    }
}

impl Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.hash_part, self.name)
    }
}

fn check_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+-._?=".contains(c));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_owned()))
    }
}

pub trait Store: Send + Sync {
    /// Copies the tree (or, with [`FileIngestionMethod::Flat`], the single
    /// file) at `source` into the store and returns its path.
    fn add_to_store(
        &self,
        name: &str,
        source: &SourcePath<'_>,
        method: FileIngestionMethod,
        algorithm: HashAlgorithm,
        filter: &PathFilter<'_>,
    ) -> Result<StorePath, StoreError>;

    fn is_valid_path(&self, path: &StorePath) -> bool;

    /// Location of `path` on the local filesystem.
    fn real_path(&self, path: &StorePath) -> PathBuf;

    fn query_nar_hash(&self, path: &StorePath) -> Result<ContentHash, StoreError> {
        let accessor = FsInputAccessor::new(self.real_path(path), None)?;
        hash_path(&SourcePath::root(&accessor), HashAlgorithm::Sha256, &accept_all)
    }
}

/// A store kept in a plain directory. Entries are made read-only once
/// written and are never modified afterwards.
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<LocalStore, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(LocalStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn make_store_path(
        &self,
        kind: &str,
        hash: &ContentHash,
        name: &str,
    ) -> StorePath {
        let fingerprint = format!("{kind}:{hash}:{}:{name}", self.dir.display());
        let digest = Sha256::digest(fingerprint.as_bytes());
        StorePath {
            hash_part: hex::encode(&digest[..HASH_PART_LEN / 2]),
            name: name.to_owned(),
        }
    }

    fn add_recursive(
        &self,
        name: &str,
        source: &SourcePath<'_>,
        algorithm: HashAlgorithm,
        filter: &PathFilter<'_>,
    ) -> Result<StorePath, StoreError> {
        // The dump is spooled to disk so that the tree is read only once.
        let spool = tempfile::tempfile_in(&self.dir)?;
        let mut writer = HashingWriter {
            hasher: algorithm.hasher(),
            inner: io::BufWriter::new(spool),
            size: 0,
        };
        nar::dump(
            source.accessor,
            &source.path,
            &mut writer,
            filter,
            &DumpOptions::default(),
        )?;
        writer.flush()?;
        let nar_size = writer.size;
        let hash = ContentHash {
            algorithm,
            digest: writer.hasher.finish(),
        };
        let store_path = self.make_store_path("source", &hash, name);
        debug!("{} has NAR hash {} ({} bytes)", source, hash, nar_size);

        if self.is_valid_path(&store_path) {
            return Ok(store_path);
        }

        let mut spool = writer.inner.into_inner().map_err(|e| e.into_error())?;
        spool.rewind()?;
        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.dir)?;
        let staged = staging.path().join(name);
        nar::restore(
            &mut BufReader::new(spool),
            &staged,
            &DumpOptions::default(),
        )?;
        self.commit(&staged, &store_path)?;
        Ok(store_path)
    }

    fn add_flat(
        &self,
        name: &str,
        source: &SourcePath<'_>,
        algorithm: HashAlgorithm,
    ) -> Result<StorePath, StoreError> {
        let stat = source.lstat()?;
        if stat.file_type != FileType::Regular {
            return Err(StoreError::NotARegularFile(source.to_string()));
        }
        let contents = source.read_file()?;
        let mut hasher = algorithm.hasher();
        hasher.write_all(&contents)?;
        let hash = ContentHash {
            algorithm,
            digest: hasher.finish(),
        };
        let store_path = self.make_store_path("flat", &hash, name);
        if self.is_valid_path(&store_path) {
            return Ok(store_path);
        }

        let mut staged = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&self.dir)?;
        staged.write_all(&contents)?;
        set_read_only(staged.path(), stat.is_executable)?;
        let dest = self.real_path(&store_path);
        match staged.persist(&dest) {
            Ok(_) => info!("Added {} to the store", dest.display()),
            Err(_) if self.is_valid_path(&store_path) => {}
            Err(error) => return Err(error.error.into()),
        }
        Ok(store_path)
    }

    fn commit(&self, staged: &Path, store_path: &StorePath) -> Result<(), StoreError> {
        let dest = self.real_path(store_path);
        match fs::rename(staged, &dest) {
            Ok(()) => {
                info!("Added {} to the store", dest.display());
                Ok(())
            }
            // Another process added the same content first.
            Err(_) if self.is_valid_path(store_path) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

impl Store for LocalStore {
    fn add_to_store(
        &self,
        name: &str,
        source: &SourcePath<'_>,
        method: FileIngestionMethod,
        algorithm: HashAlgorithm,
        filter: &PathFilter<'_>,
    ) -> Result<StorePath, StoreError> {
        check_name(name)?;
        match method {
            FileIngestionMethod::Recursive => self.add_recursive(name, source, algorithm, filter),
            FileIngestionMethod::Flat => self.add_flat(name, source, algorithm),
        }
    }

    fn is_valid_path(&self, path: &StorePath) -> bool {
        fs::symlink_metadata(self.real_path(path)).is_ok()
    }

    fn real_path(&self, path: &StorePath) -> PathBuf {
        self.dir.join(path.to_string())
    }
}

#[cfg(unix)]
fn set_read_only(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o555 } else { 0o444 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path, _executable: bool) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

#[cfg(test)]
mod tests {
    use crate::accessor::{CanonPath, MemoryInputAccessor};

    use super::*;

    use pretty_assertions::assert_eq;

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        fs::write(dir.path().join("target.log"), "noise").unwrap();
        dir
    }

    #[test]
    fn store_paths_parse_and_render() {
        let path: StorePath = "0123456789abcdef0123456789abcdef-source".parse().unwrap();
        assert_eq!(path.hash_part(), "0123456789abcdef0123456789abcdef");
        assert_eq!(path.name(), "source");
        assert_eq!(path.to_string(), "0123456789abcdef0123456789abcdef-source");

        for invalid in [
            "source",
            "0123-source",
            "0123456789ABCDEF0123456789ABCDEF-source",
            "0123456789abcdef0123456789abcdef-.hidden",
            "0123456789abcdef0123456789abcdef-a/b",
        ] {
            assert!(invalid.parse::<StorePath>().is_err(), "{invalid}");
        }
    }

    #[test]
    fn content_hashes_round_trip_through_strings() {
        let hash: ContentHash = format!("sha256:{}", "ab".repeat(32)).parse().unwrap();
        assert_eq!(hash.algorithm, HashAlgorithm::Sha256);
        assert_eq!(hash.to_string(), format!("sha256:{}", "ab".repeat(32)));
        assert!("sha256:abcd".parse::<ContentHash>().is_err());
        assert!("md5:abcd".parse::<ContentHash>().is_err());
    }

    #[test]
    fn recursive_ingestion_is_content_addressed() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(store_dir.path()).unwrap();
        let tree = source_tree();
        let accessor = FsInputAccessor::new(tree.path(), None).unwrap();
        let filter = |path: &CanonPath| path.as_str() != "/target.log";

        let first = store
            .add_to_store(
                "source",
                &SourcePath::root(&accessor),
                FileIngestionMethod::Recursive,
                HashAlgorithm::Sha256,
                &filter,
            )
            .unwrap();
        assert!(store.is_valid_path(&first));
        let real = store.real_path(&first);
        assert_eq!(
            fs::read_to_string(real.join("src/lib.rs")).unwrap(),
            "pub fn f() {}\n"
        );
        assert!(!real.join("target.log").exists());

        let second = store
            .add_to_store(
                "source",
                &SourcePath::root(&accessor),
                FileIngestionMethod::Recursive,
                HashAlgorithm::Sha256,
                &filter,
            )
            .unwrap();
        assert_eq!(first, second);

        let unfiltered = store
            .add_to_store(
                "source",
                &SourcePath::root(&accessor),
                FileIngestionMethod::Recursive,
                HashAlgorithm::Sha256,
                &accept_all,
            )
            .unwrap();
        assert_ne!(first, unfiltered);

        let filtered_hash =
            hash_path(&SourcePath::root(&accessor), HashAlgorithm::Sha256, &filter).unwrap();
        assert_eq!(store.query_nar_hash(&first).unwrap(), filtered_hash);
    }

    #[test]
    fn flat_ingestion_copies_a_single_file() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(store_dir.path()).unwrap();
        let mut accessor = MemoryInputAccessor::new();
        accessor.add_file("/patch.diff", b"--- a/x\n".to_vec()).unwrap();

        let path = store
            .add_to_store(
                "patch.diff",
                &SourcePath::new(&accessor, CanonPath::new("/patch.diff").unwrap()),
                FileIngestionMethod::Flat,
                HashAlgorithm::Sha512,
                &accept_all,
            )
            .unwrap();
        assert_eq!(path.name(), "patch.diff");
        assert_eq!(fs::read(store.real_path(&path)).unwrap(), b"--- a/x\n");
    }

    #[test]
    fn rejects_invalid_names() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(store_dir.path()).unwrap();
        let tree = source_tree();
        let accessor = FsInputAccessor::new(tree.path(), None).unwrap();

        assert!(matches!(
            store.add_to_store(
                "bad name",
                &SourcePath::root(&accessor),
                FileIngestionMethod::Recursive,
                HashAlgorithm::Sha256,
                &accept_all,
            ),
            Err(StoreError::InvalidName(_))
        ));
    }
}
