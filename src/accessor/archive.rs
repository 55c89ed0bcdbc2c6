use std::{
    collections::BTreeMap,
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::debug;
use zip::ZipArchive;

use super::{
    next_accessor_number, AccessorError, CanonPath, DirEntries, FileType, InputAccessor, Stat,
};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy)]
struct Member {
    index: usize,
    /// As recorded in the central directory; not trusted when reading.
    size: u64,
    /// `None` for members whose archiver recorded no file attributes.
    unix_mode: Option<u32>,
}

/// Exposes the contents of a zip archive whose members share a single
/// top-level directory (as produced by forge tarball endpoints); that first
/// component is stripped from every path.
pub struct ZipInputAccessor {
    number: usize,
    zip_path: PathBuf,
    archive: Mutex<ZipArchive<File>>,
    // Lookups in the central directory are linear, so every member is indexed
    // once up front. Directory members keep their trailing `/`.
    members: BTreeMap<String, Member>,
}

impl ZipInputAccessor {
    pub fn open(zip_path: impl AsRef<Path>) -> Result<ZipInputAccessor, AccessorError> {
        let zip_path = zip_path.as_ref().to_path_buf();
        let file = File::open(&zip_path).map_err(|e| AccessorError::io(zip_path.display(), e))?;
        let mut archive = ZipArchive::new(file).map_err(|e| zip_error(&zip_path, e))?;

        let mut members = BTreeMap::new();
        for index in 0..archive.len() {
            let member = archive
                .by_index_raw(index)
                .map_err(|e| zip_error(&zip_path, e))?;
            let name = member.name();
            let Some(slash) = name.find('/') else {
                continue;
            };
            members.insert(
                name[slash..].to_owned(),
                Member {
                    index,
                    size: member.size(),
                    unix_mode: member.unix_mode(),
                },
            );
        }
        debug!(
            "Indexed {} members of {}",
            members.len(),
            zip_path.display()
        );

        Ok(ZipInputAccessor {
            number: next_accessor_number(),
            zip_path,
            archive: Mutex::new(archive),
            members,
        })
    }

    fn find(&self, path: &CanonPath) -> Result<(&str, Member), AccessorError> {
        let file_key = path.as_str();
        let dir_key = directory_key(path);
        self.members
            .get_key_value(file_key)
            .or_else(|| self.members.get_key_value(dir_key.as_str()))
            .map(|(key, member)| (key.as_str(), *member))
            .ok_or_else(|| AccessorError::NotFound {
                path: path.to_string(),
            })
    }

    /// Types a member by its Unix mode. Without one, the key decides: a
    /// trailing `/` makes a directory, anything else is a non-executable
    /// regular file.
    fn stat_member(
        &self,
        path: &CanonPath,
        key: &str,
        member: &Member,
    ) -> Result<Stat, AccessorError> {
        let Some(mode) = member.unix_mode else {
            return Ok(if key.ends_with('/') {
                Stat::of(FileType::Directory)
            } else {
                Stat::regular(false)
            });
        };
        match mode & S_IFMT {
            S_IFDIR => Ok(Stat::of(FileType::Directory)),
            S_IFREG => Ok(Stat::regular(mode & 0o100 != 0)),
            S_IFLNK => Ok(Stat::of(FileType::Symlink)),
            _ => Err(AccessorError::UnsupportedType {
                path: path.to_string(),
                mode,
            }),
        }
    }

    fn read_member(&self, path: &CanonPath, member: &Member) -> Result<Vec<u8>, AccessorError> {
        let mut archive = self
            .archive
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut file = archive
            .by_index(member.index)
            .map_err(|e| zip_error(&self.zip_path, e))?;
        // One extra byte tells an oversized member from an exact one.
        let mut contents = Vec::new();
        (&mut file)
            .take(member.size.saturating_add(1))
            .read_to_end(&mut contents)
            .map_err(|e| AccessorError::io(path, e))?;
        if contents.len() as u64 != member.size {
            return Err(AccessorError::IO {
                path: path.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "member is {} bytes, but {} records {}",
                        contents.len(),
                        self.zip_path.display(),
                        member.size
                    ),
                ),
            });
        }
        Ok(contents)
    }
}

impl InputAccessor for ZipInputAccessor {
    fn number(&self) -> usize {
        self.number
    }

    fn read_file(&self, path: &CanonPath) -> Result<Vec<u8>, AccessorError> {
        let member = self
            .members
            .get(path.as_str())
            .ok_or_else(|| AccessorError::NotFound {
                path: path.to_string(),
            })?;
        self.read_member(path, member)
    }

    fn path_exists(&self, path: &CanonPath) -> Result<bool, AccessorError> {
        Ok(self.find(path).is_ok())
    }

    fn lstat(&self, path: &CanonPath) -> Result<Stat, AccessorError> {
        let (key, member) = self.find(path)?;
        self.stat_member(path, key, &member)
    }

    fn read_directory(&self, path: &CanonPath) -> Result<DirEntries, AccessorError> {
        let prefix = directory_key(path);
        let mut members = self
            .members
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .peekable();
        if members.peek().is_none() {
            return Err(AccessorError::NotFound {
                path: path.to_string(),
            });
        }

        let mut entries = DirEntries::new();
        for (key, member) in members {
            let rest = &key[prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            match rest.split_once('/') {
                // Either a directory member (`name/`) or something below one
                // whose directory has no member of its own.
                Some((name, _)) => {
                    entries.insert(name.to_owned(), Some(FileType::Directory));
                }
                None => {
                    let file_type = self
                        .stat_member(&path.join(rest), key, member)
                        .ok()
                        .map(|stat| stat.file_type);
                    entries.insert(rest.to_owned(), file_type);
                }
            }
        }
        Ok(entries)
    }

    fn read_link(&self, path: &CanonPath) -> Result<String, AccessorError> {
        let (key, member) = self.find(path)?;
        if self.stat_member(path, key, &member)?.file_type != FileType::Symlink {
            return Err(AccessorError::UnsupportedType {
                path: path.to_string(),
                mode: member.unix_mode.unwrap_or_default(),
            });
        }
        let target = self.read_member(path, &member)?;
        Ok(String::from_utf8_lossy(&target).into_owned())
    }
}

fn directory_key(path: &CanonPath) -> String {
    if path.is_root() {
        "/".to_owned()
    } else {
        format!("{path}/")
    }
}

fn zip_error(zip_path: &Path, source: zip::result::ZipError) -> AccessorError {
    AccessorError::Zip {
        path: zip_path.display().to_string(),
        source,
    }
}
