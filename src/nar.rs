//! Canonical archive serialisation of accessor trees.
//!
//! The format is deterministic: strings are length-prefixed (little-endian
//! `u64`) and zero-padded to a multiple of eight bytes, directory entries are
//! emitted sorted by name and no timestamps, owners or non-executable
//! permission bits are recorded. Two trees with the same content therefore
//! always produce byte-identical dumps.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{self, Read, Write},
    path::Path,
};

use log::trace;
use thiserror::Error;

use crate::accessor::{AccessorError, CanonPath, FileType, InputAccessor, PathFilter};

pub const NAR_VERSION_MAGIC: &str = "nix-archive-1";

/// Appended (with a counter) to names that would collide on a
/// case-insensitive filesystem.
pub const CASE_HACK_SUFFIX: &str = "~nix~case~hack~";

// Tokens and names are short; anything longer is a corrupt stream.
const MAX_TOKEN_LEN: u64 = 4096;

#[derive(Error, Debug)]
pub enum NarError {
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error("Cannot dump `{path}`: unsupported file type")]
    UnsupportedType { path: String },
    #[error("File name collision on `{name}` in `{path}`")]
    NameCollision { path: String, name: String },
    #[error("Invalid archive: {0}")]
    Invalid(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Undo (when dumping) or apply (when restoring) the case-collision
    /// renaming scheme.
    pub case_hack: bool,
}

/// Serialises the tree at `path`. Directory entries for which `filter`
/// returns false are omitted together with everything below them.
pub fn dump<A: InputAccessor + ?Sized>(
    accessor: &A,
    path: &CanonPath,
    sink: &mut dyn Write,
    filter: &PathFilter<'_>,
    options: &DumpOptions,
) -> Result<(), NarError> {
    write_str(sink, NAR_VERSION_MAGIC.as_bytes())?;
    dump_node(accessor, path, sink, filter, options)
}

fn dump_node<A: InputAccessor + ?Sized>(
    accessor: &A,
    path: &CanonPath,
    sink: &mut dyn Write,
    filter: &PathFilter<'_>,
    options: &DumpOptions,
) -> Result<(), NarError> {
    let stat = accessor.lstat(path)?;
    write_str(sink, b"(")?;

    match stat.file_type {
        FileType::Regular => {
            write_str(sink, b"type")?;
            write_str(sink, b"regular")?;
            if stat.is_executable {
                write_str(sink, b"executable")?;
                write_str(sink, b"")?;
            }
            let contents = accessor.read_file(path)?;
            write_str(sink, b"contents")?;
            write_str(sink, &contents)?;
        }
        FileType::Directory => {
            write_str(sink, b"type")?;
            write_str(sink, b"directory")?;

            // Archive name -> on-disk name, ordered the way entries are written.
            let mut names = BTreeMap::new();
            for name in accessor.read_directory(path)?.into_keys() {
                let archive_name = if options.case_hack {
                    match name.find(CASE_HACK_SUFFIX) {
                        Some(pos) => {
                            trace!("Removing case hack suffix from {}/{}", path, name);
                            name[..pos].to_owned()
                        }
                        None => name.clone(),
                    }
                } else {
                    name.clone()
                };
                if names.contains_key(&archive_name) {
                    return Err(NarError::NameCollision {
                        path: path.to_string(),
                        name: archive_name,
                    });
                }
                names.insert(archive_name, name);
            }

            for (archive_name, name) in names {
                let child = path.join(&name);
                if !filter(&child) {
                    continue;
                }
                write_str(sink, b"entry")?;
                write_str(sink, b"(")?;
                write_str(sink, b"name")?;
                write_str(sink, archive_name.as_bytes())?;
                write_str(sink, b"node")?;
                dump_node(accessor, &child, sink, filter, options)?;
                write_str(sink, b")")?;
            }
        }
        FileType::Symlink => {
            let target = accessor.read_link(path)?;
            write_str(sink, b"type")?;
            write_str(sink, b"symlink")?;
            write_str(sink, b"target")?;
            write_str(sink, target.as_bytes())?;
        }
        FileType::Other => {
            return Err(NarError::UnsupportedType {
                path: path.to_string(),
            })
        }
    }

    write_str(sink, b")")?;
    Ok(())
}

fn write_str(sink: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    sink.write_all(&(bytes.len() as u64).to_le_bytes())?;
    sink.write_all(bytes)?;
    write_padding(sink, bytes.len() as u64)
}

fn write_padding(sink: &mut dyn Write, len: u64) -> io::Result<()> {
    let padding = ((8 - len % 8) % 8) as usize;
    sink.write_all(&[0u8; 8][..padding])
}

/// Rebuilds the tree serialised in `reader` at `dest`, which must not exist
/// yet.
pub fn restore(reader: &mut dyn Read, dest: &Path, options: &DumpOptions) -> Result<(), NarError> {
    let mut parser = Parser { reader, options };
    let magic = parser.read_token()?;
    if magic != NAR_VERSION_MAGIC.as_bytes() {
        return Err(NarError::Invalid("input is not an archive".to_owned()));
    }
    parser.restore_node(dest)
}

struct Parser<'a> {
    reader: &'a mut dyn Read,
    options: &'a DumpOptions,
}

impl Parser<'_> {
    fn read_u64(&mut self) -> Result<u64, NarError> {
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_padding(&mut self, len: u64) -> Result<(), NarError> {
        let padding = ((8 - len % 8) % 8) as usize;
        let mut buf = [0u8; 8];
        self.reader.read_exact(&mut buf[..padding])?;
        if buf.iter().any(|b| *b != 0) {
            return Err(NarError::Invalid("non-zero padding".to_owned()));
        }
        Ok(())
    }

    fn read_token(&mut self) -> Result<Vec<u8>, NarError> {
        let len = self.read_u64()?;
        if len > MAX_TOKEN_LEN {
            return Err(NarError::Invalid(format!("string of {len} bytes is too long")));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf)?;
        self.read_padding(len)?;
        Ok(buf)
    }

    fn read_string(&mut self) -> Result<String, NarError> {
        String::from_utf8(self.read_token()?)
            .map_err(|_| NarError::Invalid("string is not valid UTF-8".to_owned()))
    }

    fn expect(&mut self, expected: &str) -> Result<(), NarError> {
        let token = self.read_token()?;
        if token != expected.as_bytes() {
            return Err(NarError::Invalid(format!(
                "expected `{}`, got `{}`",
                expected,
                String::from_utf8_lossy(&token)
            )));
        }
        Ok(())
    }

    fn restore_node(&mut self, dest: &Path) -> Result<(), NarError> {
        self.expect("(")?;
        self.expect("type")?;
        match self.read_string()?.as_str() {
            "regular" => {
                let mut executable = false;
                let mut token = self.read_string()?;
                if token == "executable" {
                    self.expect("")?;
                    executable = true;
                    token = self.read_string()?;
                }
                if token != "contents" {
                    return Err(NarError::Invalid(format!("unexpected `{token}` in file node")));
                }
                self.restore_contents(dest, executable)?;
                self.expect(")")?;
            }
            "directory" => {
                fs::create_dir(dest)?;
                let mut previous: Option<String> = None;
                // Lower-cased name -> number of case-insensitive duplicates so far.
                let mut folded: HashMap<String, usize> = HashMap::new();
                loop {
                    match self.read_string()?.as_str() {
                        ")" => break,
                        "entry" => {}
                        other => {
                            return Err(NarError::Invalid(format!(
                                "unexpected `{other}` in directory node"
                            )))
                        }
                    }
                    self.expect("(")?;
                    self.expect("name")?;
                    let name = self.read_string()?;
                    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
                        return Err(NarError::Invalid(format!("invalid file name `{name}`")));
                    }
                    if previous.as_ref().is_some_and(|previous| *previous >= name) {
                        return Err(NarError::Invalid(format!(
                            "entry `{name}` is out of order or duplicated"
                        )));
                    }

                    let mut file_name = name.clone();
                    if self.options.case_hack {
                        let count = folded.entry(name.to_lowercase()).or_insert(0);
                        if *count > 0 {
                            file_name = format!("{name}{CASE_HACK_SUFFIX}{count}");
                            trace!("Case collision on {}, restoring as {}", name, file_name);
                        }
                        *count += 1;
                    }

                    self.expect("node")?;
                    self.restore_node(&dest.join(&file_name))?;
                    self.expect(")")?;
                    previous = Some(name);
                }
            }
            "symlink" => {
                self.expect("target")?;
                let target = self.read_string()?;
                make_symlink(&target, dest)?;
                self.expect(")")?;
            }
            other => return Err(NarError::Invalid(format!("unknown node type `{other}`"))),
        }
        Ok(())
    }

    fn restore_contents(&mut self, dest: &Path, executable: bool) -> Result<(), NarError> {
        let size = self.read_u64()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)?;
        let copied = io::copy(&mut (&mut self.reader).take(size), &mut file)?;
        if copied != size {
            return Err(NarError::Invalid(format!(
                "file contents truncated at {copied} of {size} bytes"
            )));
        }
        self.read_padding(size)?;
        set_executable(&file, executable)?;
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(target: &str, dest: &Path) -> Result<(), NarError> {
    std::os::unix::fs::symlink(target, dest)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(_target: &str, dest: &Path) -> Result<(), NarError> {
    Err(NarError::UnsupportedType {
        path: dest.display().to_string(),
    })
}

#[cfg(unix)]
fn set_executable(file: &File, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o555 } else { 0o444 };
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_file: &File, _executable: bool) -> io::Result<()> {
    Ok(())
}
