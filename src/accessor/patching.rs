use std::{collections::BTreeMap, fs, process::Command, sync::Arc};

use log::debug;

use super::{
    next_accessor_number, AccessorError, CanonPath, DirEntries, InputAccessor, Stat,
};

/// Applies unified diffs to the files of another accessor as they are read.
/// Only modifications are supported; diffs that create or delete files have
/// no effect on listings.
pub struct PatchingInputAccessor {
    number: usize,
    next: Arc<dyn InputAccessor>,
    patches_per_file: BTreeMap<CanonPath, Vec<String>>,
}

impl PatchingInputAccessor {
    pub fn new(next: Arc<dyn InputAccessor>, patches: &[String]) -> PatchingInputAccessor {
        let mut patches_per_file: BTreeMap<CanonPath, Vec<String>> = BTreeMap::new();
        for patch in patches {
            for (path, hunk) in split_patch(patch) {
                debug!("Found patch for {}", path);
                patches_per_file.entry(path).or_default().push(hunk);
            }
        }
        PatchingInputAccessor {
            number: next_accessor_number(),
            next,
            patches_per_file,
        }
    }

    pub fn patched_files(&self) -> impl Iterator<Item = &CanonPath> {
        self.patches_per_file.keys()
    }

    fn apply(
        &self,
        path: &CanonPath,
        contents: Vec<u8>,
        patch: &str,
    ) -> Result<Vec<u8>, AccessorError> {
        let dir = tempfile::tempdir().map_err(|e| AccessorError::io(path, e))?;
        let source_file = dir.path().join("source");
        let patch_file = dir.path().join("source.patch");
        let rej_file = dir.path().join("source.rej");
        fs::write(&source_file, contents).map_err(|e| AccessorError::io(path, e))?;
        fs::write(&patch_file, patch).map_err(|e| AccessorError::io(path, e))?;

        let output = Command::new("patch")
            .arg("--quiet")
            .arg(&source_file)
            .arg("--output=-")
            .arg("-r")
            .arg(&rej_file)
            .arg("-i")
            .arg(&patch_file)
            .output()
            .map_err(|e| AccessorError::Patch {
                path: path.to_string(),
                message: format!("cannot run `patch`: {e}"),
            })?;

        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if let Ok(rejected) = fs::read_to_string(&rej_file) {
                message.push_str("\nrejected hunks:\n");
                message.push_str(&rejected);
            }
            return Err(AccessorError::Patch {
                path: path.to_string(),
                message,
            });
        }
        Ok(output.stdout)
    }
}

impl InputAccessor for PatchingInputAccessor {
    fn number(&self) -> usize {
        self.number
    }

    fn read_file(&self, path: &CanonPath) -> Result<Vec<u8>, AccessorError> {
        let mut contents = self.next.read_file(path)?;
        if let Some(patches) = self.patches_per_file.get(path) {
            for patch in patches {
                contents = self.apply(path, contents, patch)?;
            }
        }
        Ok(contents)
    }

    fn path_exists(&self, path: &CanonPath) -> Result<bool, AccessorError> {
        self.next.path_exists(path)
    }

    fn lstat(&self, path: &CanonPath) -> Result<Stat, AccessorError> {
        self.next.lstat(path)
    }

    fn read_directory(&self, path: &CanonPath) -> Result<DirEntries, AccessorError> {
        self.next.read_directory(path)
    }

    fn read_link(&self, path: &CanonPath) -> Result<String, AccessorError> {
        self.next.read_link(path)
    }
}

/// Splits a multi-file unified diff into one chunk per target file. A chunk
/// starts at its `--- ` header and ends at the first line that is not part
/// of a diff body. The first component of the header path (`a/`) is dropped.
fn split_patch(patch: &str) -> Vec<(CanonPath, String)> {
    let mut chunks = Vec::new();
    let mut current: Option<(usize, &str)> = None;
    let mut offset = 0;

    let mut flush = |current: &mut Option<(usize, &str)>, end: usize| {
        let Some((start, file_name)) = current.take() else {
            return;
        };
        let Some(slash) = file_name.find('/') else {
            return;
        };
        if let Ok(path) = CanonPath::new(&file_name[slash..]) {
            chunks.push((path, patch[start..end].to_owned()));
        }
    };

    for line in patch.split_inclusive('\n') {
        let text = line.trim_end_matches(['\n', '\r']);
        if let Some(header) = text.strip_prefix("--- ") {
            flush(&mut current, offset);
            // Headers may carry a tab-separated timestamp.
            let file_name = header.split('\t').next().unwrap_or(header);
            current = Some((offset, file_name));
        } else if current.is_some()
            && !["+++ ", "@@", "+", "-", " "]
                .iter()
                .any(|prefix| text.starts_with(prefix))
        {
            flush(&mut current, offset);
        }
        offset += line.len();
    }
    flush(&mut current, offset);

    chunks
}
