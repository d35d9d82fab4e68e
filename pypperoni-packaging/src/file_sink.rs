// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Conditional file writing and the multi-part `.c`/`.h` container that
accumulates generated C text for one module. */

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Truncated SHA-256 hash (7 hex chars) used to decide whether a generated
/// file actually changed, enabling a no-op rewrite on unchanged input.
pub fn content_hash(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[0..7].to_string()
}

/// A single file written to disk only when its content hash differs from
/// what's already there.
pub struct ConditionalFile {
    path: PathBuf,
    content: Vec<u8>,
}

impl ConditionalFile {
    pub fn new(path: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        ConditionalFile { path: path.into(), content }
    }

    /// Write the file if its content differs from what's on disk. Returns
    /// whether the file was actually rewritten.
    pub fn write_if_changed(&self) -> Result<bool> {
        let new_hash = content_hash(&self.content);

        if let Ok(existing) = std::fs::read(&self.path) {
            if content_hash(&existing) == new_hash {
                return Ok(false);
            }
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
        std::fs::write(&self.path, &self.content)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(true)
    }
}

/// Accumulates one module's generated C text: a header plus an ordered
/// sequence of numbered `.c` parts, each starting with `#include "<prefix>.h"`,
/// split whenever the current part exceeds `max_file_size` bytes.
pub struct FileContainer {
    prefix: String,
    dir: PathBuf,
    max_file_size: u64,
    header: String,
    parts: Vec<String>,
    current_part: String,
}

impl FileContainer {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_file_size: u64) -> Self {
        let prefix = prefix.into();
        let mut current_part = String::new();
        current_part.push_str(&format!("#include \"{prefix}.h\"\n\n"));
        FileContainer {
            prefix,
            dir: dir.into(),
            max_file_size,
            header: String::new(),
            parts: Vec::new(),
            current_part,
        }
    }

    pub fn add_header_line(&mut self, line: &str) {
        self.header.push_str(line);
        self.header.push('\n');
    }

    /// Append one complete top-level C definition. After appending, splits
    /// to a new part if the current part now exceeds the size threshold —
    /// function boundaries are the only split points.
    pub fn add_definition(&mut self, text: &str) {
        self.current_part.push_str(text);
        if !text.ends_with('\n') {
            self.current_part.push('\n');
        }

        if self.current_part.len() as u64 > self.max_file_size {
            self.roll_part();
        }
    }

    fn roll_part(&mut self) {
        let finished = std::mem::replace(
            &mut self.current_part,
            format!("#include \"{}.h\"\n\n", self.prefix),
        );
        self.parts.push(finished);
    }

    /// Finalize and write every file in this container, returning how many
    /// were actually rewritten (vs. left untouched because unchanged).
    pub fn write_all(mut self) -> Result<usize> {
        if !self.current_part.trim().is_empty()
            && self.current_part != format!("#include \"{}.h\"\n\n", self.prefix)
        {
            let finished = std::mem::take(&mut self.current_part);
            self.parts.push(finished);
        }
        if self.parts.is_empty() {
            self.parts.push(format!("#include \"{}.h\"\n\n", self.prefix));
        }

        let mut rewritten = 0usize;

        let header_path = self.dir.join(format!("{}.h", self.prefix));
        let guard = format!("PYPPERONI_GEN_{}_H", self.prefix.to_uppercase());
        let header_text = format!(
            "#ifndef {guard}\n#define {guard}\n\n{}\n#endif\n",
            self.header
        );
        if ConditionalFile::new(&header_path, header_text.into_bytes()).write_if_changed()? {
            rewritten += 1;
        }

        for (i, part) in self.parts.iter().enumerate() {
            let part_path = self.dir.join(format!("{}_{}.c", self.prefix, i));
            if ConditionalFile::new(&part_path, part.clone().into_bytes()).write_if_changed()? {
                rewritten += 1;
            }
        }

        Ok(rewritten)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len() + 1
    }
}

/// Resolve the on-disk path for one module's generated directory entries.
pub fn module_file_prefix(module_name: &str) -> String {
    module_name.replace('.', "_")
}

pub fn modules_dir_for(output_dir: &Path) -> PathBuf {
    output_dir.join("gen").join("modules")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash(b"hello"), content_hash(b"hello"));
        assert_ne!(content_hash(b"hello"), content_hash(b"world"));
        assert_eq!(content_hash(b"hello").len(), 7);
    }

    #[test]
    fn test_conditional_write_skips_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let file = ConditionalFile::new(&path, b"same content".to_vec());
        assert!(file.write_if_changed().unwrap());

        let file2 = ConditionalFile::new(&path, b"same content".to_vec());
        assert!(!file2.write_if_changed().unwrap());
    }

    #[test]
    fn test_conditional_write_rewrites_on_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.txt");
        ConditionalFile::new(&path, b"version one".to_vec()).write_if_changed().unwrap();
        let changed = ConditionalFile::new(&path, b"version two".to_vec()).write_if_changed().unwrap();
        assert!(changed);
    }

    #[test]
    fn test_container_splits_on_size() {
        let dir = tempdir().unwrap();
        let mut container = FileContainer::new(dir.path(), "m", 20);
        container.add_definition("PyObject* a(void) { return NULL; }");
        container.add_definition("PyObject* b(void) { return NULL; }");
        assert!(container.part_count() >= 2);
    }

    #[test]
    fn test_write_all_creates_header_and_parts() {
        let dir = tempdir().unwrap();
        let mut container = FileContainer::new(dir.path(), "m", 10_000);
        container.add_header_line("PyObject* a(void);");
        container.add_definition("PyObject* a(void) { return NULL; }");
        let rewritten = container.write_all().unwrap();
        assert!(rewritten >= 2);
        assert!(dir.path().join("m.h").exists());
        assert!(dir.path().join("m_0.c").exists());
    }
}
