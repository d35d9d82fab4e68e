// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The tunables and policy surface threaded through a transpile run. */

use std::collections::BTreeMap;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 250_000;
pub const DEFAULT_EXTRA_STACK_SIZE: u32 = 7;
pub const DEFAULT_SPLIT_INTERVAL: usize = 4000;
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Wraps the import alias map behind a typed accessor so call sites never
/// touch the bare `BTreeMap` directly. Mirrors the teacher's convention of
/// wrapping raw config maps in a small policy type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportAliasPolicy {
    aliases: BTreeMap<String, String>,
}

impl ImportAliasPolicy {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        ImportAliasPolicy { aliases }
    }

    /// Resolve `name` through the alias map, if present. This is the single
    /// entry point both graph-edge discovery and per-instruction import
    /// rewriting consult, so the alias map is never read ad hoc elsewhere.
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases
            .get(name)
            .map(|s| s.as_str())
            .unwrap_or(name)
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.aliases.insert(from.into(), to.into());
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// The immutable bundle of tunables and policy for one transpile run.
///
/// Built once (by the CLI from flags and defaults, or directly by a library
/// caller) and passed down by reference; the orchestrator never mutates it.
#[derive(Debug, Clone)]
pub struct TranspileConfig {
    pub project_name: String,
    pub output_dir: std::path::PathBuf,
    pub max_file_size: u64,
    pub extra_stack_size: u32,
    pub split_interval: usize,
    pub worker_count: usize,
    pub aliases: ImportAliasPolicy,
}

impl TranspileConfig {
    pub fn new(project_name: impl Into<String>, output_dir: impl Into<std::path::PathBuf>) -> Self {
        TranspileConfig {
            project_name: project_name.into(),
            output_dir: output_dir.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            extra_stack_size: DEFAULT_EXTRA_STACK_SIZE,
            split_interval: DEFAULT_SPLIT_INTERVAL,
            worker_count: DEFAULT_WORKER_COUNT,
            aliases: ImportAliasPolicy::default(),
        }
    }

    /// Directory under `output_dir` that generated module sources land in.
    pub fn modules_dir(&self) -> std::path::PathBuf {
        self.output_dir.join("gen").join("modules")
    }

    /// Path to the generated manifest file.
    pub fn manifest_path(&self) -> std::path::PathBuf {
        self.output_dir.join("gen").join("modules.I")
    }

    /// Path to the generated CMakeLists.txt.
    pub fn cmake_path(&self) -> std::path::PathBuf {
        self.output_dir.join("CMakeLists.txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TranspileConfig::new("demo", "/tmp/out");
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert!(config.aliases.is_empty());
    }

    #[test]
    fn test_alias_resolve() {
        let mut aliases = ImportAliasPolicy::default();
        aliases.insert("foo", "bar");
        assert_eq!(aliases.resolve("foo"), "bar");
        assert_eq!(aliases.resolve("baz"), "baz");
    }
}
