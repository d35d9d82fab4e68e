// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The top-level manifest file and CMake project generation. */

use crate::module_graph::ModuleKind;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// One manifest row describing a module to the runtime loader.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    pub id: u32,
    pub parent_id: i64,
    pub kind: ModuleKind,
    pub name: String,
    pub entry_symbol: Option<String>,
    pub stacksize: u32,
    pub nlocals: u32,
}

/// Render the manifest (`modules.I`) text for a set of entries, in the
/// order given. Each DEFINED module's row also emits its entry symbol;
/// BUILTIN/EXTERNAL rows omit it.
pub fn render_manifest(entries: &[ManifestEntry]) -> String {
    let mut out = String::new();
    out.push_str("# id\tparent\tkind\tname\tentry\tstacksize\tnlocals\n");
    for e in entries {
        let kind_str = match e.kind {
            ModuleKind::Regular | ModuleKind::Package | ModuleKind::Null => "DEFINED",
            ModuleKind::Builtin => "BUILTIN",
            ModuleKind::External => "EXTERNAL",
        };
        let entry = e.entry_symbol.clone().unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            e.id, e.parent_id, kind_str, e.name, entry, e.stacksize, e.nlocals
        );
    }
    out
}

/// Render the bootstrap function that initializes `encodings`,
/// `codecs_index`, and `_io` (from the host runtime) on startup.
pub fn render_bootstrap(entries: &[ManifestEntry]) -> String {
    let mut out = String::new();
    out.push_str("void __pypperoni_bootstrap(PypperoniFrame *f) {\n");
    out.push_str("    __pypperoni_IMPL_import_host(f, \"_io\");\n");
    for e in entries {
        if e.name == "codecs_index" || e.name.starts_with("encodings") {
            let _ = writeln!(out, "    __pypperoni_IMPL_import(f, {});", e.id);
        }
    }
    out.push_str("}\n");
    out
}

pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut text = render_manifest(entries);
    text.push('\n');
    text.push_str(&render_bootstrap(entries));
    std::fs::write(path, text).with_context(|| format!("writing manifest {}", path.display()))
}

const CMAKE_TEMPLATE: &str = r#"cmake_minimum_required(VERSION 3.10)
project($$project$$ C)

set(PYPPERONI_ROOT "$$pypperoni_root$$")
set(PYTHON_ROOT "$$python_root$$")

add_executable($$project$$
$$files$$
)

target_include_directories($$project$$ PRIVATE "${PYPPERONI_ROOT}/include")
"#;

/// Substitute the generated file list, project name, and root paths into
/// the fixed CMake template.
pub fn render_cmake(project_name: &str, files: &[String], pypperoni_root: &str, python_root: &str) -> String {
    let files_block = files
        .iter()
        .map(|f| format!("    {f}"))
        .collect::<Vec<_>>()
        .join("\n");

    CMAKE_TEMPLATE
        .replace("$$project$$", project_name)
        .replace("$$files$$", &files_block)
        .replace("$$pypperoni_root$$", pypperoni_root)
        .replace("$$python_root$$", python_root)
}

pub fn write_cmake(
    path: &Path,
    project_name: &str,
    files: &[String],
    pypperoni_root: &str,
    python_root: &str,
) -> Result<()> {
    let text = render_cmake(project_name, files, pypperoni_root, python_root);
    std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_renders_defined_and_builtin() {
        let entries = vec![
            ManifestEntry {
                id: 0,
                parent_id: -1,
                kind: ModuleKind::Regular,
                name: "m".to_string(),
                entry_symbol: Some("pypperoni_m_entry".to_string()),
                stacksize: 1,
                nlocals: 0,
            },
            ManifestEntry {
                id: 123,
                parent_id: -1,
                kind: ModuleKind::Builtin,
                name: "os".to_string(),
                entry_symbol: None,
                stacksize: 0,
                nlocals: 0,
            },
        ];
        let text = render_manifest(&entries);
        assert!(text.contains("DEFINED"));
        assert!(text.contains("pypperoni_m_entry"));
        assert!(text.contains("BUILTIN"));
        assert!(text.contains("-"));
    }

    #[test]
    fn test_cmake_substitution() {
        let rendered = render_cmake("demo", &["modules/m_0.c".to_string()], "/opt/pypperoni", "/opt/python");
        assert!(rendered.contains("project(demo C)"));
        assert!(rendered.contains("modules/m_0.c"));
        assert!(rendered.contains("/opt/pypperoni"));
        assert!(!rendered.contains("$$"));
    }
}


