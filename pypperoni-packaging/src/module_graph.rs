// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Module ingestion, the import-edge scanner, and reachability reduction. */

use crate::config::ImportAliasPolicy;
use crate::module_id::{module_id, MAIN_MODULE_ID};
use crate::module_util::packages_from_module_name;
use crate::python_source::decode_source;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Regular,
    Package,
    Null,
    Builtin,
    External,
}

/// A raw `import`/`from ... import ...` statement extracted by the
/// best-effort static scanner, prior to resolution against the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImport {
    pub level: u32,
    pub module: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub source: Vec<u8>,
    pub kind: ModuleKind,
    pub is_main: bool,
    pub imports: Vec<RawImport>,
}

impl Module {
    pub fn id(&self) -> u32 {
        if self.is_main {
            MAIN_MODULE_ID
        } else {
            module_id(&self.name)
        }
    }

    /// The id of the enclosing package, or `-1` for the main module and for
    /// any other top-level (undotted) module.
    pub fn parent_id(&self) -> i64 {
        if self.is_main {
            return -1;
        }
        match self.name.rsplit_once('.') {
            Some((parent, _)) => module_id(parent) as i64,
            None => -1,
        }
    }
}

/// Resolves a module name (possibly relative) against the current package
/// context and the host interpreter, in a deployment-provided way. Modeled
/// as a trait so tests can stub the host without any real Python present.
pub trait HostResolver {
    /// Returns true if the host interpreter can supply this module natively
    /// (i.e. it should be treated as BUILTIN rather than EXTERNAL).
    fn resolve(&self, name: &str) -> bool;
}

/// A resolver that recognizes nothing; every unresolved import becomes
/// EXTERNAL. Useful as a conservative default and in unit tests.
pub struct NullHostResolver;

impl HostResolver for NullHostResolver {
    fn resolve(&self, _name: &str) -> bool {
        false
    }
}

static RE_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*import[ \t]+([A-Za-z_][A-Za-z0-9_.]*)(?:[ \t]+as[ \t]+[A-Za-z_][A-Za-z0-9_]*)?").unwrap()
});
static RE_FROM_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+(\.*)([A-Za-z_][A-Za-z0-9_.]*)?[ \t]+import[ \t]+(.+)$").unwrap()
});

/// Best-effort static scan for `import`/`from ... import ...` statements.
/// Sufficient to discover graph edges; the authoritative per-instruction
/// rewrite happens later against compiled bytecode (see `import_rewrite`).
pub fn scan_imports(source_text: &str) -> Vec<RawImport> {
    let mut imports = Vec::new();

    for caps in RE_IMPORT.captures_iter(source_text) {
        imports.push(RawImport {
            level: 0,
            module: caps[1].to_string(),
            names: vec![],
        });
    }

    for caps in RE_FROM_IMPORT.captures_iter(source_text) {
        let dots = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let module = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
        let names_raw = &caps[3];
        let names: Vec<String> = names_raw
            .split(',')
            .map(|s| {
                s.trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .trim_matches(|c| c == '(' || c == ')')
                    .to_string()
            })
            .filter(|s| !s.is_empty())
            .collect();

        imports.push(RawImport {
            level: dots.len() as u32,
            module,
            names,
        });
    }

    imports
}

/// Derive a dotted module name from a filesystem path relative to some
/// root: `dir/sub/file.py` -> `dir.sub.file`; `dir/sub/__init__.py` ->
/// `dir.sub` (a package).
pub fn module_name_from_relpath(rel: &Path) -> (String, ModuleKind) {
    let stem_is_init = rel.file_stem().map(|s| s == "__init__").unwrap_or(false);
    let mut components: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let Some(last) = components.last_mut() {
        *last = last.trim_end_matches(".py").to_string();
    }
    if stem_is_init {
        components.pop();
        (components.join("."), ModuleKind::Package)
    } else {
        (components.join("."), ModuleKind::Regular)
    }
}

pub struct ModuleGraph {
    modules: BTreeMap<String, Module>,
    main_name: Option<String>,
    aliases: ImportAliasPolicy,
}

impl ModuleGraph {
    pub fn new(aliases: ImportAliasPolicy) -> Self {
        ModuleGraph {
            modules: BTreeMap::new(),
            main_name: None,
            aliases,
        }
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.modules.values()
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn insert_module(&mut self, name: String, source: Vec<u8>, kind: ModuleKind, is_main: bool) -> Result<()> {
        let text = decode_source(&source).context("decoding module source")?;
        let imports = scan_imports(&text);
        if is_main {
            self.main_name = Some(name.clone());
        }

        // Ensure package-prefix ancestors exist, as null packages if
        // nothing else has declared them yet (module tree invariant).
        for pkg in packages_from_module_name(&name) {
            self.modules.entry(pkg).or_insert_with_key(|n| Module {
                name: n.clone(),
                source: Vec::new(),
                kind: ModuleKind::Null,
                is_main: false,
                imports: vec![],
            });
        }

        self.modules.insert(
            name.clone(),
            Module { name, source, kind, is_main, imports },
        );
        Ok(())
    }

    /// Add a single file. If `name` is omitted, it is derived from `path`.
    pub fn add_file(&mut self, path: &Path, name: Option<String>, is_main: bool) -> Result<()> {
        let source = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let (derived_name, kind) = match &name {
            Some(n) => (n.clone(), ModuleKind::Regular),
            None => module_name_from_relpath(Path::new(path.file_name().unwrap_or_default())),
        };
        self.insert_module(derived_name, source, kind, is_main)
    }

    /// Walk `dir`, adding every top-level `*.py` file as a module keyed by
    /// its basename only (no nesting).
    pub fn add_directory(&mut self, dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "py").unwrap_or(false) {
                let source = std::fs::read(&path)?;
                let (name, kind) = module_name_from_relpath(Path::new(path.file_name().unwrap()));
                self.insert_module(name, source, kind, false)?;
            }
        }
        Ok(())
    }

    /// Walk `root` recursively, preserving the relative dotted path.
    pub fn add_tree(&mut self, root: &Path) -> Result<()> {
        for entry in walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|ext| ext == "py").unwrap_or(false))
        {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let (name, kind) = module_name_from_relpath(rel);
            let source = std::fs::read(entry.path())?;
            self.insert_module(name, source, kind, false)?;
        }
        Ok(())
    }

    /// Synthesize a module named `codecs_index` registering every module
    /// under the `encodings.` prefix via a guarded try/except import, so
    /// the runtime's encoding lookup machinery can find them.
    pub fn generate_codecs_index(&mut self) -> Result<()> {
        let encodings: Vec<&str> = self
            .modules
            .keys()
            .filter(|n| n.starts_with("encodings."))
            .map(|s| s.as_str())
            .collect();

        let mut source = String::new();
        for name in &encodings {
            source.push_str(&format!(
                "try:\n    import {name}\nexcept (ImportError, LookupError):\n    pass\n"
            ));
        }

        self.insert_module(
            "codecs_index".to_string(),
            source.into_bytes(),
            ModuleKind::Regular,
            false,
        )
    }

    /// Resolve a raw import statement to the module name it refers to,
    /// relative to `from_module`'s package context.
    fn resolve_import_target(&self, from_module: &str, imp: &RawImport) -> Result<String> {
        if imp.level == 0 {
            return Ok(self.aliases.resolve(&imp.module).to_string());
        }

        let from = self.modules.get(from_module);
        let is_package = matches!(from.map(|m| m.kind), Some(ModuleKind::Package));
        let mut prefix_parts: Vec<&str> = from_module.split('.').collect();
        if !is_package {
            prefix_parts.pop();
        }
        // One additional level is consumed per extra dot beyond the first.
        for _ in 1..imp.level {
            if prefix_parts.pop().is_none() {
                anyhow::bail!(
                    "relative import level {} in {} exceeds package depth",
                    imp.level,
                    from_module
                );
            }
        }
        let prefix = prefix_parts.join(".");
        let full = if imp.module.is_empty() {
            prefix
        } else if prefix.is_empty() {
            imp.module.clone()
        } else {
            format!("{prefix}.{}", imp.module)
        };
        Ok(self.aliases.resolve(&full).to_string())
    }

    /// Build the directed edge set (`module -> imported module`) by
    /// resolving every extracted import statement, promoting unresolved
    /// targets to BUILTIN or EXTERNAL via `host`.
    pub fn build_edges(&mut self, host: &dyn HostResolver) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut promotions: Vec<(String, ModuleKind)> = Vec::new();

        for module in self.modules.values() {
            let mut targets = BTreeSet::new();
            for imp in &module.imports {
                let target = match self.resolve_import_target(&module.name, imp) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if !self.modules.contains_key(&target) {
                    if host.resolve(&target) {
                        promotions.push((target.clone(), ModuleKind::Builtin));
                    } else {
                        promotions.push((target.clone(), ModuleKind::External));
                    }
                }
                targets.insert(target);

                // `from x import a, b` may also pull in submodules a/b.
                for sub in &imp.names {
                    let candidate = if imp.level == 0 && !imp.module.is_empty() {
                        format!("{}.{}", imp.module, sub)
                    } else {
                        sub.clone()
                    };
                    if self.modules.contains_key(&candidate) {
                        targets.insert(candidate);
                    }
                }
            }
            edges.insert(module.name.clone(), targets);
        }

        for (name, kind) in promotions {
            self.modules.entry(name.clone()).or_insert_with(|| Module {
                name,
                source: Vec::new(),
                kind,
                is_main: false,
                imports: vec![],
            });
        }

        Ok(edges)
    }

    /// Reduce the module set to those reachable from `main` and from
    /// `codecs_index`, via DFS over the edge set. Unmarked modules are
    /// removed entirely.
    pub fn reduce(&mut self, host: &dyn HostResolver) -> Result<()> {
        let edges = self.build_edges(host)?;

        let mut roots: Vec<String> = Vec::new();
        if let Some(main) = &self.main_name {
            roots.push(main.clone());
        }
        if self.modules.contains_key("codecs_index") {
            roots.push("codecs_index".to_string());
        }

        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if !reachable.insert(name.clone()) {
                continue;
            }
            if let Some(targets) = edges.get(&name) {
                for t in targets {
                    if !reachable.contains(t) {
                        queue.push_back(t.clone());
                    }
                }
            }
        }

        self.modules.retain(|name, _| reachable.contains(name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_plain_import() {
        let imports = scan_imports("import os\nimport sys as s\n");
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].module, "os");
        assert_eq!(imports[1].module, "sys");
    }

    #[test]
    fn test_scan_from_import() {
        let imports = scan_imports("from os import path, sep\n");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].module, "os");
        assert_eq!(imports[0].names, vec!["path", "sep"]);
    }

    #[test]
    fn test_scan_relative_import() {
        let imports = scan_imports("from . import other\n");
        assert_eq!(imports[0].level, 1);
        assert_eq!(imports[0].names, vec!["other"]);
    }

    #[test]
    fn test_module_name_from_relpath() {
        let (name, kind) = module_name_from_relpath(Path::new("dir/sub/file.py"));
        assert_eq!(name, "dir.sub.file");
        assert_eq!(kind, ModuleKind::Regular);

        let (name, kind) = module_name_from_relpath(Path::new("dir/sub/__init__.py"));
        assert_eq!(name, "dir.sub");
        assert_eq!(kind, ModuleKind::Package);
    }

    #[test]
    fn test_reduction_drops_unreferenced_module() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("a".to_string(), b"import b\n".to_vec(), ModuleKind::Regular, true).unwrap();
        graph.insert_module("b".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, false).unwrap();
        graph.insert_module("c".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, false).unwrap();

        graph.reduce(&NullHostResolver).unwrap();

        assert!(graph.get("a").is_some());
        assert!(graph.get("b").is_some());
        assert!(graph.get("c").is_none());
    }

    #[test]
    fn test_main_id_is_zero() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("m".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, true).unwrap();
        assert_eq!(graph.get("m").unwrap().id(), MAIN_MODULE_ID);
    }

    #[test]
    fn test_parent_id_derived_from_dotted_name() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("pkg".to_string(), b"pass\n".to_vec(), ModuleKind::Package, false).unwrap();
        graph.insert_module("pkg.sub".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, false).unwrap();

        assert_eq!(graph.get("pkg").unwrap().parent_id(), -1);
        assert_eq!(graph.get("pkg.sub").unwrap().parent_id(), module_id("pkg") as i64);
    }

    #[test]
    fn test_main_module_parent_is_always_negative_one() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("pkg.main".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, true).unwrap();
        assert_eq!(graph.get("pkg.main").unwrap().parent_id(), -1);
    }

    #[test]
    fn test_id_depends_only_on_name() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("pkgmod".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, false).unwrap();
        assert_eq!(graph.get("pkgmod").unwrap().id(), module_id("pkgmod"));
    }

    struct AcceptAll;
    impl HostResolver for AcceptAll {
        fn resolve(&self, _name: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_missing_module_promoted_builtin() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("a".to_string(), b"import missing\n".to_vec(), ModuleKind::Regular, true).unwrap();
        graph.reduce(&AcceptAll).unwrap();
        assert_eq!(graph.get("missing").unwrap().kind, ModuleKind::Builtin);
    }

    #[test]
    fn test_relative_import_from_package() {
        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.insert_module("pkg".to_string(), b"pass\n".to_vec(), ModuleKind::Package, false).unwrap();
        graph.insert_module(
            "pkg.sub".to_string(),
            b"from . import other\n".to_vec(),
            ModuleKind::Regular,
            true,
        ).unwrap();
        graph.insert_module("pkg.other".to_string(), b"pass\n".to_vec(), ModuleKind::Regular, false).unwrap();

        let edges = graph.build_edges(&NullHostResolver).unwrap();
        assert!(edges["pkg.sub"].contains("pkg.other"));
    }
}
