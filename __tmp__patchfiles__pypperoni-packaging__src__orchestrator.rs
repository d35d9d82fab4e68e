// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Drives the reduced module graph through compilation and lowering with a
bounded worker pool, then writes the manifest and CMake project. */

use crate::bytecode_compiler::{CompileMode, PythonBytecodeCompiler};
use crate::chunker::{self, Chunk};
use crate::code_object::{record_code_object_sizes, CodeObject};
use crate::config::TranspileConfig;
use crate::emission::EmissionContext;
use crate::file_sink::{module_file_prefix, modules_dir_for, FileContainer};
use crate::lowering::Lowerer;
use crate::manifest::{self, ManifestEntry};
use crate::module_graph::{HostResolver, Module, ModuleGraph, ModuleKind};
use anyhow::{Context, Result};
use rayon::prelude::*;
use std::sync::Mutex;

/// Progress and warning sink for an orchestrator run. A library caller can
/// implement this to redirect output; the CLI supplies a structured-logger
/// adapter (see the binary crate).
pub trait ProgressReporter: Sync {
    fn module_started(&self, index: usize, total: usize, name: &str);
    fn warn(&self, message: &str);
}

pub struct NullProgressReporter;

impl ProgressReporter for NullProgressReporter {
    fn module_started(&self, _index: usize, _total: usize, _name: &str) {}
    fn warn(&self, _message: &str) {}
}

/// Per-module lowering failure, collected rather than aborting the run
/// immediately so every failing module is reported at once.
#[derive(Debug)]
pub struct ModuleError {
    pub module: String,
    pub error: anyhow::Error,
}

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.module, self.error)
    }
}

/// Aggregate error returned when one or more modules failed to lower.
#[derive(Debug)]
pub struct OrchestratorError {
    pub failures: Vec<ModuleError>,
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} module(s) failed to transpile:", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for OrchestratorError {}

struct LoweredModule {
    entry: ManifestEntry,
    rewritten_files: usize,
}

/// Runs graph reduction, then lowers every surviving module in parallel
/// into its own `FileContainer`, then writes the manifest and CMake
/// project. Returns the manifest entries actually written.
pub fn build(
    graph: &mut ModuleGraph,
    config: &TranspileConfig,
    compiler: &Mutex<dyn PythonBytecodeCompiler + Send>,
    host: &dyn HostResolver,
    reporter: &dyn ProgressReporter,
) -> Result<Vec<ManifestEntry>> {
    graph.reduce(host).context("reducing module graph")?;

    let modules: Vec<Module> = graph.modules().cloned().collect();
    let total = modules.len();
    let modules_dir = modules_dir_for(&config.output_dir);

    let results: Vec<Result<LoweredModule, ModuleError>> = modules
        .par_iter()
        .enumerate()
        .map(|(i, module)| {
            reporter.module_started(i, total, &module.name);
            lower_one_module(module, config, compiler, &modules_dir).map_err(|e| ModuleError {
                module: module.name.clone(),
                error: e,
            })
        })
        .collect();

    let mut entries = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(lowered) => entries.push(lowered.entry),
            Err(err) => failures.push(err),
        }
    }

    if !failures.is_empty() {
        return Err(OrchestratorError { failures }.into());
    }

    entries.sort_by_key(|e| e.id);

    manifest::write_manifest(&config.manifest_path(), &entries).context("writing manifest")?;

    let file_list: Vec<String> = entries
        .iter()
        .filter(|e| matches!(e.kind, ModuleKind::Regular | ModuleKind::Package))
        .map(|e| format!("gen/modules/{}_0.c", module_file_prefix(&e.name)))
        .collect();

    manifest::write_cmake(
        &config.cmake_path(),
        &config.project_name,
        &file_list,
        "${PYPPERONI_ROOT}",
        "${PYTHON_ROOT}",
    )
    .context("writing CMakeLists.txt")?;

    Ok(entries)
}

fn lower_one_module(
    module: &Module,
    config: &TranspileConfig,
    compiler: &Mutex<dyn PythonBytecodeCompiler + Send>,
    modules_dir: &std::path::Path,
) -> Result<LoweredModule> {
    if !matches!(module.kind, ModuleKind::Regular | ModuleKind::Package | ModuleKind::Null) {
        return Ok(LoweredModule {
            entry: ManifestEntry {
                id: module.id(),
                parent_id: -1,
                kind: module.kind,
                name: module.name.clone(),
                entry_symbol: None,
                stacksize: 0,
                nlocals: 0,
            },
            rewritten_files: 0,
        });
    }

    let code = {
        let mut compiler = compiler.lock().expect("bytecode compiler lock poisoned");
        compiler
            .compile(&module.source, &module.name, Default::default(), CompileMode::Exec)
            .with_context(|| format!("compiling {}", module.name))?
    };

    record_code_object_sizes(&code);

    let prefix = module_file_prefix(&module.name);
    let symbol = format!("pypperoni_{prefix}_entry");
    let mut container = FileContainer::new(modules_dir, &prefix, config.max_file_size);
    container.add_header_line(&format!("PyObject* {symbol}(PypperoniFrame *f);"));

    let rendered = lower_code_object(&code, &module.name, &symbol, config)?;
    container.add_definition(&rendered);

    let rewritten_files = container
        .write_all()
        .with_context(|| format!("writing generated files for {}", module.name))?;

    Ok(LoweredModule {
        entry: ManifestEntry {
            id: module.id(),
            parent_id: -1,
            kind: module.kind,
            name: module.name.clone(),
            entry_symbol: Some(symbol),
            stacksize: code.stacksize + config.extra_stack_size,
            nlocals: code.nlocals,
        },
        rewritten_files,
    })
}

/// Lower one code object (chunked or not) into a complete C function
/// definition (or trampoline plus chunk functions) as a single string.
fn lower_code_object(code: &CodeObject, module_path: &str, symbol: &str, config: &TranspileConfig) -> Result<String> {
    let instructions = code.decode_instructions();

    if chunker::suspends(code.flags) || instructions.len() <= config.split_interval {
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::with_aliases(code, module_path, config.aliases.clone());
        lowerer.lower_slice(&mut ctx, &instructions)?;
        return Ok(render_function(symbol, &ctx));
    }

    let chunks: Vec<Chunk> = chunker::chunk_instructions(&instructions, config.split_interval);
    let mut out = String::new();
    let mut chunk_symbols = Vec::with_capacity(chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::with_aliases(code, module_path, config.aliases.clone());
        lowerer.lower_slice(&mut ctx, &instructions[chunk.start_index..chunk.end_index])?;
        let chunk_symbol = format!("{symbol}_chunk{i}");
        out.push_str(&render_function(&chunk_symbol, &ctx));
        out.push('\n');
        chunk_symbols.push(chunk_symbol);
    }

    out.push_str(&render_trampoline(symbol, &chunk_symbols));
    Ok(out)
}

fn render_function(symbol: &str, ctx: &EmissionContext) -> String {
    format!(
        "PyObject* {symbol}(PypperoniFrame *f) {{\n{}\n{}\n{}}}\n",
        ctx.render_declarations(),
        ctx.body(),
        ctx.render_tail()
    )
}

fn render_trampoline(symbol: &str, chunk_symbols: &[String]) -> String {
    let mut out = String::new();
    out.push_str(&format!("PyObject* {symbol}(PypperoniFrame *f) {{\n"));
    out.push_str("    PyObject *retval;\n");
    for chunk_symbol in chunk_symbols {
        out.push_str(&format!("    retval = {chunk_symbol}(f);\n"));
        out.push_str("    if (f->f_why == WHY_EXCEPTION || f->f_why == WHY_RETURN || f->f_why == WHY_YIELD) return retval;\n");
    }
    out.push_str("    return retval;\n");
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode_compiler::FixedBytecodeCompiler;
    use crate::code_object::CodeFlags;
    use crate::config::ImportAliasPolicy;
    use crate::constants::Constant;
    use crate::module_graph::NullHostResolver;
    use tempfile::tempdir;

    fn sample_code() -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            raw_bytecode: vec![100, 0, 83, 0],
            consts: vec![Constant::None],
            names: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            filename: "m.py".to_string(),
            qualname: "<module>".to_string(),
            first_lineno: 1,
            line_table: vec![(0, 1)],
        }
    }

    #[test]
    fn test_build_empty_module_s1() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("m.py");
        std::fs::write(&src_path, b"pass\n").unwrap();

        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.add_file(&src_path, Some("m".to_string()), true).unwrap();

        let config = TranspileConfig::new("demo", dir.path().join("out"));
        let compiler: Mutex<dyn PythonBytecodeCompiler + Send> =
            Mutex::new(FixedBytecodeCompiler { code: sample_code() });

        let entries = build(&mut graph, &config, &compiler, &NullHostResolver, &NullProgressReporter).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, 0);
        assert_eq!(entries[0].name, "m");
        assert_eq!(entries[0].parent_id, -1);
        assert!(entries[0].stacksize >= 1);
        assert_eq!(entries[0].nlocals, 0);
    }

    #[test]
    fn test_build_is_idempotent_s3() {
        let dir = tempdir().unwrap();
        let src_path = dir.path().join("m.py");
        std::fs::write(&src_path, b"pass\n").unwrap();

        let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
        graph.add_file(&src_path, Some("m".to_string()), true).unwrap();
        let config = TranspileConfig::new("demo", dir.path().join("out"));
        let compiler: Mutex<dyn PythonBytecodeCompiler + Send> =
            Mutex::new(FixedBytecodeCompiler { code: sample_code() });
        build(&mut graph, &config, &compiler, &NullHostResolver, &NullProgressReporter).unwrap();

        let mut graph2 = ModuleGraph::new(ImportAliasPolicy::default());
        graph2.add_file(&src_path, Some("m".to_string()), true).unwrap();
        let compiler2: Mutex<dyn PythonBytecodeCompiler + Send> =
            Mutex::new(FixedBytecodeCompiler { code: sample_code() });
        build(&mut graph2, &config, &compiler2, &NullHostResolver, &NullProgressReporter).unwrap();

        let c_file = config.modules_dir().join("m_0.c");
        assert!(c_file.exists());
    }
}


