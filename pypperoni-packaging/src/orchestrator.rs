// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Drives the reduced module graph through compilation and lowering with a
bounded worker pool, then writes the manifest and CMake project. */

use crate::bytecode_compiler::{CompileMode, PythonBytecodeCompiler};
use crate::chunker::{self, Chunk};
use crate::code_object::{record_code_object_sizes, CodeObject};
use crate::config::TranspileConfig;
use crate::constants::Constant;
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
                parent_id: module.parent_id(),
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
            parent_id: module.parent_id(),
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
/// definition (or trampoline plus chunk functions) as a single string,
/// preceded by the constant pool blob, loader, and literal definitions the
/// body references (`__pypperoni_consts`/`__pypperoni_literal_N`).
fn lower_code_object(code: &CodeObject, module_path: &str, symbol: &str, config: &TranspileConfig) -> Result<String> {
    let instructions = code.decode_instructions();
    let suspends = chunker::suspends(code.flags);

    if suspends || instructions.len() <= config.split_interval {
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::with_aliases(code, module_path, config.aliases.clone());
        lowerer.lower_slice(&mut ctx, &instructions)?;

        let mut out = render_consts_section(symbol, ctx.consts(), ctx.literals())?;
        out.push_str(&render_function(symbol, &ctx, symbol, !ctx.consts().is_empty(), suspends));
        return Ok(out);
    }

    let chunks: Vec<Chunk> = chunker::chunk_instructions(&instructions, config.split_interval);
    let mut chunk_symbols = Vec::with_capacity(chunks.len());
    let mut contexts = Vec::with_capacity(chunks.len());
    let mut consts_offset = 0usize;
    let mut literals_offset = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let mut ctx = EmissionContext::with_offsets(consts_offset, literals_offset);
        let mut lowerer = Lowerer::with_aliases(code, module_path, config.aliases.clone());
        lowerer.lower_slice(&mut ctx, &instructions[chunk.start_index..chunk.end_index])?;
        consts_offset += ctx.consts().len();
        literals_offset += ctx.literals().len();
        chunk_symbols.push(format!("{symbol}_chunk{i}"));
        contexts.push(ctx);
    }

    let mut all_consts = Vec::new();
    let mut all_literals = Vec::new();
    for ctx in &contexts {
        all_consts.extend(ctx.consts().iter().cloned());
        all_literals.extend(ctx.literals().iter().cloned());
    }
    let has_consts = !all_consts.is_empty();

    let mut out = render_consts_section(symbol, &all_consts, &all_literals)?;
    for (chunk_symbol, ctx) in chunk_symbols.iter().zip(contexts.iter()) {
        out.push_str(&render_function(chunk_symbol, ctx, symbol, has_consts, false));
        out.push('\n');
    }

    out.push_str(&render_trampoline(symbol, &chunk_symbols));
    Ok(out)
}

/// Emit the per-file constant pool: the marshaled byte-array blob, the
/// `__pypperoni_consts` page it deserializes into, the first-use loader
/// function, and one `__pypperoni_literal_N` string definition per
/// registered literal. Chunks of one split code object share this section,
/// keyed by the code object's own (non-chunk) entry symbol.
fn render_consts_section(symbol: &str, consts: &[Constant], literals: &[String]) -> Result<String> {
    let mut out = String::new();
    if consts.is_empty() && literals.is_empty() {
        return Ok(out);
    }

    if !consts.is_empty() {
        let blob = Constant::serialize_tuple(consts)
            .with_context(|| format!("serializing constant pool for {symbol}"))?;
        out.push_str(&format!(
            "static const unsigned char {symbol}_consts_blob[] = {};\n",
            Constant::blob_to_c_array(&blob)
        ));
        out.push_str(&format!("static PyObject* __pypperoni_consts[{}];\n", consts.len()));
        out.push_str(&format!("static int {symbol}_consts_loaded = 0;\n"));
    }

    for (i, literal) in literals.iter().enumerate() {
        out.push_str(&format!(
            "static const char *__pypperoni_literal_{i} = \"{}\";\n",
            Constant::c_escape_str(literal)
        ));
    }

    if !consts.is_empty() {
        out.push_str(&format!("static void {symbol}_load_consts(void) {{\n"));
        out.push_str(&format!("    if ({symbol}_consts_loaded) return;\n"));
        out.push_str(&format!(
            "    __pypperoni_IMPL_unmarshal_consts({symbol}_consts_blob, sizeof({symbol}_consts_blob), __pypperoni_consts, {});\n",
            consts.len()
        ));
        out.push_str(&format!("    {symbol}_consts_loaded = 1;\n"));
        out.push_str("}\n");
    }

    Ok(out)
}

/// Render one emitted function. `file_symbol` names the (possibly
/// different, for a chunk) code object's shared constant-pool loader;
/// `has_consts` gates whether the loader is called at all. `suspends` gates
/// the `switch (f->f_lasti)` resumption dispatch required for generators
/// and coroutines, which are never chunked so this only ever applies to the
/// single-function path.
fn render_function(symbol: &str, ctx: &EmissionContext, file_symbol: &str, has_consts: bool, suspends: bool) -> String {
    let mut prologue = String::new();
    if has_consts {
        prologue.push_str(&format!("    {file_symbol}_load_consts();\n"));
    }
    if suspends {
        prologue.push_str(&render_resume_dispatch(ctx.yield_labels()));
    }
    format!(
        "PyObject* {symbol}(PypperoniFrame *f) {{\n{}\n{}{}\n{}}}\n",
        ctx.render_declarations(),
        prologue,
        ctx.body(),
        ctx.render_tail()
    )
}

/// Emit the prologue dispatch that resumes a suspended generator/coroutine
/// at its last yield point instead of re-entering at the top of the
/// function (SPEC §4.4: generators & coroutines).
fn render_resume_dispatch(yield_labels: &[u32]) -> String {
    if yield_labels.is_empty() {
        return String::new();
    }
    let mut labels: Vec<u32> = yield_labels.to_vec();
    labels.sort_unstable();
    labels.dedup();

    let mut out = String::new();
    out.push_str("    switch (f->f_lasti) {\n");
    for label in labels {
        out.push_str(&format!("        case {label}: goto label_{label};\n"));
    }
    out.push_str("        default: break;\n");
    out.push_str("    }\n");
    out
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
    fn test_lower_code_object_emits_consts_blob_and_loader() {
        // LOAD_CONST 0 ("hello"); RETURN_VALUE — a non-None constant, so the
        // emitted function must reference a real constant pool.
        let code = CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            raw_bytecode: vec![100, 0, 83, 0],
            consts: vec![Constant::Str("hello".to_string())],
            names: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            filename: "m.py".to_string(),
            qualname: "<module>".to_string(),
            first_lineno: 1,
            line_table: vec![(0, 1)],
        };
        let config = TranspileConfig::new("demo", std::path::PathBuf::from("/tmp/out"));
        let rendered = lower_code_object(&code, "m", "pypperoni_m_entry", &config).unwrap();

        assert!(rendered.contains("pypperoni_m_entry_consts_blob[]"));
        assert!(rendered.contains("static PyObject* __pypperoni_consts[1];"));
        assert!(rendered.contains("pypperoni_m_entry_load_consts(void)"));
        assert!(rendered.contains("pypperoni_m_entry_load_consts();"));
        assert!(rendered.contains("__pypperoni_consts[0]"));
    }

    #[test]
    fn test_lower_code_object_emits_resume_dispatch_for_generator() {
        // LOAD_CONST 0; YIELD_VALUE; LOAD_CONST 0; RETURN_VALUE
        let code = CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::GENERATOR,
            raw_bytecode: vec![100, 0, 86, 0, 100, 0, 83, 0],
            consts: vec![Constant::None],
            names: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            filename: "g.py".to_string(),
            qualname: "<genexpr>".to_string(),
            first_lineno: 1,
            line_table: vec![(0, 1)],
        };
        let config = TranspileConfig::new("demo", std::path::PathBuf::from("/tmp/out"));
        let rendered = lower_code_object(&code, "g", "pypperoni_g_entry", &config).unwrap();

        assert!(rendered.contains("switch (f->f_lasti)"));
        assert!(rendered.contains("case 4: goto label_4;"));
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
