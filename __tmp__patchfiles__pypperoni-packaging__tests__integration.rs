// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios exercising the full pipeline: ingestion, graph
//! reduction, lowering, and manifest/CMake generation together.

use pypperoni_packaging::bytecode_compiler::{FixedBytecodeCompiler, PythonBytecodeCompiler};
use pypperoni_packaging::code_object::{CodeFlags, CodeObject};
use pypperoni_packaging::config::{ImportAliasPolicy, TranspileConfig};
use pypperoni_packaging::constants::Constant;
use pypperoni_packaging::module_graph::{ModuleGraph, NullHostResolver};
use pypperoni_packaging::orchestrator::{self, NullProgressReporter};
use std::sync::Mutex;
use tempfile::tempdir;

fn trivial_code() -> CodeObject {
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

fn build_with_compiler(
    dir: &std::path::Path,
    graph: &mut ModuleGraph,
) -> anyhow::Result<Vec<pypperoni_packaging::manifest::ManifestEntry>> {
    let config = TranspileConfig::new("demo", dir.join("out"));
    let compiler: Mutex<dyn PythonBytecodeCompiler + Send> =
        Mutex::new(FixedBytecodeCompiler { code: trivial_code() });
    orchestrator::build(graph, &config, &compiler, &NullHostResolver, &NullProgressReporter)
}

/// S2: `a` is main and imports `b`; `c` imports nothing and is imported by
/// nothing. After reduction, `c` is absent from the manifest.
#[test]
fn s2_unreferenced_module_is_reduced_away() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), b"import b\n").unwrap();
    std::fs::write(dir.path().join("b.py"), b"pass\n").unwrap();
    std::fs::write(dir.path().join("c.py"), b"pass\n").unwrap();

    let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
    graph.add_file(&dir.path().join("a.py"), Some("a".to_string()), true).unwrap();
    graph.add_file(&dir.path().join("b.py"), Some("b".to_string()), false).unwrap();
    graph.add_file(&dir.path().join("c.py"), Some("c".to_string()), false).unwrap();

    let entries = build_with_compiler(dir.path(), &mut graph).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

    assert!(names.contains(&"a"));
    assert!(names.contains(&"b"));
    assert!(!names.contains(&"c"));
}

/// S3: writing the same input graph twice to the same outdir changes zero
/// file contents on the second run.
#[test]
fn s3_identical_rebuild_is_a_no_op() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("m.py"), b"pass\n").unwrap();

    let mut graph1 = ModuleGraph::new(ImportAliasPolicy::default());
    graph1.add_file(&dir.path().join("m.py"), Some("m".to_string()), true).unwrap();
    build_with_compiler(dir.path(), &mut graph1).unwrap();

    let c_file = dir.path().join("out/gen/modules/m_0.c");
    let first_write = std::fs::metadata(&c_file).unwrap().modified().unwrap();

    std::thread::sleep(std::time::Duration::from_millis(10));

    let mut graph2 = ModuleGraph::new(ImportAliasPolicy::default());
    graph2.add_file(&dir.path().join("m.py"), Some("m".to_string()), true).unwrap();
    build_with_compiler(dir.path(), &mut graph2).unwrap();

    let second_write = std::fs::metadata(&c_file).unwrap().modified().unwrap();
    assert_eq!(first_write, second_write, "unchanged input should not rewrite the file");
}

/// Manifest and CMakeLists.txt exist and reference each other after a build.
#[test]
fn build_produces_manifest_and_cmake() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("m.py"), b"pass\n").unwrap();
    let mut graph = ModuleGraph::new(ImportAliasPolicy::default());
    graph.add_file(&dir.path().join("m.py"), Some("m".to_string()), true).unwrap();

    build_with_compiler(dir.path(), &mut graph).unwrap();

    let manifest = std::fs::read_to_string(dir.path().join("out/gen/modules.I")).unwrap();
    assert!(manifest.contains("DEFINED"));

    let cmake = std::fs::read_to_string(dir.path().join("out/CMakeLists.txt")).unwrap();
    assert!(cmake.contains("project(demo C)"));
    assert!(cmake.contains("m_0.c"));
}


