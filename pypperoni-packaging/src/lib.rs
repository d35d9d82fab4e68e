// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Bytecode-to-C lowering primitives for an ahead-of-time Python
transpiler: module ingestion and reachability reduction, per-opcode
lowering rules, constant-pool serialization, chunked code generation, and
the orchestrator that drives a worker pool over a reduced module graph. */

pub mod bytecode_compiler;
pub mod chunker;
pub mod code_object;
pub mod config;
pub mod constants;
pub mod emission;
pub mod file_sink;
pub mod import_rewrite;
pub mod lowering;
pub mod manifest;
pub mod module_graph;
pub mod module_id;
pub mod module_util;
pub mod opcodes;
pub mod orchestrator;
pub mod python_source;
pub mod testutil;

pub use code_object::CodeObject;
pub use config::TranspileConfig;
pub use module_graph::ModuleGraph;
