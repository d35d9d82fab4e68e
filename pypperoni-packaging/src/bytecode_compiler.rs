// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The boundary to the Python compiler collaborator: source text in, a
compiled `CodeObject` out. A real deployment shells out to a host `python`
interpreter the way the teacher's bytecode compiler collaborator does; this
crate only models the boundary as a trait plus a fake double for tests. */

use crate::code_object::CodeObject;
use anyhow::{bail, Result};

/// Mirrors CPython's compile-mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileMode {
    Exec,
    Eval,
    Single,
}

/// Mirrors CPython's `-O`/`-OO` optimization levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytecodeOptimizationLevel {
    Zero,
    One,
    Two,
}

impl Default for BytecodeOptimizationLevel {
    fn default() -> Self {
        BytecodeOptimizationLevel::Zero
    }
}

impl TryFrom<i64> for BytecodeOptimizationLevel {
    type Error = anyhow::Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(BytecodeOptimizationLevel::Zero),
            1 => Ok(BytecodeOptimizationLevel::One),
            2 => Ok(BytecodeOptimizationLevel::Two),
            _ => bail!("invalid bytecode optimization level {value}"),
        }
    }
}

impl From<BytecodeOptimizationLevel> for i64 {
    fn from(value: BytecodeOptimizationLevel) -> i64 {
        match value {
            BytecodeOptimizationLevel::Zero => 0,
            BytecodeOptimizationLevel::One => 1,
            BytecodeOptimizationLevel::Two => 2,
        }
    }
}

/// Compiles Python source text into a `CodeObject`. Implementations may
/// shell out to a host interpreter, read an already-compiled `.pyc`, or (in
/// tests) fabricate a fixed result.
pub trait PythonBytecodeCompiler {
    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: BytecodeOptimizationLevel,
        mode: CompileMode,
    ) -> Result<CodeObject>;
}

/// A compiler that always fails. Used as the default when no real Python
/// compiler collaborator has been wired in; forces callers to plug in a
/// real implementation (a subprocess-backed one, in a full deployment) or a
/// test double explicitly rather than silently no-opping.
pub struct UnavailableCompiler;

impl PythonBytecodeCompiler for UnavailableCompiler {
    fn compile(
        &mut self,
        _source: &[u8],
        filename: &str,
        _optimize: BytecodeOptimizationLevel,
        _mode: CompileMode,
    ) -> Result<CodeObject> {
        bail!(
            "no Python compiler backend configured; cannot compile {filename} \
             (a real deployment shells out to a host python interpreter)"
        )
    }
}

/// A double that returns a fixed, pre-built code object regardless of the
/// source passed in, irrespective of `optimize`/`mode`. Used by unit tests
/// that need a `PythonBytecodeCompiler` without a real Python toolchain.
pub struct FixedBytecodeCompiler {
    pub code: CodeObject,
}

impl PythonBytecodeCompiler for FixedBytecodeCompiler {
    fn compile(
        &mut self,
        _source: &[u8],
        _filename: &str,
        _optimize: BytecodeOptimizationLevel,
        _mode: CompileMode,
    ) -> Result<CodeObject> {
        Ok(self.code.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_object::CodeFlags;
    use crate::constants::Constant;

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
    fn test_unavailable_compiler_errors() {
        let mut compiler = UnavailableCompiler;
        let err = compiler
            .compile(b"pass", "m.py", BytecodeOptimizationLevel::Zero, CompileMode::Exec)
            .unwrap_err();
        assert!(err.to_string().contains("no Python compiler"));
    }

    #[test]
    fn test_fixed_compiler_returns_fixture() {
        let mut compiler = FixedBytecodeCompiler { code: sample_code() };
        let code = compiler
            .compile(b"whatever", "m.py", BytecodeOptimizationLevel::Two, CompileMode::Exec)
            .unwrap();
        assert_eq!(code.filename, "m.py");
    }

    #[test]
    fn test_optimization_level_roundtrip() {
        for lvl in [
            BytecodeOptimizationLevel::Zero,
            BytecodeOptimizationLevel::One,
            BytecodeOptimizationLevel::Two,
        ] {
            let n: i64 = lvl.into();
            assert_eq!(BytecodeOptimizationLevel::try_from(n).unwrap(), lvl);
        }
    }
}
