// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Compiled code objects and bytecode instruction decoding. */

use crate::{constants::Constant, opcodes};
use once_cell::sync::Lazy;
use std::sync::Mutex;

bitflags::bitflags! {
    /// Mirrors CPython's `CO_*` code object flag bits.
    #[derive(Default)]
    pub struct CodeFlags: u32 {
        const OPTIMIZED           = 0x0001;
        const NEWLOCALS           = 0x0002;
        const VARARGS             = 0x0004;
        const VARKEYWORDS         = 0x0008;
        const NESTED              = 0x0010;
        const GENERATOR           = 0x0020;
        const NOFREE              = 0x0040;
        const COROUTINE           = 0x0080;
        const ITERABLE_COROUTINE  = 0x0100;
        const ASYNC_GENERATOR     = 0x0200;
    }
}

impl CodeFlags {
    /// Whether this code object ever suspends mid-body and therefore must
    /// be emitted as a single, unsplit C function (see the chunker).
    pub fn suspends(&self) -> bool {
        self.intersects(
            CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR,
        )
    }
}

/// One decoded bytecode instruction.
///
/// `label` is the byte offset of the instruction in the original bytecode
/// and is the sole jump-target identifier used throughout lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub label: u32,
    pub opcode: opcodes::Opcode,
    pub oparg: u32,
    pub source_line: u32,
}

/// A compiled Python code object: module body, function, lambda,
/// comprehension, class body, or nested generator.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub argcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: CodeFlags,
    pub raw_bytecode: Vec<u8>,
    pub consts: Vec<Constant>,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,
    pub filename: String,
    pub qualname: String,
    pub first_lineno: u32,
    /// Parallel to bytecode offsets: line table entries as `(start_offset, line)`.
    pub line_table: Vec<(u32, u32)>,
}

impl CodeObject {
    /// Decode `raw_bytecode` into a flat instruction stream, folding
    /// `EXTENDED_ARG` into the following instruction's oparg while leaving
    /// a NOP behind at the `EXTENDED_ARG`'s own label so jump targets that
    /// point at it remain valid.
    pub fn decode_instructions(&self) -> Vec<Instruction> {
        decode_bytecode(&self.raw_bytecode, &self.line_table, self.first_lineno)
    }

    pub fn line_for_offset(&self, offset: u32) -> u32 {
        let mut line = self.first_lineno;
        for &(start, l) in &self.line_table {
            if start > offset {
                break;
            }
            line = l;
        }
        line
    }
}

/// Decode a raw CPython 3.6-layout bytecode string (2 bytes per
/// instruction: opcode, oparg) into `Instruction`s.
pub fn decode_bytecode(
    raw: &[u8],
    line_table: &[(u32, u32)],
    first_lineno: u32,
) -> Vec<Instruction> {
    let mut instructions = Vec::with_capacity(raw.len() / 2);
    let mut i = 0usize;
    let mut extended_arg: u32 = 0;

    let line_for = |offset: u32| -> u32 {
        let mut line = first_lineno;
        for &(start, l) in line_table {
            if start > offset {
                break;
            }
            line = l;
        }
        line
    };

    while i + 1 < raw.len() {
        let label = i as u32;
        let op = raw[i];
        let arg_byte = raw[i + 1] as u32;
        i += 2;

        if op == opcodes::EXTENDED_ARG {
            instructions.push(Instruction {
                label,
                opcode: opcodes::NOP,
                oparg: 0,
                source_line: line_for(label),
            });
            extended_arg = (extended_arg | arg_byte) << 8;
            continue;
        }

        let oparg = extended_arg | arg_byte;
        extended_arg = 0;

        instructions.push(Instruction {
            label,
            opcode: op,
            oparg,
            source_line: line_for(label),
        });
    }

    instructions
}

/// Process-wide aggregator of the largest stack/cell/local counts observed
/// across all code objects ingested so far, used by the runtime to size
/// frame storage. Updated under a lock since code-object ingestion may run
/// concurrently across worker threads.
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalMaxima {
    pub max_stacksize: u32,
    pub max_ncells: u32,
    pub max_nlocals: u32,
}

static GLOBAL_MAXIMA: Lazy<Mutex<GlobalMaxima>> = Lazy::new(|| Mutex::new(GlobalMaxima::default()));

/// Record a code object's sizing numbers against the process-wide maxima.
pub fn record_code_object_sizes(code: &CodeObject) {
    let mut maxima = GLOBAL_MAXIMA.lock().expect("global maxima lock poisoned");
    maxima.max_stacksize = maxima.max_stacksize.max(code.stacksize);
    maxima.max_ncells = maxima
        .max_ncells
        .max((code.cellvars.len() + code.freevars.len()) as u32);
    maxima.max_nlocals = maxima.max_nlocals.max(code.nlocals);
}

pub fn global_maxima() -> GlobalMaxima {
    *GLOBAL_MAXIMA.lock().expect("global maxima lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_code(raw_bytecode: Vec<u8>) -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            raw_bytecode,
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
    fn test_decode_simple() {
        let code = empty_code(vec![opcodes::LOAD_CONST, 0, opcodes::RETURN_VALUE, 0]);
        let instrs = code.decode_instructions();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].label, 0);
        assert_eq!(instrs[0].opcode, opcodes::LOAD_CONST);
        assert_eq!(instrs[0].oparg, 0);
        assert_eq!(instrs[1].label, 2);
        assert_eq!(instrs[1].opcode, opcodes::RETURN_VALUE);
    }

    #[test]
    fn test_extended_arg_folding() {
        // EXTENDED_ARG 1; LOAD_CONST 2 -> oparg = (1 << 8) | 2 = 258
        let code = empty_code(vec![
            opcodes::EXTENDED_ARG,
            1,
            opcodes::LOAD_CONST,
            2,
        ]);
        let instrs = code.decode_instructions();
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, opcodes::NOP);
        assert_eq!(instrs[0].label, 0);
        assert_eq!(instrs[1].opcode, opcodes::LOAD_CONST);
        assert_eq!(instrs[1].oparg, 258);
        assert_eq!(instrs[1].label, 2);
    }

    #[test]
    fn test_suspends() {
        assert!(CodeFlags::GENERATOR.suspends());
        assert!(CodeFlags::COROUTINE.suspends());
        assert!(!CodeFlags::OPTIMIZED.suspends());
    }

    #[test]
    fn test_global_maxima_records() {
        let mut code = empty_code(vec![]);
        code.stacksize = 42;
        code.nlocals = 9;
        record_code_object_sizes(&code);
        let maxima = global_maxima();
        assert!(maxima.max_stacksize >= 42);
        assert!(maxima.max_nlocals >= 9);
    }
}


