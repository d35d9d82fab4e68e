// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Splits a code object's instruction stream into size-bounded chunks,
each emitted as its own C function, without crossing a jump boundary. */

use crate::code_object::{CodeFlags, CodeObject, Instruction};
use crate::opcodes;

/// One contiguous slice of a code object's instructions, to be emitted as
/// its own C function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub start_index: usize,
    pub end_index: usize,
}

/// Split `instructions` into chunks of at most `split_interval`
/// instructions apiece, never cutting in the middle of a jump's source-to-
/// target range nor in the middle of an import idiom.
///
/// Generators (and coroutines/async generators, whose resumption dispatch
/// requires a single function body) are never split: callers should check
/// `flags.suspends()` before calling this and skip chunking entirely.
pub fn chunk_instructions(instructions: &[Instruction], split_interval: usize) -> Vec<Chunk> {
    if instructions.is_empty() {
        return vec![];
    }
    if instructions.len() <= split_interval {
        return vec![Chunk { start_index: 0, end_index: instructions.len() }];
    }

    let mut chunks = Vec::new();
    let mut chunk_start = 0usize;
    let mut yield_at: u32 = 0;

    for (i, instr) in instructions.iter().enumerate() {
        yield_at = yield_at.max(extend_yield_at(instr));

        let chunk_len = i - chunk_start + 1;
        if chunk_len >= split_interval && instr.label >= yield_at {
            chunks.push(Chunk { start_index: chunk_start, end_index: i + 1 });
            chunk_start = i + 1;
        }
    }

    if chunk_start < instructions.len() {
        chunks.push(Chunk { start_index: chunk_start, end_index: instructions.len() });
    }

    chunks
}

/// Compute how far `yield_at` must extend to keep `instr`'s jump (if any)
/// entirely within whatever chunk contains `instr`.
fn extend_yield_at(instr: Instruction) -> u32 {
    let op = instr.opcode;
    if opcodes::is_relative_jump(op) {
        instr.label + instr.oparg + 4
    } else if opcodes::is_absolute_jump(op) {
        instr.oparg + 1
    } else {
        0
    }
}

/// Whether `code` should be chunked at all.
pub fn should_chunk(code: &CodeObject, split_interval: usize) -> bool {
    !code.flags.suspends() && code.decode_instructions().len() > split_interval
}

pub fn suspends(flags: CodeFlags) -> bool {
    flags.suspends()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_object::CodeFlags;
    use crate::constants::Constant;

    fn make_code(n_nops: usize) -> CodeObject {
        let mut raw = Vec::with_capacity(n_nops * 2 + 2);
        for _ in 0..n_nops {
            raw.push(opcodes::NOP);
            raw.push(0);
        }
        raw.push(opcodes::RETURN_VALUE);
        raw.push(0);
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 1,
            flags: CodeFlags::OPTIMIZED,
            raw_bytecode: raw,
            consts: vec![Constant::None],
            names: vec![],
            varnames: vec![],
            freevars: vec![],
            cellvars: vec![],
            filename: "m.py".to_string(),
            qualname: "f".to_string(),
            first_lineno: 1,
            line_table: vec![(0, 1)],
        }
    }

    #[test]
    fn test_no_split_under_interval() {
        let code = make_code(10);
        let instrs = code.decode_instructions();
        let chunks = chunk_instructions(&instrs, 100);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_splits_over_interval() {
        let code = make_code(50);
        let instrs = code.decode_instructions();
        let chunks = chunk_instructions(&instrs, 10);
        assert!(chunks.len() >= 2);
        // Every instruction accounted for exactly once.
        let mut total = 0;
        for (i, c) in chunks.iter().enumerate() {
            if i > 0 {
                assert_eq!(c.start_index, chunks[i - 1].end_index);
            }
            total += c.end_index - c.start_index;
        }
        assert_eq!(total, instrs.len());
    }

    #[test]
    fn test_jump_never_crosses_chunk_boundary() {
        // LOAD_FAST*N; loop back via JUMP_ABSOLUTE to label 0; RETURN_VALUE
        let mut raw = Vec::new();
        for _ in 0..20 {
            raw.push(opcodes::LOAD_FAST);
            raw.push(0);
            raw.push(opcodes::POP_TOP);
            raw.push(0);
        }
        raw.push(opcodes::JUMP_ABSOLUTE);
        raw.push(0);
        raw.push(opcodes::RETURN_VALUE);
        raw.push(0);

        let mut code = make_code(0);
        code.raw_bytecode = raw;
        let instrs = code.decode_instructions();
        let chunks = chunk_instructions(&instrs, 5);

        for chunk in &chunks {
            let slice = &instrs[chunk.start_index..chunk.end_index];
            for instr in slice {
                if opcodes::is_absolute_jump(instr.opcode) {
                    let target = instr.oparg;
                    let target_in_chunk = slice.iter().any(|i| i.label == target);
                    assert!(target_in_chunk, "jump target escaped its chunk");
                }
            }
        }
    }

    #[test]
    fn test_should_chunk_respects_generator_flag() {
        let mut code = make_code(50);
        code.flags = CodeFlags::GENERATOR;
        assert!(!should_chunk(&code, 10));
    }
}


