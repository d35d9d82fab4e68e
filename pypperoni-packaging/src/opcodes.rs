// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The CPython 3.6 bytecode opcode table.

This module is the Rust equivalent of Python's `opcode` module: a table
mapping numeric opcodes to names, plus the handful of named constants the
rest of the crate switches on directly. The bytecode version is pinned
here, once, rather than auto-detected (see the design notes on bytecode
versioning).
*/

pub type Opcode = u8;

pub const POP_TOP: Opcode = 1;
pub const ROT_TWO: Opcode = 2;
pub const ROT_THREE: Opcode = 3;
pub const DUP_TOP: Opcode = 4;
pub const DUP_TOP_TWO: Opcode = 5;
pub const NOP: Opcode = 9;
pub const UNARY_POSITIVE: Opcode = 10;
pub const UNARY_NEGATIVE: Opcode = 11;
pub const UNARY_NOT: Opcode = 12;
pub const UNARY_INVERT: Opcode = 15;
pub const BINARY_MATRIX_MULTIPLY: Opcode = 16;
pub const INPLACE_MATRIX_MULTIPLY: Opcode = 17;
pub const BINARY_POWER: Opcode = 19;
pub const BINARY_MULTIPLY: Opcode = 20;
pub const BINARY_MODULO: Opcode = 22;
pub const BINARY_ADD: Opcode = 23;
pub const BINARY_SUBTRACT: Opcode = 24;
pub const BINARY_SUBSCR: Opcode = 25;
pub const BINARY_FLOOR_DIVIDE: Opcode = 26;
pub const BINARY_TRUE_DIVIDE: Opcode = 27;
pub const INPLACE_FLOOR_DIVIDE: Opcode = 28;
pub const INPLACE_TRUE_DIVIDE: Opcode = 29;
pub const GET_AITER: Opcode = 50;
pub const GET_ANEXT: Opcode = 51;
pub const BEFORE_ASYNC_WITH: Opcode = 52;
pub const INPLACE_ADD: Opcode = 55;
pub const INPLACE_SUBTRACT: Opcode = 56;
pub const INPLACE_MULTIPLY: Opcode = 57;
pub const INPLACE_MODULO: Opcode = 59;
pub const STORE_SUBSCR: Opcode = 60;
pub const DELETE_SUBSCR: Opcode = 61;
pub const BINARY_LSHIFT: Opcode = 62;
pub const BINARY_RSHIFT: Opcode = 63;
pub const BINARY_AND: Opcode = 64;
pub const BINARY_XOR: Opcode = 65;
pub const BINARY_OR: Opcode = 66;
pub const INPLACE_POWER: Opcode = 67;
pub const GET_ITER: Opcode = 68;
pub const GET_YIELD_FROM_ITER: Opcode = 69;
pub const PRINT_EXPR: Opcode = 70;
pub const LOAD_BUILD_CLASS: Opcode = 71;
pub const YIELD_FROM: Opcode = 72;
pub const GET_AWAITABLE: Opcode = 73;
pub const INPLACE_LSHIFT: Opcode = 75;
pub const INPLACE_RSHIFT: Opcode = 76;
pub const INPLACE_AND: Opcode = 77;
pub const INPLACE_XOR: Opcode = 78;
pub const INPLACE_OR: Opcode = 79;
pub const BREAK_LOOP: Opcode = 80;
pub const WITH_CLEANUP_START: Opcode = 81;
pub const WITH_CLEANUP_FINISH: Opcode = 82;
pub const RETURN_VALUE: Opcode = 83;
pub const IMPORT_STAR: Opcode = 84;
pub const SETUP_ANNOTATIONS: Opcode = 85;
pub const YIELD_VALUE: Opcode = 86;
pub const POP_BLOCK: Opcode = 87;
pub const END_FINALLY: Opcode = 88;
pub const POP_EXCEPT: Opcode = 89;

pub const HAVE_ARGUMENT: Opcode = 90;

pub const STORE_NAME: Opcode = 90;
pub const DELETE_NAME: Opcode = 91;
pub const UNPACK_SEQUENCE: Opcode = 92;
pub const FOR_ITER: Opcode = 93;
pub const UNPACK_EX: Opcode = 94;
pub const STORE_ATTR: Opcode = 95;
pub const DELETE_ATTR: Opcode = 96;
pub const STORE_GLOBAL: Opcode = 97;
pub const DELETE_GLOBAL: Opcode = 98;
pub const LOAD_CONST: Opcode = 100;
pub const LOAD_NAME: Opcode = 101;
pub const BUILD_TUPLE: Opcode = 102;
pub const BUILD_LIST: Opcode = 103;
pub const BUILD_SET: Opcode = 104;
pub const BUILD_MAP: Opcode = 105;
pub const LOAD_ATTR: Opcode = 106;
pub const COMPARE_OP: Opcode = 107;
pub const IMPORT_NAME: Opcode = 108;
pub const IMPORT_FROM: Opcode = 109;
pub const JUMP_FORWARD: Opcode = 110;
pub const JUMP_IF_FALSE_OR_POP: Opcode = 111;
pub const JUMP_IF_TRUE_OR_POP: Opcode = 112;
pub const JUMP_ABSOLUTE: Opcode = 113;
pub const POP_JUMP_IF_FALSE: Opcode = 114;
pub const POP_JUMP_IF_TRUE: Opcode = 115;
pub const LOAD_GLOBAL: Opcode = 116;
pub const CONTINUE_LOOP: Opcode = 119;
pub const SETUP_LOOP: Opcode = 120;
pub const SETUP_EXCEPT: Opcode = 121;
pub const SETUP_FINALLY: Opcode = 122;
pub const LOAD_FAST: Opcode = 124;
pub const STORE_FAST: Opcode = 125;
pub const DELETE_FAST: Opcode = 126;
pub const STORE_ANNOTATION: Opcode = 127;
pub const RAISE_VARARGS: Opcode = 130;
pub const CALL_FUNCTION: Opcode = 131;
pub const MAKE_FUNCTION: Opcode = 132;
pub const BUILD_SLICE: Opcode = 133;
pub const LOAD_CLOSURE: Opcode = 135;
pub const LOAD_DEREF: Opcode = 136;
pub const STORE_DEREF: Opcode = 137;
pub const DELETE_DEREF: Opcode = 138;
pub const CALL_FUNCTION_KW: Opcode = 141;
pub const CALL_FUNCTION_EX: Opcode = 142;
pub const SETUP_WITH: Opcode = 143;
pub const EXTENDED_ARG: Opcode = 144;
pub const LIST_APPEND: Opcode = 145;
pub const SET_ADD: Opcode = 146;
pub const MAP_ADD: Opcode = 147;
pub const LOAD_CLASSDEREF: Opcode = 148;
pub const BUILD_LIST_UNPACK: Opcode = 149;
pub const BUILD_MAP_UNPACK: Opcode = 150;
pub const BUILD_MAP_UNPACK_WITH_CALL: Opcode = 151;
pub const BUILD_TUPLE_UNPACK: Opcode = 152;
pub const BUILD_SET_UNPACK: Opcode = 153;
pub const SETUP_ASYNC_WITH: Opcode = 154;
pub const FORMAT_VALUE: Opcode = 155;
pub const BUILD_CONST_KEY_MAP: Opcode = 156;
pub const BUILD_STRING: Opcode = 157;
pub const BUILD_TUPLE_UNPACK_WITH_CALL: Opcode = 158;

/// Opcodes whose jump target is an absolute bytecode offset rather than
/// relative to the instruction.
pub fn is_absolute_jump(op: Opcode) -> bool {
    matches!(
        op,
        JUMP_ABSOLUTE
            | CONTINUE_LOOP
            | POP_JUMP_IF_FALSE
            | POP_JUMP_IF_TRUE
            | JUMP_IF_FALSE_OR_POP
            | JUMP_IF_TRUE_OR_POP
    )
}

/// Opcodes whose oparg is a relative jump distance (measured from the
/// instruction *after* the operand).
pub fn is_relative_jump(op: Opcode) -> bool {
    matches!(
        op,
        JUMP_FORWARD | SETUP_LOOP | SETUP_EXCEPT | SETUP_FINALLY | SETUP_WITH | SETUP_ASYNC_WITH
    )
}

/// Resolve the human-readable name for an opcode, the same way Python's
/// `dis.opname` does. Returns `None` for numbers with no assigned meaning
/// in this bytecode version.
pub fn opname(op: Opcode) -> Option<&'static str> {
    Some(match op {
        POP_TOP => "POP_TOP",
        ROT_TWO => "ROT_TWO",
        ROT_THREE => "ROT_THREE",
        DUP_TOP => "DUP_TOP",
        DUP_TOP_TWO => "DUP_TOP_TWO",
        NOP => "NOP",
        UNARY_POSITIVE => "UNARY_POSITIVE",
        UNARY_NEGATIVE => "UNARY_NEGATIVE",
        UNARY_NOT => "UNARY_NOT",
        UNARY_INVERT => "UNARY_INVERT",
        BINARY_MATRIX_MULTIPLY => "BINARY_MATRIX_MULTIPLY",
        INPLACE_MATRIX_MULTIPLY => "INPLACE_MATRIX_MULTIPLY",
        BINARY_POWER => "BINARY_POWER",
        BINARY_MULTIPLY => "BINARY_MULTIPLY",
        BINARY_MODULO => "BINARY_MODULO",
        BINARY_ADD => "BINARY_ADD",
        BINARY_SUBTRACT => "BINARY_SUBTRACT",
        BINARY_SUBSCR => "BINARY_SUBSCR",
        BINARY_FLOOR_DIVIDE => "BINARY_FLOOR_DIVIDE",
        BINARY_TRUE_DIVIDE => "BINARY_TRUE_DIVIDE",
        INPLACE_FLOOR_DIVIDE => "INPLACE_FLOOR_DIVIDE",
        INPLACE_TRUE_DIVIDE => "INPLACE_TRUE_DIVIDE",
        GET_AITER => "GET_AITER",
        GET_ANEXT => "GET_ANEXT",
        BEFORE_ASYNC_WITH => "BEFORE_ASYNC_WITH",
        INPLACE_ADD => "INPLACE_ADD",
        INPLACE_SUBTRACT => "INPLACE_SUBTRACT",
        INPLACE_MULTIPLY => "INPLACE_MULTIPLY",
        INPLACE_MODULO => "INPLACE_MODULO",
        STORE_SUBSCR => "STORE_SUBSCR",
        DELETE_SUBSCR => "DELETE_SUBSCR",
        BINARY_LSHIFT => "BINARY_LSHIFT",
        BINARY_RSHIFT => "BINARY_RSHIFT",
        BINARY_AND => "BINARY_AND",
        BINARY_XOR => "BINARY_XOR",
        BINARY_OR => "BINARY_OR",
        INPLACE_POWER => "INPLACE_POWER",
        GET_ITER => "GET_ITER",
        GET_YIELD_FROM_ITER => "GET_YIELD_FROM_ITER",
        PRINT_EXPR => "PRINT_EXPR",
        LOAD_BUILD_CLASS => "LOAD_BUILD_CLASS",
        YIELD_FROM => "YIELD_FROM",
        GET_AWAITABLE => "GET_AWAITABLE",
        INPLACE_LSHIFT => "INPLACE_LSHIFT",
        INPLACE_RSHIFT => "INPLACE_RSHIFT",
        INPLACE_AND => "INPLACE_AND",
        INPLACE_XOR => "INPLACE_XOR",
        INPLACE_OR => "INPLACE_OR",
        BREAK_LOOP => "BREAK_LOOP",
        WITH_CLEANUP_START => "WITH_CLEANUP_START",
        WITH_CLEANUP_FINISH => "WITH_CLEANUP_FINISH",
        RETURN_VALUE => "RETURN_VALUE",
        IMPORT_STAR => "IMPORT_STAR",
        SETUP_ANNOTATIONS => "SETUP_ANNOTATIONS",
        YIELD_VALUE => "YIELD_VALUE",
        POP_BLOCK => "POP_BLOCK",
        END_FINALLY => "END_FINALLY",
        POP_EXCEPT => "POP_EXCEPT",
        STORE_NAME => "STORE_NAME",
        DELETE_NAME => "DELETE_NAME",
        UNPACK_SEQUENCE => "UNPACK_SEQUENCE",
        FOR_ITER => "FOR_ITER",
        UNPACK_EX => "UNPACK_EX",
        STORE_ATTR => "STORE_ATTR",
        DELETE_ATTR => "DELETE_ATTR",
        STORE_GLOBAL => "STORE_GLOBAL",
        DELETE_GLOBAL => "DELETE_GLOBAL",
        LOAD_CONST => "LOAD_CONST",
        LOAD_NAME => "LOAD_NAME",
        BUILD_TUPLE => "BUILD_TUPLE",
        BUILD_LIST => "BUILD_LIST",
        BUILD_SET => "BUILD_SET",
        BUILD_MAP => "BUILD_MAP",
        LOAD_ATTR => "LOAD_ATTR",
        COMPARE_OP => "COMPARE_OP",
        IMPORT_NAME => "IMPORT_NAME",
        IMPORT_FROM => "IMPORT_FROM",
        JUMP_FORWARD => "JUMP_FORWARD",
        JUMP_IF_FALSE_OR_POP => "JUMP_IF_FALSE_OR_POP",
        JUMP_IF_TRUE_OR_POP => "JUMP_IF_TRUE_OR_POP",
        JUMP_ABSOLUTE => "JUMP_ABSOLUTE",
        POP_JUMP_IF_FALSE => "POP_JUMP_IF_FALSE",
        POP_JUMP_IF_TRUE => "POP_JUMP_IF_TRUE",
        LOAD_GLOBAL => "LOAD_GLOBAL",
        CONTINUE_LOOP => "CONTINUE_LOOP",
        SETUP_LOOP => "SETUP_LOOP",
        SETUP_EXCEPT => "SETUP_EXCEPT",
        SETUP_FINALLY => "SETUP_FINALLY",
        LOAD_FAST => "LOAD_FAST",
        STORE_FAST => "STORE_FAST",
        DELETE_FAST => "DELETE_FAST",
        STORE_ANNOTATION => "STORE_ANNOTATION",
        RAISE_VARARGS => "RAISE_VARARGS",
        CALL_FUNCTION => "CALL_FUNCTION",
        MAKE_FUNCTION => "MAKE_FUNCTION",
        BUILD_SLICE => "BUILD_SLICE",
        LOAD_CLOSURE => "LOAD_CLOSURE",
        LOAD_DEREF => "LOAD_DEREF",
        STORE_DEREF => "STORE_DEREF",
        DELETE_DEREF => "DELETE_DEREF",
        CALL_FUNCTION_KW => "CALL_FUNCTION_KW",
        CALL_FUNCTION_EX => "CALL_FUNCTION_EX",
        SETUP_WITH => "SETUP_WITH",
        EXTENDED_ARG => "EXTENDED_ARG",
        LIST_APPEND => "LIST_APPEND",
        SET_ADD => "SET_ADD",
        MAP_ADD => "MAP_ADD",
        LOAD_CLASSDEREF => "LOAD_CLASSDEREF",
        BUILD_LIST_UNPACK => "BUILD_LIST_UNPACK",
        BUILD_MAP_UNPACK => "BUILD_MAP_UNPACK",
        BUILD_MAP_UNPACK_WITH_CALL => "BUILD_MAP_UNPACK_WITH_CALL",
        BUILD_TUPLE_UNPACK => "BUILD_TUPLE_UNPACK",
        BUILD_SET_UNPACK => "BUILD_SET_UNPACK",
        SETUP_ASYNC_WITH => "SETUP_ASYNC_WITH",
        FORMAT_VALUE => "FORMAT_VALUE",
        BUILD_CONST_KEY_MAP => "BUILD_CONST_KEY_MAP",
        BUILD_STRING => "BUILD_STRING",
        BUILD_TUPLE_UNPACK_WITH_CALL => "BUILD_TUPLE_UNPACK_WITH_CALL",
        _ => return None,
    })
}

/// Whether `opname(op)` starts with the given family prefix (`UNARY_`,
/// `BINARY_`, `INPLACE_`). Used by the lowering engine to route whole
/// opcode families through one rule.
pub fn family_prefix(op: Opcode) -> Option<&'static str> {
    let name = opname(op)?;
    if name.starts_with("UNARY_") {
        Some("UNARY_")
    } else if name.starts_with("BINARY_") {
        Some("BINARY_")
    } else if name.starts_with("INPLACE_") {
        Some("INPLACE_")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opname_known() {
        assert_eq!(opname(LOAD_CONST), Some("LOAD_CONST"));
        assert_eq!(opname(RETURN_VALUE), Some("RETURN_VALUE"));
    }

    #[test]
    fn test_opname_unknown() {
        assert_eq!(opname(0), None);
        assert_eq!(opname(200), None);
    }

    #[test]
    fn test_family_prefix() {
        assert_eq!(family_prefix(UNARY_NOT), Some("UNARY_"));
        assert_eq!(family_prefix(BINARY_ADD), Some("BINARY_"));
        assert_eq!(family_prefix(INPLACE_ADD), Some("INPLACE_"));
        assert_eq!(family_prefix(LOAD_CONST), None);
    }
}
