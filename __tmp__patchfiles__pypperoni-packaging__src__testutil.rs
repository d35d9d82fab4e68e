// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Test doubles shared across this crate's integration tests. */

use crate::code_object::{CodeFlags, CodeObject};
use crate::constants::Constant;
use crate::module_graph::HostResolver;

/// A `HostResolver` double that resolves a fixed set of names as builtin,
/// rejecting everything else.
pub struct FixedHostResolver {
    pub known: Vec<String>,
}

impl HostResolver for FixedHostResolver {
    fn resolve(&self, name: &str) -> bool {
        self.known.iter().any(|k| k == name)
    }
}

/// Build a minimal code object equivalent to compiling `pass`: just
/// `LOAD_CONST None; RETURN_VALUE`.
pub fn trivial_code_object(filename: &str) -> CodeObject {
    CodeObject {
        argcount: 0,
        kwonlyargcount: 0,
        nlocals: 0,
        stacksize: 1,
        flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
        raw_bytecode: vec![
            crate::opcodes::LOAD_CONST,
            0,
            crate::opcodes::RETURN_VALUE,
            0,
        ],
        consts: vec![Constant::None],
        names: vec![],
        varnames: vec![],
        freevars: vec![],
        cellvars: vec![],
        filename: filename.to_string(),
        qualname: "<module>".to_string(),
        first_lineno: 1,
        line_table: vec![(0, 1)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_host_resolver() {
        let resolver = FixedHostResolver { known: vec!["os".to_string()] };
        assert!(resolver.resolve("os"));
        assert!(!resolver.resolve("numpy"));
    }

    #[test]
    fn test_trivial_code_object_decodes() {
        let code = trivial_code_object("m.py");
        let instrs = code.decode_instructions();
        assert_eq!(instrs.len(), 2);
    }
}


