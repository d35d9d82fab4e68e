// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Peephole detection and resolution of the `LOAD_CONST / IMPORT_NAME /
[IMPORT_FROM…] / STORE_*` idiom the Python compiler emits for `import`
statements, rewritten directly into runtime import calls keyed by module
id rather than lowered instruction-by-instruction. */

use crate::code_object::{CodeObject, Instruction};
use crate::config::ImportAliasPolicy;
use crate::constants::Constant;
use crate::module_id::module_id;
use crate::opcodes;

/// The resolved shape of one import idiom match, ready for direct
/// C emission by the lowering engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportPlan {
    /// `import a.b.c` or `import a.b.c as x`.
    Plain {
        root_id: u32,
        /// Module ids of each segment of the dotted path, root first.
        chain: Vec<u32>,
        /// Whether the leaf module (rather than the root) is the value
        /// pushed for the following STORE (true for `as x` imports).
        push_leaf: bool,
        store: u32,
    },
    /// `from x import *`.
    Star { module_id: u32 },
    /// `from x import a, b, c`.
    FromNames { module_id: u32, names: Vec<String> },
}

/// A matched idiom plus how many instructions it consumed.
pub struct Detected {
    pub plan: ImportPlan,
    pub consumed: usize,
}

impl std::ops::Deref for Detected {
    type Target = ImportPlan;
    fn deref(&self) -> &ImportPlan {
        &self.plan
    }
}

/// Resolve a dotted module name to its stable id, consulting the alias
/// policy exactly once before hashing. This is the single entry point both
/// graph-edge discovery and per-instruction import rewriting call.
pub fn resolve_module_id(name: &str, aliases: &ImportAliasPolicy) -> (String, u32) {
    let resolved = aliases.resolve(name).to_string();
    let id = module_id(&resolved);
    (resolved, id)
}

/// Attempt to match the import idiom starting at `instructions[start]`.
/// Returns `None` if `instructions[start]` is not the head of the pattern.
pub fn detect(instructions: &[Instruction], start: usize, code: &CodeObject) -> Option<ImportPlan> {
    detect_with_aliases(instructions, start, code, &ImportAliasPolicy::default()).map(|d| d.plan)
}

/// Same as `detect` but threads the alias policy through resolution, and
/// reports how many instructions were consumed.
pub fn detect_with_aliases(
    instructions: &[Instruction],
    start: usize,
    code: &CodeObject,
    aliases: &ImportAliasPolicy,
) -> Option<Detected> {
    let load_level = instructions.get(start)?;
    if load_level.opcode != opcodes::LOAD_CONST {
        return None;
    }
    let load_fromlist = instructions.get(start + 1)?;
    if load_fromlist.opcode != opcodes::LOAD_CONST {
        return None;
    }
    let import_name = instructions.get(start + 2)?;
    if import_name.opcode != opcodes::IMPORT_NAME {
        return None;
    }

    let fromlist_const = code.consts.get(load_fromlist.oparg as usize)?;
    let name = code.names.get(import_name.oparg as usize)?.clone();

    let fromlist: Vec<String> = match fromlist_const {
        Constant::None => vec![],
        Constant::Tuple(items) => items
            .iter()
            .filter_map(|c| match c {
                Constant::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        _ => vec![],
    };

    let mut consumed = 3usize;

    if fromlist.is_empty() {
        // Plain `import a.b.c[ as x]`. Trailing LOAD_ATTR chain (for `as x`)
        // consumes additional segments; otherwise the root is pushed and a
        // single STORE_* follows directly.
        let segments: Vec<&str> = name.split('.').collect();
        let mut chain = Vec::with_capacity(segments.len());
        let mut acc = String::new();
        for seg in &segments {
            if !acc.is_empty() {
                acc.push('.');
            }
            acc.push_str(seg);
            let (_, id) = resolve_module_id(&acc, aliases);
            chain.push(id);
        }

        let mut push_leaf = false;
        let mut cursor = start + consumed;
        while instructions
            .get(cursor)
            .map(|i| i.opcode == opcodes::LOAD_ATTR)
            .unwrap_or(false)
        {
            push_leaf = true;
            cursor += 1;
        }
        consumed = cursor - start;

        let store = instructions.get(cursor).map(|i| i.oparg).unwrap_or(0);
        if instructions
            .get(cursor)
            .map(|i| is_store(i.opcode))
            .unwrap_or(false)
        {
            consumed += 1;
        }

        let (_, root_id) = resolve_module_id(segments[0], aliases);
        Some(Detected {
            plan: ImportPlan::Plain { root_id, chain, push_leaf, store },
            consumed,
        })
    } else if fromlist.len() == 1 && fromlist[0] == "*" {
        let (_, id) = resolve_module_id(&name, aliases);
        Some(Detected {
            plan: ImportPlan::Star { module_id: id },
            consumed,
        })
    } else {
        let (_, id) = resolve_module_id(&name, aliases);
        // Each name in the fromlist corresponds to an IMPORT_FROM + STORE_*
        // pair in the raw stream; our rewrite absorbs all of them.
        let mut cursor = start + consumed;
        for _ in &fromlist {
            if instructions
                .get(cursor)
                .map(|i| i.opcode == opcodes::IMPORT_FROM)
                .unwrap_or(false)
            {
                cursor += 1;
            }
            if instructions
                .get(cursor)
                .map(|i| is_store(i.opcode))
                .unwrap_or(false)
            {
                cursor += 1;
            }
        }
        consumed = cursor - start;
        Some(Detected {
            plan: ImportPlan::FromNames { module_id: id, names: fromlist },
            consumed,
        })
    }
}

fn is_store(op: opcodes::Opcode) -> bool {
    matches!(op, opcodes::STORE_NAME | opcodes::STORE_FAST | opcodes::STORE_GLOBAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_object::CodeFlags;

    fn code_with(raw: Vec<u8>, consts: Vec<Constant>, names: Vec<String>) -> CodeObject {
        CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 2,
            flags: CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS,
            raw_bytecode: raw,
            consts,
            names,
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
    fn test_plain_import_detected() {
        let code = code_with(
            vec![
                opcodes::LOAD_CONST, 0,
                opcodes::LOAD_CONST, 1,
                opcodes::IMPORT_NAME, 0,
                opcodes::STORE_NAME, 0,
            ],
            vec![Constant::Int(0), Constant::None],
            vec!["os".to_string()],
        );
        let instrs = code.decode_instructions();
        let detected = detect_with_aliases(&instrs, 0, &code, &ImportAliasPolicy::default()).unwrap();
        assert_eq!(detected.consumed, 4);
        match detected.plan {
            ImportPlan::Plain { chain, .. } => assert_eq!(chain.len(), 1),
            _ => panic!("expected Plain"),
        }
    }

    #[test]
    fn test_from_import_star() {
        let code = code_with(
            vec![
                opcodes::LOAD_CONST, 0,
                opcodes::LOAD_CONST, 1,
                opcodes::IMPORT_NAME, 0,
                opcodes::IMPORT_STAR, 0,
            ],
            vec![
                Constant::Int(0),
                Constant::Tuple(vec![Constant::Str("*".to_string())]),
            ],
            vec!["os".to_string()],
        );
        let instrs = code.decode_instructions();
        let detected = detect_with_aliases(&instrs, 0, &code, &ImportAliasPolicy::default()).unwrap();
        assert!(matches!(detected.plan, ImportPlan::Star { .. }));
    }

    #[test]
    fn test_alias_consulted_once() {
        let mut aliases = ImportAliasPolicy::default();
        aliases.insert("os", "os_replacement");
        let (resolved, _) = resolve_module_id("os", &aliases);
        assert_eq!(resolved, "os_replacement");
    }

    #[test]
    fn test_no_match_on_unrelated_opcode() {
        let code = code_with(vec![opcodes::LOAD_FAST, 0], vec![], vec![]);
        let instrs = code.decode_instructions();
        assert!(detect(&instrs, 0, &code).is_none());
    }
}


