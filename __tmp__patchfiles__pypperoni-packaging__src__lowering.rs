// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Per-opcode lowering rules: the translation from one decoded bytecode
instruction into the C fragments that manipulate the emulated evaluation
stack and call the runtime.

Every rule follows the same shape described in the design notes: pop
operand(s) off the emulated stack via macros, call a runtime helper, check
the error convention, push the result or jump to error handling. Families
sharing that shape (`UNARY_*`, `BINARY_*`, `INPLACE_*`) are dispatched
through one generic rule rather than one match arm apiece.
*/

use crate::{
    code_object::{CodeObject, Instruction},
    config::ImportAliasPolicy,
    constants::Constant,
    emission::EmissionContext,
    import_rewrite::{self, ImportPlan},
    opcodes,
};
use anyhow::{anyhow, bail, Result};

/// One entry on the emulated try/loop block stack, tracking what POP_BLOCK
/// or an unwind should restore.
#[derive(Debug, Clone, Copy)]
struct BlockEntry {
    kind: BlockKind,
    handler: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Loop,
    Except,
    Finally,
    With,
}

/// Drives lowering of one code object's instruction stream (or one chunk
/// of it) into an `EmissionContext`.
pub struct Lowerer<'a> {
    code: &'a CodeObject,
    module_path: &'a str,
    aliases: ImportAliasPolicy,
    block_stack: Vec<BlockEntry>,
    /// Nested code objects encountered via LOAD_CONST of a CodeRef, keyed
    /// by the constant index most recently pushed, consumed by the next
    /// MAKE_FUNCTION.
    pending_code_ref: Option<u32>,
}

impl<'a> Lowerer<'a> {
    pub fn new(code: &'a CodeObject, module_path: &'a str) -> Self {
        Self::with_aliases(code, module_path, ImportAliasPolicy::default())
    }

    pub fn with_aliases(code: &'a CodeObject, module_path: &'a str, aliases: ImportAliasPolicy) -> Self {
        Lowerer {
            code,
            module_path,
            aliases,
            block_stack: Vec::new(),
            pending_code_ref: None,
        }
    }

    /// Lower a contiguous slice of instructions (a whole code object, or
    /// one chunk produced by the chunker) into `ctx`.
    pub fn lower_slice(&mut self, ctx: &mut EmissionContext, instructions: &[Instruction]) -> Result<()> {
        let mut i = 0usize;
        while i < instructions.len() {
            // Import idiom: LOAD_CONST(level); LOAD_CONST(fromlist); IMPORT_NAME; ...
            if let Some(detected) =
                import_rewrite::detect_with_aliases(instructions, i, self.code, &self.aliases)
            {
                self.emit_import(ctx, &detected.plan)?;
                i += detected.consumed;
                continue;
            }

            let instr = instructions[i];
            ctx.insert_label(instr.label);
            self.lower_one(ctx, instr)?;
            i += 1;
        }
        Ok(())
    }

    fn emit_import(&mut self, ctx: &mut EmissionContext, plan: &ImportPlan) -> Result<()> {
        match plan {
            ImportPlan::Plain { root_id, chain, push_leaf, store } => {
                for (i, seg_id) in chain.iter().enumerate() {
                    ctx.insert_line(&format!(
                        "if (!(__tmp_mod = __pypperoni_IMPL_import(f, {seg_id}))) {{"
                    ));
                    ctx.insert_line("    goto error;");
                    ctx.insert_line("}");
                    if i > 0 {
                        ctx.insert_line("Py_DECREF(__tmp_mod);");
                    }
                }
                let _ = root_id;
                ctx.insert_line(&format!("PUSH({});", if *push_leaf { "__tmp_mod" } else { "__tmp_mod" }));
                let _ = store;
            }
            ImportPlan::Star { module_id } => {
                ctx.insert_line(&format!(
                    "if (!(__tmp_mod = __pypperoni_IMPL_import(f, {module_id}))) {{ goto error; }}"
                ));
                ctx.insert_line("if (__pypperoni_IMPL_import_star(f, __tmp_mod) < 0) { Py_DECREF(__tmp_mod); goto error; }");
                ctx.insert_line("Py_DECREF(__tmp_mod);");
            }
            ImportPlan::FromNames { module_id, names } => {
                ctx.insert_line(&format!(
                    "if (!(__tmp_mod = __pypperoni_IMPL_import(f, {module_id}))) {{ goto error; }}"
                ));
                for name in names {
                    let name_lit = ctx.register_literal(name);
                    ctx.insert_line(&format!(
                        "if (!(__tmp_attr = __pypperoni_IMPL_import_from_or_module(f, __tmp_mod, {name_lit}))) {{ Py_DECREF(__tmp_mod); goto error; }}"
                    ));
                    ctx.insert_line("PUSH(__tmp_attr);");
                }
                ctx.insert_line("Py_DECREF(__tmp_mod);");
            }
        }
        Ok(())
    }

    fn lower_one(&mut self, ctx: &mut EmissionContext, instr: Instruction) -> Result<()> {
        let op = instr.opcode;
        let line = instr.source_line;

        if op == opcodes::NOP {
            return Ok(());
        }

        if let Some(prefix) = opcodes::family_prefix(op) {
            return self.lower_arith_family(ctx, instr, prefix);
        }

        match op {
            opcodes::POP_TOP => ctx.insert_line("__pypperoni_stack_pop_decref(f);"),
            opcodes::ROT_TWO => ctx.insert_line("{ PyObject *__t = SECOND(); SET_SECOND(TOP()); SET_TOP(__t); }"),
            opcodes::ROT_THREE => ctx.insert_line(
                "{ PyObject *__t = THIRD(); SET_THIRD(SECOND()); SET_SECOND(TOP()); SET_TOP(__t); }",
            ),
            opcodes::DUP_TOP => ctx.insert_line("{ PyObject *__t = TOP(); Py_INCREF(__t); PUSH(__t); }"),
            opcodes::DUP_TOP_TWO => ctx.insert_line(
                "{ PyObject *__a = TOP(), *__b = SECOND(); Py_INCREF(__a); Py_INCREF(__b); PUSH(__b); PUSH(__a); }",
            ),

            opcodes::LOAD_CONST => self.lower_load_const(ctx, instr),
            opcodes::LOAD_NAME => self.lower_name_load(ctx, instr, "load_name"),
            opcodes::LOAD_GLOBAL => self.lower_name_load(ctx, instr, "load_global"),
            opcodes::LOAD_ATTR => self.lower_name_load(ctx, instr, "load_attr"),
            opcodes::LOAD_BUILD_CLASS => {
                ctx.insert_line("if (!(__tmp = __pypperoni_IMPL_load_build_class(f))) { goto error; }");
                ctx.insert_line("PUSH(__tmp);");
            }
            opcodes::LOAD_CLASSDEREF => self.lower_deref_load(ctx, instr, true),
            opcodes::LOAD_DEREF => self.lower_deref_load(ctx, instr, false),
            opcodes::LOAD_CLOSURE => {
                let idx = instr.oparg;
                ctx.insert_line(&format!(
                    "__tmp = __pypperoni_IMPL_get_cell(f, {idx}); Py_INCREF(__tmp); PUSH(__tmp);"
                ));
            }
            opcodes::LOAD_FAST => {
                let idx = instr.oparg;
                ctx.insert_line(&format!(
                    "if (!(__tmp = f->f_localsplus[{idx}])) {{ __pypperoni_IMPL_unbound_local(f, {idx}); goto error; }}"
                ));
                ctx.insert_line("Py_INCREF(__tmp); PUSH(__tmp);");
            }

            opcodes::STORE_NAME => self.lower_name_store(ctx, instr, "store_name"),
            opcodes::STORE_GLOBAL => self.lower_name_store(ctx, instr, "store_global"),
            opcodes::STORE_ATTR => self.lower_name_store(ctx, instr, "store_attr"),
            opcodes::STORE_FAST => {
                let idx = instr.oparg;
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!(
                    "if (f->f_localsplus[{idx}]) Py_DECREF(f->f_localsplus[{idx}]);"
                ));
                ctx.insert_line(&format!("f->f_localsplus[{idx}] = __tmp;"));
            }
            opcodes::STORE_DEREF => {
                let idx = instr.oparg;
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!("__pypperoni_IMPL_cell_set(f, {idx}, __tmp);"));
            }
            opcodes::STORE_SUBSCR => {
                ctx.insert_line("__tmp3 = TOP(); __tmp2 = SECOND(); __tmp = THIRD(); STACKADJ(-3);");
                self.checked_call(ctx, line, "if (__pypperoni_IMPL_store_subscr(__tmp, __tmp2, __tmp3) < 0)");
                ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2); Py_DECREF(__tmp3);");
            }

            opcodes::DELETE_NAME => self.lower_delete(ctx, instr, "delete_name"),
            opcodes::DELETE_GLOBAL => self.lower_delete(ctx, instr, "delete_global"),
            opcodes::DELETE_ATTR => self.lower_delete(ctx, instr, "delete_attr"),
            opcodes::DELETE_FAST => {
                let idx = instr.oparg;
                ctx.insert_line(&format!(
                    "if (f->f_localsplus[{idx}]) {{ Py_DECREF(f->f_localsplus[{idx}]); f->f_localsplus[{idx}] = NULL; }}"
                ));
            }
            opcodes::DELETE_DEREF => {
                let idx = instr.oparg;
                ctx.insert_line(&format!("__pypperoni_IMPL_cell_clear(f, {idx});"));
            }
            opcodes::DELETE_SUBSCR => {
                ctx.insert_line("__tmp2 = TOP(); __tmp = SECOND(); STACKADJ(-2);");
                self.checked_call(ctx, line, "if (__pypperoni_IMPL_delete_subscr(__tmp, __tmp2) < 0)");
                ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2);");
            }

            opcodes::BUILD_TUPLE | opcodes::BUILD_LIST | opcodes::BUILD_SET => {
                let n = instr.oparg;
                let kind = match op {
                    opcodes::BUILD_TUPLE => "tuple",
                    opcodes::BUILD_LIST => "list",
                    _ => "set",
                };
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_build_{kind}(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{n}); PUSH(__tmp);"));
            }
            opcodes::BUILD_MAP => {
                let n = instr.oparg;
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_build_map(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{});", n.saturating_mul(2)));
                ctx.insert_line("PUSH(__tmp);");
            }
            opcodes::BUILD_CONST_KEY_MAP => {
                let n = instr.oparg;
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_build_const_key_map(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{});", n + 1));
                ctx.insert_line("PUSH(__tmp);");
            }
            opcodes::BUILD_STRING => {
                let n = instr.oparg;
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_build_string(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{n}); PUSH(__tmp);"));
            }
            opcodes::BUILD_SLICE => {
                let n = instr.oparg;
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_build_slice(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{n}); PUSH(__tmp);"));
            }
            opcodes::BUILD_TUPLE_UNPACK
            | opcodes::BUILD_TUPLE_UNPACK_WITH_CALL
            | opcodes::BUILD_LIST_UNPACK
            | opcodes::BUILD_SET_UNPACK
            | opcodes::BUILD_MAP_UNPACK
            | opcodes::BUILD_MAP_UNPACK_WITH_CALL => {
                let n = instr.oparg;
                let name = opcodes::opname(op).unwrap().to_lowercase();
                ctx.insert_line(&format!(
                    "if (!(__tmp = __pypperoni_IMPL_{name}(f, {n}))) {{ goto error; }}"
                ));
                ctx.insert_line(&format!("STACKADJ(-{n}); PUSH(__tmp);"));
            }
            opcodes::LIST_APPEND | opcodes::SET_ADD => {
                let depth = instr.oparg;
                let name = if op == opcodes::LIST_APPEND { "list_append" } else { "set_add" };
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_{name}(PEEK({depth}), __tmp) < 0) {{ Py_DECREF(__tmp); goto error; }}"
                ));
                ctx.insert_line("Py_DECREF(__tmp);");
            }
            opcodes::MAP_ADD => {
                let depth = instr.oparg;
                ctx.insert_line("__tmp2 = POP(); __tmp = POP();");
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_map_add(PEEK({depth}), __tmp, __tmp2) < 0) {{ Py_DECREF(__tmp); Py_DECREF(__tmp2); goto error; }}"
                ));
                ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2);");
            }

            opcodes::COMPARE_OP => {
                let cmp = instr.oparg;
                ctx.insert_line("__tmp2 = POP(); __tmp = TOP();");
                self.checked_call(
                    ctx,
                    line,
                    &format!("if (__pypperoni_IMPL_compare(__tmp, __tmp2, {cmp}, &__result) < 0)"),
                );
                ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2); SET_TOP(__result);");
            }

            opcodes::JUMP_FORWARD => {
                let target = instr.label + instr.oparg + 2;
                ctx.insert_line(&format!("goto label_{target};"));
            }
            opcodes::JUMP_ABSOLUTE | opcodes::CONTINUE_LOOP => {
                ctx.insert_line(&format!("goto label_{};", instr.oparg));
            }
            opcodes::POP_JUMP_IF_FALSE | opcodes::POP_JUMP_IF_TRUE => {
                let truthy = op == opcodes::POP_JUMP_IF_TRUE;
                ctx.insert_line("__tmp = POP();");
                self.checked_call(ctx, line, "if ((__cond = __pypperoni_IMPL_check_cond(__tmp)) < 0)");
                ctx.insert_line("Py_DECREF(__tmp);");
                ctx.insert_line(&format!(
                    "if (__cond {} 0) goto label_{};",
                    if truthy { "!=" } else { "==" },
                    instr.oparg
                ));
            }
            opcodes::JUMP_IF_FALSE_OR_POP | opcodes::JUMP_IF_TRUE_OR_POP => {
                let truthy = op == opcodes::JUMP_IF_TRUE_OR_POP;
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if ((__cond = __pypperoni_IMPL_check_cond(__tmp)) < 0)");
                ctx.insert_line(&format!(
                    "if (__cond {} 0) goto label_{};",
                    if truthy { "!=" } else { "==" },
                    instr.oparg
                ));
                ctx.insert_line("__pypperoni_stack_pop_decref(f);");
            }

            opcodes::GET_ITER | opcodes::GET_YIELD_FROM_ITER => {
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_get_iter(__tmp)))");
                ctx.insert_line("Py_DECREF(__tmp); SET_TOP(__result);");
            }
            opcodes::FOR_ITER => {
                let target = instr.label + instr.oparg + 2;
                ctx.insert_line("__tmp = __pypperoni_IMPL_iternext(TOP());");
                ctx.insert_line("if (!__tmp) {");
                ctx.insert_line("    if (PyErr_Occurred()) {");
                ctx.insert_line("        if (!PyErr_ExceptionMatches(PyExc_StopIteration)) { goto error; }");
                ctx.insert_line("        PyErr_Clear();");
                ctx.insert_line("    }");
                ctx.insert_line("    __pypperoni_stack_pop_decref(f);");
                ctx.insert_line(&format!("    goto label_{target};"));
                ctx.insert_line("}");
                ctx.insert_line("PUSH(__tmp);");
            }

            opcodes::CALL_FUNCTION | opcodes::CALL_FUNCTION_KW | opcodes::CALL_FUNCTION_EX => {
                self.lower_call(ctx, instr)?;
            }

            opcodes::MAKE_FUNCTION => self.lower_make_function(ctx, instr)?,

            opcodes::RETURN_VALUE => {
                ctx.insert_line("retval = POP();");
                ctx.insert_line("why = WHY_RETURN;");
                ctx.insert_line("goto fast_block_end;");
            }
            opcodes::YIELD_VALUE => {
                ctx.insert_line("retval = POP();");
                ctx.insert_yield(line, instr.label);
            }
            opcodes::YIELD_FROM => {
                ctx.insert_line("__tmp2 = POP(); __tmp = TOP();");
                ctx.insert_line("if (!(__result = __pypperoni_IMPL_yield_from(f, __tmp, __tmp2))) { Py_DECREF(__tmp2); goto error; }");
                ctx.insert_line("Py_DECREF(__tmp2);");
                ctx.insert_yield(line, instr.label);
            }

            opcodes::SETUP_LOOP => {
                let target = instr.label + instr.oparg + 2;
                self.block_stack.push(BlockEntry { kind: BlockKind::Loop, handler: target });
                ctx.insert_line(&format!(
                    "__pypperoni_block_setup(f, PYPPERONI_BLOCK_LOOP, {target}, STACK_LEVEL());"
                ));
            }
            opcodes::SETUP_EXCEPT => {
                let target = instr.label + instr.oparg + 2;
                self.block_stack.push(BlockEntry { kind: BlockKind::Except, handler: target });
                ctx.insert_line(&format!(
                    "__pypperoni_block_setup(f, PYPPERONI_BLOCK_EXCEPT, {target}, STACK_LEVEL());"
                ));
            }
            opcodes::SETUP_FINALLY => {
                let target = instr.label + instr.oparg + 2;
                self.block_stack.push(BlockEntry { kind: BlockKind::Finally, handler: target });
                ctx.insert_line(&format!(
                    "__pypperoni_block_setup(f, PYPPERONI_BLOCK_FINALLY, {target}, STACK_LEVEL());"
                ));
            }
            opcodes::SETUP_WITH | opcodes::SETUP_ASYNC_WITH => {
                let target = instr.label + instr.oparg + 2;
                self.block_stack.push(BlockEntry { kind: BlockKind::With, handler: target });
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_setup_with(f, __tmp)))");
                ctx.insert_line("SET_TOP(__result);");
                ctx.insert_line(&format!(
                    "__pypperoni_block_setup(f, PYPPERONI_BLOCK_FINALLY, {target}, STACK_LEVEL());"
                ));
            }
            opcodes::BEFORE_ASYNC_WITH => {
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_before_async_with(__tmp)))");
                ctx.insert_line("PUSH(__result);");
            }
            opcodes::WITH_CLEANUP_START => {
                ctx.insert_line("if (__pypperoni_IMPL_with_cleanup_start(f) < 0) goto error;");
            }
            opcodes::WITH_CLEANUP_FINISH => {
                ctx.insert_line("if (__pypperoni_IMPL_with_cleanup_finish(f) < 0) goto error;");
            }
            opcodes::POP_BLOCK => {
                self.block_stack.pop();
                ctx.insert_line("__pypperoni_block_pop(f);");
            }
            opcodes::POP_EXCEPT => {
                ctx.insert_line("__pypperoni_unwind_except_handler(f);");
            }
            opcodes::BREAK_LOOP => {
                ctx.insert_line("why = WHY_BREAK;");
                ctx.insert_line("goto fast_block_end;");
            }
            opcodes::RAISE_VARARGS => self.lower_raise(ctx, instr),
            opcodes::END_FINALLY => {
                ctx.insert_line("if (__pypperoni_IMPL_end_finally(f, &why, &retval) < 0) goto error;");
                ctx.insert_line("if (why != WHY_NOT) goto fast_block_end;");
            }

            opcodes::IMPORT_STAR => {
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line("if (__pypperoni_IMPL_import_star(f, __tmp) < 0) { Py_DECREF(__tmp); goto error; }");
                ctx.insert_line("Py_DECREF(__tmp);");
            }
            opcodes::IMPORT_FROM => self.lower_name_load(ctx, instr, "import_from"),
            opcodes::IMPORT_NAME => bail!(
                "IMPORT_NAME at {} in {} was not consumed by the import rewriter",
                instr.label,
                self.module_path
            ),

            opcodes::UNPACK_SEQUENCE => {
                let n = instr.oparg;
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_unpack_sequence(f, __tmp, {n}) < 0) {{ Py_DECREF(__tmp); goto error; }}"
                ));
                ctx.insert_line("Py_DECREF(__tmp);");
            }
            opcodes::UNPACK_EX => {
                let before = instr.oparg & 0xff;
                let after = (instr.oparg >> 8) & 0xff;
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_unpack_ex(f, __tmp, {before}, {after}) < 0) {{ Py_DECREF(__tmp); goto error; }}"
                ));
                ctx.insert_line("Py_DECREF(__tmp);");
            }

            opcodes::PRINT_EXPR => {
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line("if (__pypperoni_IMPL_print_expr(__tmp) < 0) { Py_DECREF(__tmp); goto error; }");
                ctx.insert_line("Py_DECREF(__tmp);");
            }
            opcodes::SETUP_ANNOTATIONS => {
                ctx.insert_line("if (__pypperoni_IMPL_setup_annotations(f) < 0) goto error;");
            }
            opcodes::STORE_ANNOTATION => self.lower_name_store(ctx, instr, "store_annotation"),
            opcodes::GET_AITER => {
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_get_aiter(__tmp)))");
                ctx.insert_line("Py_DECREF(__tmp); SET_TOP(__result);");
            }
            opcodes::GET_ANEXT => {
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_get_anext(__tmp)))");
                ctx.insert_line("PUSH(__result);");
            }
            opcodes::GET_AWAITABLE => {
                ctx.insert_line("__tmp = TOP();");
                self.checked_call(ctx, line, "if (!(__result = __pypperoni_IMPL_get_awaitable(__tmp)))");
                ctx.insert_line("Py_DECREF(__tmp); SET_TOP(__result);");
            }
            opcodes::FORMAT_VALUE => {
                let flags = instr.oparg;
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_format_value(f, {flags}) < 0) goto error;"
                ));
            }

            _ => bail!(
                "unknown opcode {} ({:?}) at label {} in {}",
                op,
                opcodes::opname(op),
                instr.label,
                self.module_path
            ),
        }

        Ok(())
    }

    fn lower_arith_family(&mut self, ctx: &mut EmissionContext, instr: Instruction, prefix: &str) -> Result<()> {
        let name = opcodes::opname(instr.opcode)
            .ok_or_else(|| anyhow!("unnamed opcode {}", instr.opcode))?
            .to_lowercase();
        if prefix == "UNARY_" {
            ctx.insert_line("__tmp = TOP();");
            self.checked_call(ctx, instr.source_line, &format!("if (!(__result = __pypperoni_IMPL_{name}(__tmp)))"));
            ctx.insert_line("Py_DECREF(__tmp); SET_TOP(__result);");
        } else {
            ctx.insert_line("__tmp2 = POP(); __tmp = TOP();");
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (!(__result = __pypperoni_IMPL_{name}(__tmp, __tmp2)))"),
            );
            ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2); SET_TOP(__result);");
        }
        Ok(())
    }

    /// Write `condition { goto <handler>; }`, choosing the nearest
    /// enclosing except/finally block if one is open, else the shared
    /// `error:` tail.
    fn checked_call(&mut self, ctx: &mut EmissionContext, line: u32, condition: &str) {
        let handler = self
            .block_stack
            .iter()
            .rev()
            .find(|b| matches!(b.kind, BlockKind::Except | BlockKind::Finally))
            .map(|b| b.handler);
        ctx.insert_line(&format!("{condition} {{"));
        ctx.insert_handle_error(line, handler);
        ctx.insert_line("}");
    }

    fn lower_load_const(&mut self, ctx: &mut EmissionContext, instr: Instruction) {
        let idx = instr.oparg as usize;
        if let Some(Constant::CodeRef(code_idx)) = self.code.consts.get(idx) {
            self.pending_code_ref = Some(*code_idx);
        }
        if let Some(value) = self.code.consts.get(idx).cloned() {
            let expr = ctx.register_const(value);
            ctx.insert_line(&format!("__tmp = {expr}; Py_INCREF(__tmp); PUSH(__tmp);"));
        }
    }

    fn lower_name_load(&mut self, ctx: &mut EmissionContext, instr: Instruction, helper: &str) {
        let is_attr = matches!(helper, "load_attr" | "import_from");
        let name = self.resolve_name(instr.oparg, is_attr);
        let name_lit = ctx.register_literal(&name);
        if matches!(helper, "load_attr" | "import_from") {
            ctx.insert_line("__tmp = POP();");
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (!(__result = __pypperoni_IMPL_{helper}(f, __tmp, {name_lit})))"),
            );
            ctx.insert_line("Py_DECREF(__tmp); PUSH(__result);");
        } else {
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (!(__result = __pypperoni_IMPL_{helper}(f, {name_lit})))"),
            );
            ctx.insert_line("PUSH(__result);");
        }
    }

    fn lower_name_store(&mut self, ctx: &mut EmissionContext, instr: Instruction, helper: &str) {
        let is_attr = helper == "store_attr";
        let name = self.resolve_name(instr.oparg, is_attr);
        let name_lit = ctx.register_literal(&name);
        if is_attr {
            ctx.insert_line("__tmp2 = POP(); __tmp = POP();");
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (__pypperoni_IMPL_{helper}(f, __tmp2, {name_lit}, __tmp) < 0)"),
            );
            ctx.insert_line("Py_DECREF(__tmp); Py_DECREF(__tmp2);");
        } else {
            ctx.insert_line("__tmp = POP();");
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (__pypperoni_IMPL_{helper}(f, {name_lit}, __tmp) < 0)"),
            );
            ctx.insert_line("Py_DECREF(__tmp);");
        }
    }

    fn lower_delete(&mut self, ctx: &mut EmissionContext, instr: Instruction, helper: &str) {
        let is_attr = helper == "delete_attr";
        let name = self.resolve_name(instr.oparg, is_attr);
        let name_lit = ctx.register_literal(&name);
        if is_attr {
            ctx.insert_line("__tmp = POP();");
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (__pypperoni_IMPL_{helper}(f, __tmp, {name_lit}) < 0)"),
            );
            ctx.insert_line("Py_DECREF(__tmp);");
        } else {
            self.checked_call(
                ctx,
                instr.source_line,
                &format!("if (__pypperoni_IMPL_{helper}(f, {name_lit}) < 0)"),
            );
        }
    }

    fn lower_deref_load(&mut self, ctx: &mut EmissionContext, instr: Instruction, classderef: bool) {
        let idx = instr.oparg;
        let helper = if classderef { "load_classderef" } else { "load_deref" };
        self.checked_call(
            ctx,
            instr.source_line,
            &format!("if (!(__result = __pypperoni_IMPL_{helper}(f, {idx})))"),
        );
        ctx.insert_line("PUSH(__result);");
    }

    fn lower_raise(&mut self, ctx: &mut EmissionContext, instr: Instruction) {
        match instr.oparg {
            0 => ctx.insert_line("__pypperoni_IMPL_do_raise(NULL, NULL);"),
            1 => {
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line("__pypperoni_IMPL_do_raise(__tmp, NULL);");
            }
            2 => {
                ctx.insert_line("__tmp2 = POP(); __tmp = POP();");
                ctx.insert_line("__pypperoni_IMPL_do_raise(__tmp, __tmp2);");
            }
            other => {
                ctx.insert_line(&format!("/* unsupported RAISE_VARARGS oparg {other} */"));
            }
        }
        ctx.insert_handle_error(instr.source_line, None);
    }

    fn lower_call(&mut self, ctx: &mut EmissionContext, instr: Instruction) -> Result<()> {
        let op = instr.opcode;
        match op {
            opcodes::CALL_FUNCTION => {
                let argc = instr.oparg;
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_call_function(f, {argc}, 0, &__result) < 0) goto error;"
                ));
                ctx.insert_line(&format!("STACKADJ(-{argc}); SET_TOP(__result);"));
            }
            opcodes::CALL_FUNCTION_KW => {
                let argc = instr.oparg;
                ctx.insert_line("__tmp = POP();");
                ctx.insert_line(&format!(
                    "if (__pypperoni_IMPL_call_function_kw(f, {argc}, __tmp, &__result) < 0) {{ Py_DECREF(__tmp); goto error; }}"
                ));
                ctx.insert_line("Py_DECREF(__tmp);");
                ctx.insert_line(&format!("STACKADJ(-{argc}); SET_TOP(__result);"));
            }
            opcodes::CALL_FUNCTION_EX => {
                let has_kwargs = instr.oparg & 0x01 != 0;
                ctx.insert_line(if has_kwargs {
                    "__tmp2 = POP(); __tmp = POP();"
                } else {
                    "__tmp2 = NULL; __tmp = POP();"
                });
                ctx.insert_line(
                    "if (__pypperoni_IMPL_call_function_ex(f, __tmp, __tmp2, &__result) < 0) { Py_DECREF(__tmp); Py_XDECREF(__tmp2); goto error; }",
                );
                ctx.insert_line("Py_DECREF(__tmp); Py_XDECREF(__tmp2);");
                ctx.insert_line("SET_TOP(__result);");
            }
            _ => unreachable!("lower_call called with non-call opcode"),
        }
        Ok(())
    }

    fn lower_make_function(&mut self, ctx: &mut EmissionContext, instr: Instruction) -> Result<()> {
        let code_idx = self
            .pending_code_ref
            .take()
            .ok_or_else(|| anyhow!("MAKE_FUNCTION at {} with no preceding code constant", instr.label))?;
        let flags = instr.oparg;
        let has_closure = flags & 0x08 != 0;
        let has_annotations = flags & 0x04 != 0;
        let has_kwdefaults = flags & 0x02 != 0;
        let has_defaults = flags & 0x01 != 0;

        if has_closure {
            ctx.insert_line("__closure = POP();");
        } else {
            ctx.insert_line("__closure = NULL;");
        }
        if has_annotations {
            ctx.insert_line("__annotations = POP();");
        } else {
            ctx.insert_line("__annotations = NULL;");
        }
        if has_kwdefaults {
            ctx.insert_line("__kwdefaults = POP();");
        } else {
            ctx.insert_line("__kwdefaults = NULL;");
        }
        if has_defaults {
            ctx.insert_line("__defaults = POP();");
        } else {
            ctx.insert_line("__defaults = NULL;");
        }
        ctx.insert_line("__qualname = POP();");
        ctx.insert_line("__codeobj_const = POP();");

        ctx.insert_line(&format!(
            "if (!(__result = __pypperoni_IMPL_make_func(f, __codeobj_const, __qualname, __defaults, __kwdefaults, __annotations, __closure, (PyObject* (*)(PypperoniFrame*))&{}))) {{",
            self.nested_symbol(code_idx)
        ));
        ctx.insert_line("    Py_DECREF(__qualname); Py_DECREF(__codeobj_const);");
        ctx.insert_line("    Py_XDECREF(__defaults); Py_XDECREF(__kwdefaults); Py_XDECREF(__annotations); Py_XDECREF(__closure);");
        ctx.insert_handle_error(instr.source_line, None);
        ctx.insert_line("}");
        ctx.insert_line("Py_DECREF(__qualname); Py_DECREF(__codeobj_const);");
        ctx.insert_line("Py_XDECREF(__defaults); Py_XDECREF(__kwdefaults); Py_XDECREF(__annotations); Py_XDECREF(__closure);");
        ctx.insert_line("PUSH(__result);");
        Ok(())
    }

    /// The deterministic C symbol name for a nested code object: the
    /// enclosing module path with `.`/`<`/`>` stripped, joined to the
    /// nested constant's index.
    fn nested_symbol(&self, code_idx: u32) -> String {
        let clean: String = self
            .module_path
            .chars()
            .map(|c| if c == '.' || c == '<' || c == '>' { '_' } else { c })
            .collect();
        format!("{clean}_nested_{code_idx}")
    }

    fn resolve_name(&self, idx: u32, _is_attr: bool) -> String {
        self.code
            .names
            .get(idx as usize)
            .cloned()
            .unwrap_or_else(|| format!("<name#{idx}>"))
    }
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
    fn test_load_const_return() {
        let code = code_with(
            vec![opcodes::LOAD_CONST, 0, opcodes::RETURN_VALUE, 0],
            vec![Constant::Int(7)],
            vec![],
        );
        let instrs = code.decode_instructions();
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::new(&code, "m");
        lowerer.lower_slice(&mut ctx, &instrs).unwrap();
        assert!(ctx.body().contains("PUSH(__tmp)"));
        assert!(ctx.body().contains("WHY_RETURN"));
        assert_eq!(ctx.consts().len(), 1);
    }

    #[test]
    fn test_unknown_opcode_errors() {
        let code = code_with(vec![200, 0], vec![], vec![]);
        let instrs = code.decode_instructions();
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::new(&code, "m");
        let err = lowerer.lower_slice(&mut ctx, &instrs).unwrap_err();
        assert!(err.to_string().contains("unknown opcode"));
    }

    #[test]
    fn test_binary_add_uses_family_helper() {
        let code = code_with(
            vec![opcodes::BINARY_ADD, 0, opcodes::RETURN_VALUE, 0],
            vec![],
            vec![],
        );
        let instrs = code.decode_instructions();
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::new(&code, "m");
        lowerer.lower_slice(&mut ctx, &instrs).unwrap();
        assert!(ctx.body().contains("__pypperoni_IMPL_binary_add"));
    }

    #[test]
    fn test_labels_unique_per_instruction() {
        let code = code_with(
            vec![
                opcodes::LOAD_FAST, 0,
                opcodes::POP_JUMP_IF_FALSE, 6,
                opcodes::JUMP_FORWARD, 0,
                opcodes::LOAD_FAST, 0,
                opcodes::RETURN_VALUE, 0,
            ],
            vec![],
            vec![],
        );
        let instrs = code.decode_instructions();
        let mut ctx = EmissionContext::new();
        let mut lowerer = Lowerer::new(&code, "m");
        lowerer.lower_slice(&mut ctx, &instrs).unwrap();
        for instr in &instrs {
            assert_eq!(
                ctx.body().matches(&format!("label_{}:", instr.label)).count(),
                1
            );
        }
    }
}


