// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The per-function stateful buffer that opcode lowering rules write into. */

use crate::constants::Constant;
use std::collections::BTreeSet;
use std::fmt::Write as _;

/// One registered local variable declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decl {
    pub name: String,
    pub c_type: String,
    pub default: Option<String>,
    pub needs_decref: bool,
}

/// Accumulates C source text, declarations, constants, and yield labels for
/// a single emitted function (one un-chunked code object, or one chunk of a
/// split code object).
pub struct EmissionContext {
    indent: usize,
    body: String,
    decl_names: BTreeSet<String>,
    decls: Vec<Decl>,
    consts: Vec<Constant>,
    literals: Vec<String>,
    labels_emitted: BTreeSet<u32>,
    yield_labels: Vec<u32>,
    /// Source line most recently written via `insert_handle_error`, used to
    /// avoid redundant `f->f_lineno = N;` updates.
    last_error_line: Option<u32>,
}

impl EmissionContext {
    pub fn new() -> Self {
        let mut ctx = EmissionContext {
            indent: 1,
            body: String::new(),
            decl_names: BTreeSet::new(),
            decls: Vec::new(),
            consts: Vec::new(),
            literals: Vec::new(),
            labels_emitted: BTreeSet::new(),
            yield_labels: Vec::new(),
            last_error_line: None,
        };
        // Every function body references these two through the why-flag
        // control-flow model and the shared tail rendered by `render_tail`.
        ctx.add_decl("why", "int", Some("WHY_NOT"), false);
        ctx.add_decl("retval", "PyObject*", Some("NULL"), false);
        ctx
    }

    pub fn begin_block(&mut self) {
        self.insert_raw("{");
        self.indent += 1;
    }

    pub fn end_block(&mut self) {
        self.indent = self.indent.saturating_sub(1);
        self.insert_raw("}");
    }

    /// Write one indented line of C source to the body buffer.
    pub fn insert_line(&mut self, text: &str) {
        self.insert_raw(text);
    }

    fn insert_raw(&mut self, text: &str) {
        for _ in 0..(self.indent * 4) {
            self.body.push(' ');
        }
        self.body.push_str(text);
        self.body.push('\n');
    }

    /// Emit `label_N:`. Idempotent: re-inserting the same label is a no-op,
    /// since EXTENDED_ARG folding can cause the same label to be visited by
    /// more than one lowering pass in a chunked trampoline context.
    pub fn insert_label(&mut self, label: u32) {
        if self.labels_emitted.insert(label) {
            let prev_indent = self.indent;
            self.indent = self.indent.saturating_sub(1).max(0);
            self.insert_raw(&format!("label_{label}:"));
            self.indent = prev_indent;
        }
    }

    pub fn has_label(&self, label: u32) -> bool {
        self.labels_emitted.contains(&label)
    }

    /// Register a local variable declaration. Repeated registrations of the
    /// same name with the same type are allowed; first registration wins
    /// for ordering.
    pub fn add_decl(&mut self, name: &str, c_type: &str, default: Option<&str>, needs_decref: bool) {
        if self.decl_names.insert(name.to_string()) {
            self.decls.push(Decl {
                name: name.to_string(),
                c_type: c_type.to_string(),
                default: default.map(|s| s.to_string()),
                needs_decref,
            });
        }
    }

    /// Idempotent by name: registering the same name twice is a no-op after
    /// the first call, regardless of type/default arguments passed later.
    pub fn add_decl_once(&mut self, name: &str, c_type: &str, default: Option<&str>, needs_decref: bool) {
        if !self.decl_names.contains(name) {
            self.add_decl(name, c_type, default, needs_decref);
        }
    }

    pub fn declarations(&self) -> &[Decl] {
        &self.decls
    }

    /// Register a constant value and return a C expression evaluating to a
    /// borrowed reference to it.
    pub fn register_const(&mut self, value: Constant) -> String {
        if matches!(value, Constant::None) {
            return "Py_None".to_string();
        }
        let idx = self.consts.len();
        self.consts.push(value);
        format!("__pypperoni_consts[{idx}]")
    }

    /// Register a constant string and return a C expression evaluating to a
    /// `const char*` view of it, distinct from `register_const` since
    /// literal references do not need a borrowed-object wrapper.
    pub fn register_literal(&mut self, value: &str) -> String {
        let idx = self.literals.len();
        self.literals.push(value.to_string());
        format!("__pypperoni_literal_{idx}")
    }

    pub fn consts(&self) -> &[Constant] {
        &self.consts
    }

    pub fn literals(&self) -> &[String] {
        &self.literals
    }

    /// Emit a line-number update followed by a jump to either the nearest
    /// enclosing error handler (`label`, when inside a try block) or the
    /// shared `error:` tail.
    pub fn insert_handle_error(&mut self, line: u32, label: Option<u32>) {
        if self.last_error_line != Some(line) {
            self.insert_line(&format!("f->f_lineno = {line};"));
            self.last_error_line = Some(line);
        }
        match label {
            Some(l) => self.insert_line(&format!("goto label_{l};")),
            None => self.insert_line("goto error;"),
        }
    }

    /// Emit a generator/coroutine suspension point: save retval, update
    /// `f_lasti`, return, and record `label` for the prologue's resumption
    /// dispatch.
    pub fn insert_yield(&mut self, line: u32, label: u32) {
        self.yield_labels.push(label);
        self.insert_line(&format!("f->f_lineno = {line};"));
        self.insert_line(&format!("f->f_lasti = {label};"));
        self.insert_line("f->f_why = WHY_YIELD;");
        self.insert_line("return retval;");
    }

    pub fn yield_labels(&self) -> &[u32] {
        &self.yield_labels
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Render the shared function epilogue every emitted function falls
    /// through to: the normal exit, the `error:` entry point every
    /// `insert_handle_error` without a handler label jumps to, the
    /// `fast_block_end:` block-unwind loop that RETURN_VALUE/BREAK_LOOP/
    /// END_FINALLY jump to directly, and the final `end:` cleanup-and-return.
    pub fn render_tail(&self) -> String {
        let mut out = String::new();
        out.push_str("    goto end;\n");
        out.push_str("error:\n");
        out.push_str("    why = WHY_EXCEPTION;\n");
        out.push_str("    retval = NULL;\n");
        out.push_str("fast_block_end:\n");
        out.push_str("    while (why != WHY_NOT && __pypperoni_block_depth(f) > 0) {\n");
        out.push_str("        PyTryBlock *b = __pypperoni_block_pop(f);\n");
        out.push_str("        if (b->b_type == PYPPERONI_BLOCK_EXCEPT_HANDLER) {\n");
        out.push_str("            __pypperoni_unwind_except_handler(f);\n");
        out.push_str("            continue;\n");
        out.push_str("        }\n");
        out.push_str("        __pypperoni_unwind_block(f, b);\n");
        out.push_str("        if (b->b_type == PYPPERONI_BLOCK_LOOP && why == WHY_BREAK) {\n");
        out.push_str("            why = WHY_NOT;\n");
        out.push_str("            JUMP_TO_ADDR(b->b_handler);\n");
        out.push_str("        }\n");
        out.push_str("        if (why == WHY_EXCEPTION && (b->b_type == PYPPERONI_BLOCK_EXCEPT || b->b_type == PYPPERONI_BLOCK_FINALLY)) {\n");
        out.push_str("            PyObject *exc, *val, *tb;\n");
        out.push_str("            PyErr_Fetch(&exc, &val, &tb);\n");
        out.push_str("            PyErr_NormalizeException(&exc, &val, &tb);\n");
        out.push_str("            PUSH(tb ? tb : Py_None);\n");
        out.push_str("            PUSH(val ? val : Py_None);\n");
        out.push_str("            PUSH(exc ? exc : Py_None);\n");
        out.push_str("            __pypperoni_block_setup(f, PYPPERONI_BLOCK_EXCEPT_HANDLER, 0, STACK_LEVEL());\n");
        out.push_str("            why = WHY_NOT;\n");
        out.push_str("            JUMP_TO_ADDR(b->b_handler);\n");
        out.push_str("        }\n");
        out.push_str("        if ((why == WHY_RETURN || why == WHY_CONTINUE) && b->b_type == PYPPERONI_BLOCK_FINALLY) {\n");
        out.push_str("            PUSH(retval);\n");
        out.push_str("            PUSH(PyLong_FromLong((long)why));\n");
        out.push_str("            why = WHY_NOT;\n");
        out.push_str("            JUMP_TO_ADDR(b->b_handler);\n");
        out.push_str("        }\n");
        out.push_str("    }\n");
        out.push_str("end:\n");
        for decl in &self.decls {
            if decl.needs_decref {
                out.push_str(&format!("    Py_XDECREF({});\n", decl.name));
            }
        }
        out.push_str("    f->f_why = why;\n");
        out.push_str("    f->f_stacktop = NULL;\n");
        out.push_str("    return retval;\n");
        out
    }

    /// Render the declaration block as C source, one `add_decl` per line.
    pub fn render_declarations(&self) -> String {
        let mut out = String::new();
        for decl in &self.decls {
            match &decl.default {
                Some(default) => {
                    let _ = writeln!(out, "    {} {} = {};", decl.c_type, decl.name, default);
                }
                None => {
                    let _ = writeln!(out, "    {} {};", decl.c_type, decl.name);
                }
            }
        }
        out
    }
}

impl Default for EmissionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_idempotent() {
        let mut ctx = EmissionContext::new();
        ctx.insert_label(10);
        ctx.insert_label(10);
        assert_eq!(ctx.body().matches("label_10:").count(), 1);
    }

    #[test]
    fn test_decl_once_idempotent() {
        let mut ctx = EmissionContext::new();
        let before = ctx.declarations().len();
        ctx.add_decl_once("tmp", "PyObject*", Some("NULL"), true);
        ctx.add_decl_once("tmp", "PyObject*", Some("something_else"), false);
        assert_eq!(ctx.declarations().len(), before + 1);
        let tmp = ctx.declarations().iter().find(|d| d.name == "tmp").unwrap();
        assert_eq!(tmp.default.as_deref(), Some("NULL"));
    }

    #[test]
    fn test_why_and_retval_predeclared() {
        let ctx = EmissionContext::new();
        let names: Vec<&str> = ctx.declarations().iter().map(|d| d.name.as_str()).collect();
        assert!(names.contains(&"why"));
        assert!(names.contains(&"retval"));
    }

    #[test]
    fn test_render_tail_contains_labels() {
        let ctx = EmissionContext::new();
        let tail = ctx.render_tail();
        assert!(tail.contains("error:"));
        assert!(tail.contains("fast_block_end:"));
        assert!(tail.contains("end:"));
        assert!(tail.contains("return retval;"));
    }

    #[test]
    fn test_register_const_indices_dense() {
        let mut ctx = EmissionContext::new();
        let a = ctx.register_const(Constant::Int(1));
        let b = ctx.register_const(Constant::Int(2));
        assert_eq!(a, "__pypperoni_consts[0]");
        assert_eq!(b, "__pypperoni_consts[1]");
        assert_eq!(ctx.consts().len(), 2);
    }

    #[test]
    fn test_none_not_registered() {
        let mut ctx = EmissionContext::new();
        let expr = ctx.register_const(Constant::None);
        assert_eq!(expr, "Py_None");
        assert!(ctx.consts().is_empty());
    }

    #[test]
    fn test_yield_label_recorded() {
        let mut ctx = EmissionContext::new();
        ctx.insert_yield(5, 42);
        assert_eq!(ctx.yield_labels(), &[42]);
    }
}


