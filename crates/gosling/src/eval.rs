//! A direct tree walker for literal expression statements.
//!
//! The REPL tries this before the compile-and-run pipeline; the two must
//! agree on value semantics for everything the walker handles.

use std::rc::Rc;

use gosling_compiler::Program;
use gosling_object::Value;
use gosling_parser::{BasicLit, Expr, LitKind, Stmt};

/// Evaluate a program consisting of a single literal expression statement.
/// Returns `None` for anything the walker does not cover, leaving the
/// pipeline to handle it.
pub fn eval_program(prog: &Program) -> Option<Value> {
    if !prog.functions.is_empty() || prog.statements.len() != 1 {
        return None;
    }
    eval_stmt(&prog.statements[0])
}

fn eval_stmt(stmt: &Stmt) -> Option<Value> {
    match stmt {
        Stmt::Expr(expr) => eval_expr(expr),
        _ => None,
    }
}

fn eval_expr(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::BasicLit(lit) => eval_basic_lit(lit),
        Expr::Paren(paren) => eval_expr(&paren.x),
        _ => None,
    }
}

fn eval_basic_lit(lit: &BasicLit) -> Option<Value> {
    match lit.kind {
        LitKind::Int => gosling_lexer::parse_int(&lit.value).ok().map(Value::Int),
        LitKind::Float => gosling_lexer::parse_float(&lit.value)
            .ok()
            .map(Value::Float64),
        LitKind::String => Some(Value::Str(Rc::from(gosling_lexer::parse_string(
            &lit.value,
        )))),
        LitKind::Char => gosling_lexer::parse_char(&lit.value).map(Value::Uint8),
    }
}
