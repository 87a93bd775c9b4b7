//! Tail position analysis.
//!
//! An application is a tail call when its value is the value of the
//! enclosing lambda: the last expression of a body, either branch of an `if`
//! in tail position, or the last expression of a `begin`, `and` or `or` in
//! tail position.
//! Special forms and primitives never become tail calls themselves.

use crate::compiler::ast::*;

pub fn analyse_tail_calls(ast: &mut Ast) {
    let mut tails = Vec::new();
    for lambda in ast.lambdas() {
        if let Some(last) = ast.lambda(lambda).and_then(|l| l.body.last()) {
            mark(ast, last, &mut tails);
        }
    }
    ast.tail_calls = tails.into_iter().collect();
}

fn mark(ast: &Ast, child: &Child, tails: &mut Vec<Handle>) {
    let Some(handle) = child.as_node() else { return };
    let Some(app) = ast.application(handle) else { return };
    if app.quote != QuoteKind::None {
        return;
    }
    match app.children.first() {
        Some(Child::Keyword(k)) if k == "if" => {
            for branch in app.children.iter().skip(2).take(2) {
                mark(ast, branch, tails);
            }
        }
        Some(Child::Keyword(k)) if k == "begin" || k == "and" || k == "or" => {
            if let Some(last) = app.children.iter().skip(1).last() {
                mark(ast, last, tails);
            }
        }
        Some(Child::Keyword(_)) | None => {}
        Some(_) => tails.push(handle),
    }
}
