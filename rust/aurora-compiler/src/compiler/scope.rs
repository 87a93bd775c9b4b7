//! Lexical scope analysis.
//!
//! Two passes over the AST. The first builds one [`Scope`] per lambda from
//! its parameters and the `define`s directly inside it. The second renames
//! every variable occurrence that resolves to a scope to the module-unique
//! name `<owner>.<name>` (for example `&3.x`) and records the mapping in
//! [`Ast::variables`]. Names that resolve nowhere are left as written.

use crate::compiler::ast::*;
use crate::compiler::tokens::Span;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("dangling node handle {0}")]
    InvalidHandle(Handle),
    #[error("define target must be a variable (at {span})")]
    DefineTarget { span: Span },
}

/// Build scopes and rename variables. Running it twice is a no-op.
pub fn analyse_scopes(ast: &mut Ast) -> Result<(), AnalysisError> {
    if ast.analysed {
        return Ok(());
    }
    build_scopes(ast)?;
    rename_variables(ast)?;
    Ok(())
}

/// The lambda whose scope owns bindings made by `handle`'s parent chain.
fn scope_owner(ast: &Ast, handle: Handle) -> Option<Handle> {
    ast.get(handle)?.parent().map(|p| ast.enclosing_lambda(p))
}

fn build_scopes(ast: &mut Ast) -> Result<(), AnalysisError> {
    ast.scopes.clear();
    for lambda in ast.lambdas() {
        let node = ast.lambda(lambda).ok_or(AnalysisError::InvalidHandle(lambda))?;
        let mut scope = Scope { parent: scope_owner(ast, lambda), ..Scope::default() };
        for param in &node.parameters {
            scope.bind(param);
        }
        ast.scopes.insert(lambda, scope);
    }

    let lambdas = ast.lambdas();
    for lambda in &lambdas {
        if let Some(parent) = ast.scopes.get(lambda).and_then(|s| s.parent) {
            if let Some(scope) = ast.scopes.get_mut(&parent) {
                scope.children.push(*lambda);
            }
        }
    }

    // `define` binds in the lambda that encloses the define form.
    let mut defines = Vec::new();
    for handle in ast.handles() {
        let Some(app) = ast.application(handle) else { continue };
        if app.quote != QuoteKind::None || !app.children.first().is_some_and(|c| c.is_keyword("define")) {
            continue;
        }
        match app.children.get(1) {
            Some(Child::Variable(name)) => defines.push((ast.enclosing_lambda(handle), name.clone())),
            _ => {
                let span = ast.span_of(handle).unwrap_or_else(Span::dummy);
                return Err(AnalysisError::DefineTarget { span });
            }
        }
    }
    for (owner, name) in defines {
        if let Some(scope) = ast.scopes.get_mut(&owner) {
            scope.bind(&name);
        }
    }
    Ok(())
}

/// Walk outward from `from` to the first scope binding `name`.
fn resolve(ast: &Ast, from: Handle, name: &str) -> Option<Handle> {
    let mut cursor = Some(from);
    while let Some(h) = cursor {
        let scope = ast.scopes.get(&h)?;
        if scope.binds(name) {
            return Some(h);
        }
        cursor = scope.parent;
    }
    None
}

fn rename_variables(ast: &mut Ast) -> Result<(), AnalysisError> {
    let mut variables = std::mem::take(&mut ast.variables);
    let handles: Vec<Handle> = ast.handles().collect();
    for handle in handles {
        let owner = ast.enclosing_lambda(handle);
        let quoted = is_quoted(ast, handle);
        let renamed = |name: &str, variables: &mut std::collections::BTreeMap<String, VariableInfo>| {
            let bound_in = resolve(ast, owner, name)?;
            let new_name = format!("{}.{}", bound_in, name);
            variables.insert(new_name.clone(), VariableInfo { owner: bound_in, original: name.to_string() });
            Some(new_name)
        };

        let mut new_params = None;
        let mut new_children: Vec<(usize, String)> = Vec::new();
        match ast.get(handle).ok_or(AnalysisError::InvalidHandle(handle))? {
            Node::Lambda(l) => {
                new_params = Some(
                    l.parameters
                        .iter()
                        .map(|p| renamed(p, &mut variables).unwrap_or_else(|| p.clone()))
                        .collect::<Vec<_>>(),
                );
                for (i, child) in l.body.iter().enumerate() {
                    if let Some(name) = child.as_variable().and_then(|v| renamed(v, &mut variables)) {
                        new_children.push((i, name));
                    }
                }
            }
            Node::Application(a) if !quoted => {
                for (i, child) in a.children.iter().enumerate() {
                    if let Some(name) = child.as_variable().and_then(|v| renamed(v, &mut variables)) {
                        new_children.push((i, name));
                    }
                }
            }
            _ => {}
        }

        match ast.get_mut(handle) {
            Some(Node::Lambda(l)) => {
                if let Some(params) = new_params {
                    l.parameters = params;
                }
                for (i, name) in new_children {
                    l.body[i] = Child::Variable(name);
                }
            }
            Some(Node::Application(a)) => {
                for (i, name) in new_children {
                    a.children[i] = Child::Variable(name);
                }
            }
            _ => {}
        }
    }
    ast.variables = variables;
    ast.analysed = true;
    Ok(())
}

/// True for quoted data that is not inside an unquote.
fn is_quoted(ast: &Ast, handle: Handle) -> bool {
    let mut cursor = Some(handle);
    while let Some(h) = cursor {
        match ast.get(h) {
            Some(Node::Application(a)) => match a.quote {
                QuoteKind::Unquote => return false,
                QuoteKind::Quote | QuoteKind::Quasiquote => return true,
                QuoteKind::None => cursor = a.parent,
            },
            _ => return false,
        }
    }
    false
}
