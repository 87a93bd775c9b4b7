//! Lower an analysed AST to AIL.
//!
//! Every lambda becomes a labelled block after a two-instruction prologue
//! (`call @&0`, `halt`). Expressions follow a strict value discipline: each
//! value expression leaves exactly one value on the operand stack, while
//! statement-like forms (`define`, `set!`, `display`, `newline`, `fork`,
//! `native`, `import`) leave nothing. A body pops every non-final value and
//! pushes `#f` after a final statement.
//!
//! `if` places the true branch at the jump target: `iftrue @_ifN`, then the
//! false branch, then the true branch after the label.

use crate::compiler::ail::*;
use crate::compiler::ast::*;
use crate::compiler::tokens::Span;
use std::collections::BTreeMap;
use thiserror::Error;

fn location(span: &Option<Span>) -> String {
    span.map(|s| format!(" at {}", s)).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum LowerError {
    #[error("AST must go through scope and tail-call analysis before lowering")]
    NotAnalysed,
    #[error("malformed define{}: expected (define <variable> <expr>)", location(.span))]
    MalformedDefine { span: Option<Span> },
    #[error("malformed set!{}: expected (set! <variable> <expr>)", location(.span))]
    MalformedSet { span: Option<Span> },
    #[error("malformed if{}: expected (if <test> <then> [<else>])", location(.span))]
    MalformedIf { span: Option<Span> },
    #[error("malformed call/cc{}: the argument must be a lambda or a variable", location(.span))]
    MalformedCallCc { span: Option<Span> },
    #[error("malformed fork{}: expected a quoted list or a module path", location(.span))]
    MalformedFork { span: Option<Span> },
    #[error("{what} is not callable{}", location(.span))]
    NotCallable { what: String, span: Option<Span> },
    #[error("{form} expects {expected} argument(s), got {got}{}", location(.span))]
    Arity { form: String, expected: String, got: usize, span: Option<Span> },
    #[error("unquote outside of quasiquote{}", location(.span))]
    UnquoteOutsideQuasiquote { span: Option<Span> },
    #[error("empty application{}", location(.span))]
    EmptyApplication { span: Option<Span> },
    #[error("keyword '{keyword}' cannot be used here{}", location(.span))]
    UnexpectedKeyword { keyword: String, span: Option<Span> },
}

/// Lower `ast` to a program. The AST must already be analysed.
pub fn lower(ast: &Ast) -> Result<Program, LowerError> {
    Compiler::new(ast).run()
}

/// Per-compile lowering state. Label numbering starts from zero for every
/// compiler, so equal input produces identical output.
pub struct Compiler<'a> {
    ast: &'a Ast,
    code: Vec<Instruction>,
    statics: BTreeMap<Handle, StaticObject>,
    label_counter: usize,
    next_static: usize,
}

impl<'a> Compiler<'a> {
    pub fn new(ast: &'a Ast) -> Self {
        Self {
            ast,
            code: Vec::new(),
            statics: BTreeMap::new(),
            label_counter: 0,
            next_static: ast.len(),
        }
    }

    pub fn run(mut self) -> Result<Program, LowerError> {
        let ast = self.ast;
        if !ast.is_analysed() {
            return Err(LowerError::NotAnalysed);
        }
        let top = ast.top();
        self.emit(Instruction::with(Opcode::Call, Argument::Label(top.label())));
        self.emit(Instruction::op(Opcode::Halt));
        for lambda in ast.lambdas() {
            self.lambda_block(lambda)?;
        }

        let top_level = ast
            .variables
            .iter()
            .filter(|(_, info)| info.owner == top)
            .map(|(renamed, info)| (renamed.clone(), info.original.clone()))
            .collect();
        let enclosing = ast
            .scopes
            .iter()
            .filter_map(|(h, scope)| scope.parent.map(|p| (h.label(), p.label())))
            .collect();

        Ok(Program {
            instructions: self.code,
            statics: self.statics,
            top_level,
            enclosing,
            natives: ast.natives.clone(),
            source_hash: String::new(),
        })
    }

    fn emit(&mut self, inst: Instruction) {
        self.code.push(inst);
    }

    fn emit_with(&mut self, opcode: Opcode, argument: Argument) {
        self.code.push(Instruction::with(opcode, argument));
    }

    fn next_label(&mut self) -> usize {
        let n = self.label_counter;
        self.label_counter += 1;
        n
    }

    fn span(&self, handle: Handle) -> Option<Span> {
        self.ast.span_of(handle)
    }

    // ── Lambdas and bodies ──

    fn lambda_block(&mut self, handle: Handle) -> Result<(), LowerError> {
        let ast = self.ast;
        let Some(lambda) = ast.lambda(handle) else { return Ok(()) };
        let originals: Vec<&str> = lambda.parameters.iter().map(|p| ast.original_name(p)).collect();
        self.emit(Instruction::comment(format!(" lambda {} ({})", handle, originals.join(" "))));
        self.emit(Instruction::label(handle.label()));
        for param in lambda.parameters.iter().rev() {
            self.emit_with(Opcode::Store, Argument::Variable(param.clone()));
        }
        self.body(&lambda.body)?;
        self.emit(Instruction::op(Opcode::Return));
        Ok(())
    }

    /// Compile a sequence so that it leaves exactly one value.
    fn body(&mut self, children: &[Child]) -> Result<(), LowerError> {
        let Some(last) = children.len().checked_sub(1) else {
            self.emit_with(Opcode::Push, Argument::Boolean(false));
            return Ok(());
        };
        for (i, child) in children.iter().enumerate() {
            if i != last && self.is_pure_literal(child) {
                continue;
            }
            let produced = self.expr(child)?;
            if i != last && produced {
                self.emit(Instruction::op(Opcode::Pop));
            }
            if i == last && !produced {
                self.emit_with(Opcode::Push, Argument::Boolean(false));
            }
        }
        Ok(())
    }

    fn is_pure_literal(&self, child: &Child) -> bool {
        match child {
            Child::Number(_) | Child::Boolean(_) | Child::Symbol(_) | Child::Keyword(_) => true,
            Child::Variable(_) => false,
            Child::Node(h) => match self.ast.get(*h) {
                Some(Node::Str(_)) => true,
                Some(Node::Application(a)) => a.quote == QuoteKind::Quote,
                _ => false,
            },
        }
    }

    // ── Expressions ──

    /// Compile an expression that must leave one value.
    fn value(&mut self, child: &Child) -> Result<(), LowerError> {
        if !self.expr(child)? {
            self.emit_with(Opcode::Push, Argument::Boolean(false));
        }
        Ok(())
    }

    /// Compile an expression; returns whether it left a value.
    fn expr(&mut self, child: &Child) -> Result<bool, LowerError> {
        match child {
            Child::Number(n) => self.emit_with(Opcode::Push, Argument::Number(*n)),
            Child::Boolean(b) => self.emit_with(Opcode::Push, Argument::Boolean(*b)),
            Child::Symbol(s) => self.emit_with(Opcode::Push, Argument::Symbol(s.clone())),
            Child::Keyword(k) => {
                if Opcode::for_primitive(k).is_none() {
                    return Err(LowerError::UnexpectedKeyword { keyword: k.clone(), span: None });
                }
                self.emit_with(Opcode::Push, Argument::Keyword(k.clone()));
            }
            Child::Variable(v) => self.emit_with(Opcode::Load, Argument::Variable(v.clone())),
            Child::Node(h) => return self.node(*h),
        }
        Ok(true)
    }

    fn node(&mut self, handle: Handle) -> Result<bool, LowerError> {
        let ast = self.ast;
        match ast.get(handle) {
            Some(Node::Str(s)) => {
                self.statics.insert(handle, StaticObject::Str(s.content.clone()));
                self.emit_with(Opcode::Push, Argument::Handle(handle));
            }
            Some(Node::Lambda(_)) => self.emit_with(Opcode::LoadClosure, Argument::Label(handle.label())),
            Some(Node::Application(app)) => match app.quote {
                QuoteKind::Quote => {
                    self.static_list(handle)?;
                    self.emit_with(Opcode::Push, Argument::Handle(handle));
                }
                QuoteKind::Quasiquote => self.quasiquote(handle)?,
                QuoteKind::Unquote => {
                    return Err(LowerError::UnquoteOutsideQuasiquote { span: self.span(handle) })
                }
                QuoteKind::None => return self.application(handle, &app.children),
            },
            None => return Err(LowerError::EmptyApplication { span: None }),
        }
        Ok(true)
    }

    fn call_opcode(&self, handle: Handle) -> Opcode {
        if self.ast.is_tail_call(handle) { Opcode::TailCall } else { Opcode::Call }
    }

    fn application(&mut self, handle: Handle, children: &[Child]) -> Result<bool, LowerError> {
        let ast = self.ast;
        let Some((head, args)) = children.split_first() else {
            return Err(LowerError::EmptyApplication { span: self.span(handle) });
        };
        let target = match head {
            Child::Keyword(k) => return self.form(handle, k, args),
            Child::Variable(v) => Argument::Variable(v.clone()),
            Child::Node(op) => match ast.get(*op) {
                Some(Node::Lambda(_)) => Argument::Label(op.label()),
                Some(Node::Application(a)) if a.quote == QuoteKind::None => {
                    self.eta_expand(handle, children)?;
                    return Ok(true);
                }
                _ => {
                    return Err(LowerError::NotCallable { what: ast.render(*op), span: self.span(handle) })
                }
            },
            other => {
                let what = match other {
                    Child::Number(n) => format_number(*n),
                    Child::Boolean(b) => if *b { "#t".into() } else { "#f".into() },
                    Child::Symbol(s) => format!("'{}", s),
                    _ => String::from("operator"),
                };
                return Err(LowerError::NotCallable { what, span: self.span(handle) });
            }
        };
        for arg in args {
            self.value(arg)?;
        }
        self.emit_with(self.call_opcode(handle), target);
        Ok(true)
    }

    /// `(A x y)` with a computed operator `A`: emit a trampoline block that
    /// receives the operator and arguments as parameters and tail-calls the
    /// operator, then call it.
    fn eta_expand(&mut self, handle: Handle, children: &[Child]) -> Result<(), LowerError> {
        let n = self.next_label();
        let temp = format!("_tmp{}", n);
        let end = format!("_tmp{}_end", n);
        let params: Vec<String> = (0..children.len()).map(|i| format!("{}.p{}", temp, i)).collect();

        self.emit_with(Opcode::Goto, Argument::Label(end.clone()));
        self.emit(Instruction::label(temp.clone()));
        for p in params.iter().rev() {
            self.emit_with(Opcode::Store, Argument::Variable(p.clone()));
        }
        for p in &params[1..] {
            self.emit_with(Opcode::Load, Argument::Variable(p.clone()));
        }
        self.emit_with(Opcode::TailCall, Argument::Variable(params[0].clone()));
        self.emit(Instruction::op(Opcode::Return));
        self.emit(Instruction::label(end));

        for child in children {
            self.value(child)?;
        }
        self.emit_with(self.call_opcode(handle), Argument::Label(temp));
        Ok(())
    }

    // ── Special forms and primitives ──

    fn form(&mut self, handle: Handle, keyword: &str, args: &[Child]) -> Result<bool, LowerError> {
        let span = self.span(handle);
        match keyword {
            "define" | "set!" => {
                let malformed = || if keyword == "define" {
                    LowerError::MalformedDefine { span }
                } else {
                    LowerError::MalformedSet { span }
                };
                let [target, rhs] = args else { return Err(malformed()) };
                let Some(name) = target.as_variable() else { return Err(malformed()) };
                match rhs.as_node().filter(|h| self.ast.lambda(*h).is_some()) {
                    Some(lambda) => self.emit_with(Opcode::Push, Argument::Label(lambda.label())),
                    None => self.value(rhs)?,
                }
                let opcode = if keyword == "define" { Opcode::Store } else { Opcode::Set };
                self.emit_with(opcode, Argument::Variable(name.to_string()));
                Ok(false)
            }
            "if" => {
                if !(2..=3).contains(&args.len()) {
                    return Err(LowerError::MalformedIf { span });
                }
                let n = self.next_label();
                let then_label = format!("_if{}", n);
                let end_label = format!("_endif{}", n);
                self.value(&args[0])?;
                self.emit_with(Opcode::IfTrue, Argument::Label(then_label.clone()));
                match args.get(2) {
                    Some(alt) => self.value(alt)?,
                    None => self.emit_with(Opcode::Push, Argument::Boolean(false)),
                }
                self.emit_with(Opcode::Goto, Argument::Label(end_label.clone()));
                self.emit(Instruction::label(then_label));
                self.value(&args[1])?;
                self.emit(Instruction::label(end_label));
                Ok(true)
            }
            "and" | "or" => {
                let is_and = keyword == "and";
                if args.is_empty() {
                    self.emit_with(Opcode::Push, Argument::Boolean(is_and));
                    return Ok(true);
                }
                let n = self.next_label();
                let sink = format!("_{}{}", keyword, n);
                let end = format!("{}_end", sink);
                let branch = if is_and { Opcode::IfFalse } else { Opcode::IfTrue };
                for (i, arg) in args.iter().enumerate() {
                    self.value(arg)?;
                    // a tail call in the last clause returns its own value
                    let tail = i + 1 == args.len() && arg.as_node().is_some_and(|h| self.ast.is_tail_call(h));
                    if !tail {
                        self.emit_with(branch, Argument::Label(sink.clone()));
                    }
                }
                self.emit_with(Opcode::Push, Argument::Boolean(is_and));
                self.emit_with(Opcode::Goto, Argument::Label(end.clone()));
                self.emit(Instruction::label(sink));
                self.emit_with(Opcode::Push, Argument::Boolean(!is_and));
                self.emit(Instruction::label(end));
                Ok(true)
            }
            "begin" => {
                self.body(args)?;
                Ok(true)
            }
            "call/cc" => {
                let [thunk] = args else { return Err(LowerError::MalformedCallCc { span }) };
                let target = match thunk {
                    Child::Variable(v) => Argument::Variable(v.clone()),
                    Child::Node(h) if self.ast.lambda(*h).is_some() => Argument::Label(h.label()),
                    _ => return Err(LowerError::MalformedCallCc { span }),
                };
                let k = format!("_cont{}", self.next_label());
                self.emit_with(Opcode::CaptureCc, Argument::Variable(k.clone()));
                self.emit_with(Opcode::Load, Argument::Variable(k.clone()));
                self.emit_with(Opcode::Call, target);
                self.emit(Instruction::label(k));
                Ok(true)
            }
            "fork" => {
                let [Child::Node(h)] = args else { return Err(LowerError::MalformedFork { span }) };
                match self.ast.get(*h) {
                    Some(Node::Application(a)) if a.quote == QuoteKind::Quote => self.static_list(*h)?,
                    Some(Node::Str(s)) => {
                        self.statics.insert(*h, StaticObject::Str(s.content.clone()));
                    }
                    _ => return Err(LowerError::MalformedFork { span }),
                }
                self.emit_with(Opcode::Fork, Argument::Handle(*h));
                Ok(false)
            }
            "display" => {
                let [arg] = args else { return Err(arity("display", "1", args.len(), span)) };
                self.value(arg)?;
                self.emit(Instruction::op(Opcode::Display));
                Ok(false)
            }
            "newline" => {
                if !args.is_empty() {
                    return Err(arity("newline", "0", args.len(), span));
                }
                self.emit(Instruction::op(Opcode::Newline));
                Ok(false)
            }
            "native" | "import" => Ok(false),
            "+" | "-" | "*" | "/" | "%" | "pow" => {
                self.arithmetic(keyword, args, span)?;
                Ok(true)
            }
            "=" | "<" | ">" | "<=" | ">=" | "cons" => self.primitive(keyword, args, 2, span),
            "not" | "car" | "cdr" => self.primitive(keyword, args, 1, span),
            other => Err(LowerError::UnexpectedKeyword { keyword: other.to_string(), span }),
        }
    }

    fn primitive(&mut self, keyword: &str, args: &[Child], expected: usize, span: Option<Span>) -> Result<bool, LowerError> {
        let opcode = Opcode::for_primitive(keyword)
            .ok_or_else(|| LowerError::UnexpectedKeyword { keyword: keyword.to_string(), span })?;
        if args.len() != expected {
            return Err(arity(keyword, &expected.to_string(), args.len(), span));
        }
        for arg in args {
            self.value(arg)?;
        }
        self.emit(Instruction::op(opcode));
        Ok(true)
    }

    /// Variadic arithmetic folds left. Unary `-` and `/` negate and invert.
    fn arithmetic(&mut self, keyword: &str, args: &[Child], span: Option<Span>) -> Result<(), LowerError> {
        let opcode = Opcode::for_primitive(keyword)
            .ok_or_else(|| LowerError::UnexpectedKeyword { keyword: keyword.to_string(), span })?;
        match (keyword, args) {
            ("+", []) => self.emit_with(Opcode::Push, Argument::Number(0.0)),
            ("*", []) => self.emit_with(Opcode::Push, Argument::Number(1.0)),
            ("+" | "*", [single]) => self.value(single)?,
            ("-" | "/", [single]) => {
                let identity = if keyword == "-" { 0.0 } else { 1.0 };
                self.emit_with(Opcode::Push, Argument::Number(identity));
                self.value(single)?;
                self.emit(Instruction::op(opcode));
            }
            (_, [first, rest @ ..]) if !rest.is_empty() => {
                self.value(first)?;
                for arg in rest {
                    self.value(arg)?;
                    self.emit(Instruction::op(opcode));
                }
            }
            _ => {
                let expected = if matches!(keyword, "-" | "/") { "at least 1" } else { "at least 2" };
                return Err(arity(keyword, expected, args.len(), span));
            }
        }
        Ok(())
    }

    // ── Quoted data ──

    /// Register a quoted list (and everything nested in it) as statics.
    fn static_list(&mut self, handle: Handle) -> Result<(), LowerError> {
        let ast = self.ast;
        let Some(app) = ast.application(handle) else {
            return Err(LowerError::EmptyApplication { span: self.span(handle) });
        };
        let mut items = Vec::with_capacity(app.children.len());
        for child in &app.children {
            items.push(match child {
                Child::Number(n) => Argument::Number(*n),
                Child::Boolean(b) => Argument::Boolean(*b),
                Child::Symbol(s) | Child::Variable(s) | Child::Keyword(s) => Argument::Symbol(s.clone()),
                Child::Node(h) => {
                    match ast.get(*h) {
                        Some(Node::Str(s)) => {
                            self.statics.insert(*h, StaticObject::Str(s.content.clone()));
                        }
                        Some(Node::Application(a)) if a.quote != QuoteKind::Unquote => self.static_list(*h)?,
                        _ => return Err(LowerError::UnquoteOutsideQuasiquote { span: self.span(*h) }),
                    }
                    Argument::Handle(*h)
                }
            });
        }
        self.statics.insert(handle, StaticObject::List(items));
        Ok(())
    }

    fn contains_unquote(&self, handle: Handle) -> bool {
        let Some(app) = self.ast.application(handle) else { return false };
        app.children.iter().filter_map(Child::as_node).any(|h| match self.ast.application(h) {
            Some(a) if a.quote == QuoteKind::Unquote => true,
            Some(_) => self.contains_unquote(h),
            None => false,
        })
    }

    /// A quasiquoted list without unquotes is a plain static list. Otherwise
    /// the list is built at run time by consing onto a fresh empty list.
    fn quasiquote(&mut self, handle: Handle) -> Result<(), LowerError> {
        if !self.contains_unquote(handle) {
            self.static_list(handle)?;
            self.emit_with(Opcode::Push, Argument::Handle(handle));
            return Ok(());
        }
        let ast = self.ast;
        let Some(app) = ast.application(handle) else { return Ok(()) };
        for child in &app.children {
            match child.as_node().and_then(|h| ast.application(h).map(|a| (h, a))) {
                Some((h, a)) if a.quote == QuoteKind::Unquote => {
                    let [inner] = a.children.as_slice() else {
                        return Err(LowerError::UnquoteOutsideQuasiquote { span: self.span(h) });
                    };
                    self.value(inner)?;
                }
                Some((h, _)) => self.quasiquote(h)?,
                None => match child {
                    Child::Node(h) => {
                        if let Some(s) = ast.string(*h) {
                            self.statics.insert(*h, StaticObject::Str(s.to_string()));
                        }
                        self.emit_with(Opcode::Push, Argument::Handle(*h));
                    }
                    Child::Number(n) => self.emit_with(Opcode::Push, Argument::Number(*n)),
                    Child::Boolean(b) => self.emit_with(Opcode::Push, Argument::Boolean(*b)),
                    Child::Symbol(s) | Child::Variable(s) | Child::Keyword(s) => {
                        self.emit_with(Opcode::Push, Argument::Symbol(s.clone()))
                    }
                },
            }
        }
        let empty = Handle(self.next_static);
        self.next_static += 1;
        self.statics.insert(empty, StaticObject::List(Vec::new()));
        self.emit_with(Opcode::Push, Argument::Handle(empty));
        for _ in &app.children {
            self.emit(Instruction::op(Opcode::Cons));
        }
        Ok(())
    }
}

fn arity(form: &str, expected: &str, got: usize, span: Option<Span>) -> LowerError {
    LowerError::Arity { form: form.to_string(), expected: expected.to_string(), got, span }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;
    use crate::compiler::parser::Parser;
    use crate::compiler::scope::analyse_scopes;
    use crate::compiler::tailcall::analyse_tail_calls;

    fn lower_src(src: &str) -> Result<Program, LowerError> {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut ast = Parser::new(tokens).parse_program().unwrap();
        analyse_scopes(&mut ast).unwrap();
        analyse_tail_calls(&mut ast);
        lower(&ast)
    }

    fn listing(src: &str) -> Vec<String> {
        let program = lower_src(src).unwrap();
        program
            .instructions
            .iter()
            .filter(|i| !matches!(i, Instruction::Comment { .. }))
            .map(|i| i.to_string())
            .collect()
    }

    #[test]
    fn test_prologue_and_display() {
        assert_eq!(
            listing("(display 1)"),
            vec!["call @&0", "halt", "@&0", "push 1", "display", "push #f", "return"]
        );
    }

    #[test]
    fn test_define_lambda_pushes_label() {
        let code = listing("(define (sq x) (* x x))");
        assert_eq!(&code[2..6], &["@&0", "push @&2", "store &0.sq", "push #f"]);
        assert_eq!(&code[7..], &["@&2", "store &2.x", "load &2.x", "load &2.x", "mul", "return"]);
    }

    #[test]
    fn test_parameters_stored_in_reverse() {
        let code = listing("(lambda (a b c) a)");
        let block: Vec<&str> = code.iter().skip_while(|l| *l != "@&1").map(String::as_str).collect();
        assert_eq!(&block[..5], &["@&1", "store &1.c", "store &1.b", "store &1.a", "load &1.a"]);
        assert!(code.contains(&"loadclosure @&1".to_string()));
    }

    #[test]
    fn test_non_final_values_are_popped() {
        let code = listing("(define (f) (g) 1 (h))");
        let block: Vec<&str> = code.iter().skip_while(|l| *l != "@&2").map(String::as_str).collect();
        assert_eq!(block, vec!["@&2", "call g", "pop", "tailcall h", "return"]);
    }

    #[test]
    fn test_if_true_branch_is_jump_target() {
        let code = listing("(display (if x 1 2))");
        assert_eq!(
            &code[3..11],
            &["load x", "iftrue @_if0", "push 2", "goto @_endif0", "@_if0", "push 1", "@_endif0", "display"]
        );
    }

    #[test]
    fn test_one_armed_if_pushes_false() {
        let code = listing("(display (if x 1))");
        assert_eq!(&code[4..6], &["iftrue @_if0", "push #f"]);
    }

    #[test]
    fn test_and_or_sinks() {
        let code = listing("(display (and a b))");
        assert_eq!(
            &code[3..13],
            &[
                "load a", "iffalse @_and0", "load b", "iffalse @_and0", "push #t", "goto @_and0_end",
                "@_and0", "push #f", "@_and0_end", "display"
            ]
        );
        let code = listing("(display (or))");
        assert_eq!(code[3], "push #f");
    }

    #[test]
    fn test_and_in_tail_position_tail_calls_last_clause() {
        let code = listing("(define (f n) (and (> n 0) (f (- n 1))))");
        let at = code.iter().position(|l| l.starts_with("tailcall")).unwrap();
        assert_eq!(code[at - 1], "sub");
        assert_eq!(code[at + 1], "push #t");
    }

    #[test]
    fn test_variadic_arithmetic_folds_left() {
        let code = listing("(display (- 10 1 2))");
        assert_eq!(&code[3..8], &["push 10", "push 1", "sub", "push 2", "sub"]);
        let code = listing("(display (- 5))");
        assert_eq!(&code[3..6], &["push 0", "push 5", "sub"]);
        let code = listing("(display (/ 4))");
        assert_eq!(&code[3..6], &["push 1", "push 4", "div"]);
    }

    #[test]
    fn test_comparison_arity() {
        assert!(matches!(lower_src("(< 1 2 3)"), Err(LowerError::Arity { got: 3, .. })));
        assert!(matches!(lower_src("(-)"), Err(LowerError::Arity { got: 0, .. })));
    }

    #[test]
    fn test_eta_expansion_shape() {
        let code = listing("((if #t + -) 3 4)");
        assert_eq!(
            &code[3..12],
            &[
                "goto @_tmp0_end",
                "@_tmp0",
                "store _tmp0.p2",
                "store _tmp0.p1",
                "store _tmp0.p0",
                "load _tmp0.p1",
                "load _tmp0.p2",
                "tailcall _tmp0.p0",
                "return",
            ]
        );
        assert_eq!(code[12], "@_tmp0_end");
        assert!(code.contains(&"push +".to_string()));
        assert_eq!(&code[code.len() - 4..], &["push 3", "push 4", "tailcall @_tmp0", "return"]);
    }

    #[test]
    fn test_call_cc_shape() {
        let code = listing("(display (call/cc (lambda (k) (k 1))))");
        assert_eq!(
            &code[3..8],
            &["capturecc _cont0", "load _cont0", "call @&3", "@_cont0", "display"]
        );
    }

    #[test]
    fn test_quoted_list_is_static() {
        let program = lower_src("(display '(1 (a \"s\")))").unwrap();
        let outer = program
            .statics
            .iter()
            .find_map(|(h, o)| match o {
                StaticObject::List(items) if items.len() == 2 => Some(*h),
                _ => None,
            })
            .unwrap();
        assert_eq!(program.render_static(outer).unwrap(), "(1 (a \"s\"))");
        assert!(program.to_ail_text().contains(&format!("push {}", outer)));
    }

    #[test]
    fn test_quasiquote_conses_at_run_time() {
        let program = lower_src("(define x 2) (display `(1 ,x))").unwrap();
        let text = program.to_ail_text();
        assert!(text.contains("push 1\nload &0.x\npush &"));
        assert!(text.contains("cons\ncons\ndisplay"));
        assert!(program.statics.values().any(|o| *o == StaticObject::List(Vec::new())));
    }

    #[test]
    fn test_fork_and_declarations() {
        let code = listing("(native Math) (fork '(display 1)) (fork \"worker.scm\")");
        assert!(code.iter().any(|l| l.starts_with("fork &")));
        assert_eq!(code.iter().filter(|l| l.starts_with("fork")).count(), 2);
        let program = lower_src("(native Math)").unwrap();
        assert!(program.natives.contains("Math"));
    }

    #[test]
    fn test_malformed_forms() {
        assert!(matches!(lower_src("(set! 1 2)"), Err(LowerError::MalformedSet { .. })));
        assert!(matches!(lower_src("(if)"), Err(LowerError::MalformedIf { .. })));
        assert!(matches!(lower_src("(call/cc 5)"), Err(LowerError::MalformedCallCc { .. })));
        assert!(matches!(lower_src("(fork 5)"), Err(LowerError::MalformedFork { .. })));
        assert!(matches!(lower_src("(5 1)"), Err(LowerError::NotCallable { .. })));
        assert!(matches!(lower_src("()"), Err(LowerError::EmptyApplication { .. })));
    }

    #[test]
    fn test_unanalysed_ast_rejected() {
        let tokens = Lexer::new("(display 1)").tokenize().unwrap();
        let ast = Parser::new(tokens).parse_program().unwrap();
        assert!(matches!(lower(&ast), Err(LowerError::NotAnalysed)));
    }

    #[test]
    fn test_top_level_and_enclosing_tables() {
        let program = lower_src("(define (f x) (lambda () x))").unwrap();
        assert_eq!(program.top_level.get("&0.f").map(String::as_str), Some("f"));
        assert_eq!(program.enclosing.get("&2").map(String::as_str), Some("&0"));
        assert_eq!(program.enclosing.get("&3").map(String::as_str), Some("&2"));
    }
}
