//! Recursive descent parser for Aurora Scheme.
//!
//! The whole source becomes the body of a parameterless top-level lambda.
//! A handful of derived forms are desugared here so later passes only see the
//! core forms: `(define (f x) ..)`, `let` (plain and named), `cond` and
//! `(quote x)`.

use crate::compiler::ast::*;
use crate::compiler::tokens::{Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected token {found} at line {line}, col {col}; expected {expected}")]
    Unexpected { found: String, expected: String, line: usize, col: usize },
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("malformed {form} at line {line}, col {col}: {reason}")]
    Malformed { form: String, reason: String, line: usize, col: usize },
    #[error("unquote outside of quasiquote at line {line}, col {col}")]
    UnquoteOutsideQuasiquote { line: usize, col: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Code,
    Quoted,
    Quasi,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn current(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> &TokenKind {
        self.current().map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn peek_span(&self) -> Span {
        self.current().map(|t| t.span).unwrap_or_else(Span::dummy)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if self.pos < self.tokens.len() { self.pos += 1; }
        tok
    }

    fn at_end(&self) -> bool { matches!(self.peek_kind(), TokenKind::Eof) }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, ParseError> {
        let span = self.peek_span();
        match self.advance() {
            Some(tok) if std::mem::discriminant(&tok.kind) == std::mem::discriminant(kind) => Ok(tok),
            Some(tok) if tok.kind == TokenKind::Eof => Err(ParseError::UnexpectedEof),
            Some(tok) => Err(ParseError::Unexpected {
                found: tok.kind.to_string(), expected: kind.to_string(), line: span.line, col: span.col,
            }),
            None => Err(ParseError::UnexpectedEof),
        }
    }

    fn expect_symbol(&mut self, what: &str) -> Result<String, ParseError> {
        let span = self.peek_span();
        match self.advance() {
            Some(Token { kind: TokenKind::Symbol(s), .. }) => Ok(s),
            Some(Token { kind: TokenKind::Eof, .. }) | None => Err(ParseError::UnexpectedEof),
            Some(tok) => Err(ParseError::Unexpected {
                found: tok.kind.to_string(), expected: what.to_string(), line: span.line, col: span.col,
            }),
        }
    }

    fn malformed(form: &str, reason: &str, span: Span) -> ParseError {
        ParseError::Malformed { form: form.into(), reason: reason.into(), line: span.line, col: span.col }
    }

    // ── Program ──

    pub fn parse_program(&mut self) -> Result<Ast, ParseError> {
        let mut ast = Ast::new();
        let top = ast.top();
        while !self.at_end() {
            let child = self.parse_expr(&mut ast, Mode::Code)?;
            ast.push_child(top, child);
        }
        collect_declarations(&mut ast);
        Ok(ast)
    }

    // ── Expressions ──

    fn parse_expr(&mut self, ast: &mut Ast, mode: Mode) -> Result<Child, ParseError> {
        let span = self.peek_span();
        let tok = self.advance().ok_or(ParseError::UnexpectedEof)?;
        match tok.kind {
            TokenKind::Number(n) => Ok(Child::Number(n)),
            TokenKind::Boolean(b) => Ok(Child::Boolean(b)),
            TokenKind::StringLit(s) => {
                let h = ast.make_string(None, &s);
                ast.spans.insert(h, span);
                Ok(Child::Node(h))
            }
            TokenKind::Symbol(s) => Ok(match mode {
                Mode::Quoted | Mode::Quasi => Child::Symbol(s),
                Mode::Code if is_keyword(&s) => Child::Keyword(s),
                Mode::Code => Child::Variable(s),
            }),
            TokenKind::Quote => match mode {
                Mode::Code => self.parse_datum(ast, QuoteKind::Quote, span),
                _ => self.parse_nested_quote(ast, mode, "quote", span),
            },
            TokenKind::Quasiquote => match mode {
                Mode::Code => self.parse_datum(ast, QuoteKind::Quasiquote, span),
                _ => self.parse_nested_quote(ast, mode, "quasiquote", span),
            },
            TokenKind::Unquote => match mode {
                Mode::Quasi => {
                    let h = ast.make_application(None, QuoteKind::Unquote);
                    let inner = self.parse_expr(ast, Mode::Code)?;
                    ast.push_child(h, inner);
                    ast.spans.insert(h, span);
                    Ok(Child::Node(h))
                }
                Mode::Quoted => self.parse_nested_quote(ast, mode, "unquote", span),
                Mode::Code => Err(ParseError::UnquoteOutsideQuasiquote { line: span.line, col: span.col }),
            },
            TokenKind::LParen => match mode {
                Mode::Code => self.parse_form(ast, span),
                Mode::Quoted => self.parse_list(ast, QuoteKind::Quote, Mode::Quoted, span),
                Mode::Quasi => self.parse_list(ast, QuoteKind::Quote, Mode::Quasi, span),
            },
            TokenKind::RParen => Err(ParseError::Unexpected {
                found: ")".into(), expected: "expression".into(), line: span.line, col: span.col,
            }),
            TokenKind::Eof => Err(ParseError::UnexpectedEof),
        }
    }

    /// The datum after `'` or `` ` `` in code.
    fn parse_datum(&mut self, ast: &mut Ast, kind: QuoteKind, span: Span) -> Result<Child, ParseError> {
        let mode = if kind == QuoteKind::Quasiquote { Mode::Quasi } else { Mode::Quoted };
        if matches!(self.peek_kind(), TokenKind::LParen) {
            let open = self.peek_span();
            self.advance();
            self.parse_list(ast, kind, mode, open.merge(span))
        } else {
            self.parse_expr(ast, mode)
        }
    }

    /// `'x` inside an already-quoted datum reads as the list `(quote x)`.
    fn parse_nested_quote(&mut self, ast: &mut Ast, mode: Mode, name: &str, span: Span) -> Result<Child, ParseError> {
        let h = ast.make_application(None, QuoteKind::Quote);
        ast.push_child(h, Child::Symbol(name.to_string()));
        let inner = self.parse_expr(ast, mode)?;
        ast.push_child(h, inner);
        ast.spans.insert(h, span);
        Ok(Child::Node(h))
    }

    /// Elements up to the closing paren; the opening paren is consumed.
    fn parse_list(&mut self, ast: &mut Ast, kind: QuoteKind, mode: Mode, span: Span) -> Result<Child, ParseError> {
        let h = ast.make_application(None, kind);
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            if self.at_end() { return Err(ParseError::UnexpectedEof); }
            let child = self.parse_expr(ast, mode)?;
            ast.push_child(h, child);
        }
        let close = self.expect(&TokenKind::RParen)?.span;
        ast.spans.insert(h, span.merge(close));
        Ok(Child::Node(h))
    }

    fn parse_form(&mut self, ast: &mut Ast, span: Span) -> Result<Child, ParseError> {
        let head = match self.peek_kind() {
            TokenKind::Symbol(s) => Some(s.clone()),
            _ => None,
        };
        match head.as_deref() {
            Some("lambda") => { self.advance(); self.parse_lambda(ast, span) }
            Some("define") => { self.advance(); self.parse_define(ast, span) }
            Some("let") => { self.advance(); self.parse_let(ast, span) }
            Some("cond") => { self.advance(); self.parse_cond(ast, span) }
            Some("quote") => {
                self.advance();
                let datum = self.parse_datum(ast, QuoteKind::Quote, span)?;
                self.expect(&TokenKind::RParen)?;
                Ok(datum)
            }
            _ => self.parse_list(ast, QuoteKind::None, Mode::Code, span),
        }
    }

    // ── Special forms ──

    fn parse_parameters(&mut self, ast: &mut Ast, lambda: Handle) -> Result<(), ParseError> {
        self.expect(&TokenKind::LParen)?;
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            let name = self.expect_symbol("parameter name")?;
            ast.add_parameter(lambda, &name);
        }
        self.expect(&TokenKind::RParen)?;
        Ok(())
    }

    fn parse_body(&mut self, ast: &mut Ast, owner: Handle, form: &str, span: Span) -> Result<(), ParseError> {
        let mut count = 0;
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            if self.at_end() { return Err(ParseError::UnexpectedEof); }
            let child = self.parse_expr(ast, Mode::Code)?;
            ast.push_child(owner, child);
            count += 1;
        }
        let close = self.expect(&TokenKind::RParen)?.span;
        if count == 0 {
            return Err(Self::malformed(form, "empty body", span));
        }
        ast.spans.insert(owner, span.merge(close));
        Ok(())
    }

    /// `(lambda (params) body..)` after the `lambda` keyword.
    fn parse_lambda(&mut self, ast: &mut Ast, span: Span) -> Result<Child, ParseError> {
        let lambda = ast.make_lambda(None);
        if !matches!(self.peek_kind(), TokenKind::LParen) {
            return Err(Self::malformed("lambda", "expected a parameter list", self.peek_span()));
        }
        self.parse_parameters(ast, lambda)?;
        self.parse_body(ast, lambda, "lambda", span)?;
        Ok(Child::Node(lambda))
    }

    /// `(define name expr)` or `(define (name params) body..)`.
    fn parse_define(&mut self, ast: &mut Ast, span: Span) -> Result<Child, ParseError> {
        let app = ast.make_application(None, QuoteKind::None);
        ast.push_child(app, Child::Keyword("define".into()));
        if matches!(self.peek_kind(), TokenKind::LParen) {
            self.advance();
            let name = self.expect_symbol("function name")?;
            ast.push_child(app, Child::Variable(name));
            let lambda = ast.make_lambda(None);
            while !matches!(self.peek_kind(), TokenKind::RParen) {
                let param = self.expect_symbol("parameter name")?;
                ast.add_parameter(lambda, &param);
            }
            self.expect(&TokenKind::RParen)?;
            self.parse_body(ast, lambda, "define", span)?;
            ast.push_child(app, Child::Node(lambda));
            ast.spans.insert(app, span);
            return Ok(Child::Node(app));
        }
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            if self.at_end() { return Err(ParseError::UnexpectedEof); }
            let child = self.parse_expr(ast, Mode::Code)?;
            ast.push_child(app, child);
        }
        let close = self.expect(&TokenKind::RParen)?.span;
        ast.spans.insert(app, span.merge(close));
        Ok(Child::Node(app))
    }

    fn parse_bindings(&mut self, ast: &mut Ast) -> Result<Vec<(String, Child)>, ParseError> {
        self.expect(&TokenKind::LParen)?;
        let mut bindings = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            self.expect(&TokenKind::LParen)?;
            let name = self.expect_symbol("binding name")?;
            let init = self.parse_expr(ast, Mode::Code)?;
            self.expect(&TokenKind::RParen)?;
            bindings.push((name, init));
        }
        self.expect(&TokenKind::RParen)?;
        Ok(bindings)
    }

    /// `(let ((x e)..) body..)` becomes `((lambda (x..) body..) e..)`.
    /// `(let loop ((x e)..) body..)` becomes
    /// `((lambda () (define loop (lambda (x..) body..)) (loop e..)))`.
    fn parse_let(&mut self, ast: &mut Ast, span: Span) -> Result<Child, ParseError> {
        let name = match self.peek_kind() {
            TokenKind::Symbol(s) => Some(s.clone()),
            _ => None,
        };
        if name.is_some() { self.advance(); }
        let app = ast.make_application(None, QuoteKind::None);
        let bindings = self.parse_bindings(ast)?;
        let body = ast.make_lambda(None);
        for (param, _) in &bindings {
            ast.add_parameter(body, param);
        }
        self.parse_body(ast, body, "let", span)?;
        ast.spans.insert(app, span);

        let Some(name) = name else {
            ast.push_child(app, Child::Node(body));
            for (_, init) in bindings {
                ast.push_child(app, init);
            }
            return Ok(Child::Node(app));
        };

        let wrapper = ast.make_lambda(None);
        let define = ast.make_application(None, QuoteKind::None);
        ast.push_child(define, Child::Keyword("define".into()));
        ast.push_child(define, Child::Variable(name.clone()));
        ast.push_child(define, Child::Node(body));
        ast.push_child(wrapper, Child::Node(define));
        let call = ast.make_application(None, QuoteKind::None);
        ast.push_child(call, Child::Variable(name));
        for (_, init) in bindings {
            ast.push_child(call, init);
        }
        ast.push_child(wrapper, Child::Node(call));
        ast.push_child(app, Child::Node(wrapper));
        for h in [define, call, wrapper] {
            ast.spans.insert(h, span);
        }
        Ok(Child::Node(app))
    }

    /// `cond` becomes a chain of `if`s; clause bodies are wrapped in `begin`.
    fn parse_cond(&mut self, ast: &mut Ast, span: Span) -> Result<Child, ParseError> {
        let mut clauses: Vec<(Option<Child>, Vec<Child>, Span)> = Vec::new();
        while !matches!(self.peek_kind(), TokenKind::RParen) {
            let clause_span = self.peek_span();
            self.expect(&TokenKind::LParen)?;
            let test = match self.peek_kind() {
                TokenKind::Symbol(s) if s == "else" => { self.advance(); None }
                _ => Some(self.parse_expr(ast, Mode::Code)?),
            };
            let mut body = Vec::new();
            while !matches!(self.peek_kind(), TokenKind::RParen) {
                if self.at_end() { return Err(ParseError::UnexpectedEof); }
                body.push(self.parse_expr(ast, Mode::Code)?);
            }
            self.expect(&TokenKind::RParen)?;
            if body.is_empty() {
                return Err(Self::malformed("cond", "clause without a body", clause_span));
            }
            clauses.push((test, body, clause_span));
        }
        self.expect(&TokenKind::RParen)?;
        if clauses.is_empty() {
            return Err(Self::malformed("cond", "no clauses", span));
        }

        let mut rest: Option<Child> = None;
        for (test, body, clause_span) in clauses.into_iter().rev() {
            let body = make_begin(ast, body, clause_span);
            rest = Some(match test {
                None => body,
                Some(test) => {
                    let branch = ast.make_application(None, QuoteKind::None);
                    ast.push_child(branch, Child::Keyword("if".into()));
                    ast.push_child(branch, test);
                    ast.push_child(branch, body);
                    if let Some(alt) = rest.take() {
                        ast.push_child(branch, alt);
                    }
                    ast.spans.insert(branch, clause_span);
                    Child::Node(branch)
                }
            });
        }
        rest.ok_or_else(|| Self::malformed("cond", "no clauses", span))
    }
}

fn make_begin(ast: &mut Ast, mut body: Vec<Child>, span: Span) -> Child {
    if body.len() == 1 {
        return body.remove(0);
    }
    let app = ast.make_application(None, QuoteKind::None);
    ast.push_child(app, Child::Keyword("begin".into()));
    for child in body {
        ast.push_child(app, child);
    }
    ast.spans.insert(app, span);
    Child::Node(app)
}

/// Record top-level `(native Lib)` and `(import Alias "path")` declarations.
fn collect_declarations(ast: &mut Ast) {
    let Some(top) = ast.lambda(ast.top()) else { return };
    let mut natives = Vec::new();
    let mut imports = Vec::new();
    for child in &top.body {
        let Some(app) = child.as_node().and_then(|h| ast.application(h)) else { continue };
        match app.children.as_slice() {
            [head, Child::Variable(lib)] if head.is_keyword("native") => natives.push(lib.clone()),
            [head, Child::Variable(alias), Child::Node(path)] if head.is_keyword("import") => {
                if let Some(path) = ast.string(*path) {
                    imports.push((alias.clone(), path.to_string()));
                }
            }
            _ => {}
        }
    }
    ast.natives.extend(natives);
    ast.dependencies.extend(imports);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::Lexer;

    fn parse(src: &str) -> Ast {
        let tokens = Lexer::new(src).tokenize().unwrap();
        Parser::new(tokens).parse_program().unwrap()
    }

    fn top_forms(ast: &Ast) -> Vec<Child> {
        ast.lambda(ast.top()).unwrap().body.clone()
    }

    #[test]
    fn test_parse_application() {
        let ast = parse("(+ 1 x)");
        let forms = top_forms(&ast);
        let app = ast.application(forms[0].as_node().unwrap()).unwrap();
        assert_eq!(app.children[0], Child::Keyword("+".into()));
        assert_eq!(app.children[1], Child::Number(1.0));
        assert_eq!(app.children[2], Child::Variable("x".into()));
    }

    #[test]
    fn test_parse_lambda_params_and_body() {
        let ast = parse("(lambda (a b a) (display a) b)");
        let h = top_forms(&ast)[0].as_node().unwrap();
        let lambda = ast.lambda(h).unwrap();
        assert_eq!(lambda.parameters, vec!["a", "b"]);
        assert_eq!(lambda.body.len(), 2);
        assert_eq!(lambda.parent, Some(ast.top()));
    }

    #[test]
    fn test_define_function_sugar() {
        let ast = parse("(define (sq x) (* x x))");
        let h = top_forms(&ast)[0].as_node().unwrap();
        let app = ast.application(h).unwrap();
        assert!(app.children[0].is_keyword("define"));
        assert_eq!(app.children[1], Child::Variable("sq".into()));
        let lambda = ast.lambda(app.children[2].as_node().unwrap()).unwrap();
        assert_eq!(lambda.parameters, vec!["x"]);
    }

    #[test]
    fn test_quoted_list_holds_symbols() {
        let ast = parse("'(a (b 2) \"s\")");
        let h = top_forms(&ast)[0].as_node().unwrap();
        let app = ast.application(h).unwrap();
        assert_eq!(app.quote, QuoteKind::Quote);
        assert_eq!(app.children[0], Child::Symbol("a".into()));
        let inner = ast.application(app.children[1].as_node().unwrap()).unwrap();
        assert_eq!(inner.quote, QuoteKind::Quote);
        assert!(ast.string(app.children[2].as_node().unwrap()).is_some());
    }

    #[test]
    fn test_quasiquote_with_unquote() {
        let ast = parse("`(a ,(+ 1 2))");
        let h = top_forms(&ast)[0].as_node().unwrap();
        let app = ast.application(h).unwrap();
        assert_eq!(app.quote, QuoteKind::Quasiquote);
        let unq = ast.application(app.children[1].as_node().unwrap()).unwrap();
        assert_eq!(unq.quote, QuoteKind::Unquote);
        assert_eq!(ast.render(h), "`(a ,(+ 1 2))");
    }

    #[test]
    fn test_quote_symbol_atom() {
        let ast = parse("'foo (quote bar)");
        let forms = top_forms(&ast);
        assert_eq!(forms[0], Child::Symbol("foo".into()));
        assert_eq!(forms[1], Child::Symbol("bar".into()));
    }

    #[test]
    fn test_let_desugars_to_lambda_application() {
        let ast = parse("(let ((x 1) (y 2)) (+ x y))");
        let h = top_forms(&ast)[0].as_node().unwrap();
        assert_eq!(ast.render(h), "((lambda (x y) (+ x y)) 1 2)");
    }

    #[test]
    fn test_named_let_desugars_to_local_define() {
        let ast = parse("(let loop ((i 0)) (loop (+ i 1)))");
        let h = top_forms(&ast)[0].as_node().unwrap();
        assert_eq!(
            ast.render(h),
            "((lambda () (define loop (lambda (i) (loop (+ i 1)))) (loop 0)))"
        );
    }

    #[test]
    fn test_cond_desugars_to_if_chain() {
        let ast = parse("(cond ((< x 0) 'neg) ((= x 0) 'zero) (else 'pos))");
        let h = top_forms(&ast)[0].as_node().unwrap();
        assert_eq!(ast.render(h), "(if (< x 0) 'neg (if (= x 0) 'zero 'pos))");
    }

    #[test]
    fn test_declarations_recorded() {
        let ast = parse("(native Math) (import Lib \"lib.scm\") (Math.sqrt 4)");
        assert!(ast.natives.contains("Math"));
        assert_eq!(ast.dependencies.get("Lib").map(String::as_str), Some("lib.scm"));
    }

    #[test]
    fn test_unbalanced_input() {
        let tokens = Lexer::new("(display 1").tokenize().unwrap();
        assert!(matches!(Parser::new(tokens).parse_program(), Err(ParseError::UnexpectedEof)));
    }

    #[test]
    fn test_unquote_outside_quasiquote() {
        let tokens = Lexer::new(",x").tokenize().unwrap();
        assert!(matches!(
            Parser::new(tokens).parse_program(),
            Err(ParseError::UnquoteOutsideQuasiquote { .. })
        ));
    }

    #[test]
    fn test_empty_lambda_body_rejected() {
        let tokens = Lexer::new("(lambda (x))").tokenize().unwrap();
        assert!(matches!(Parser::new(tokens).parse_program(), Err(ParseError::Malformed { .. })));
    }
}
