//! Aurora Compiler
//!
//! Turns Aurora Scheme source into AIL programs for the process VM:
//! lex, parse, analyse scopes and tail calls, then lower.

pub mod compiler;

use compiler::ail::{AilError, LabelTable, Program};
use compiler::ast::Ast;
use compiler::tokens::Span;
use thiserror::Error;

pub use compiler::loader::{FsSources, LoadedModule, LoaderError, MemorySources, ModuleLoader, SourceProvider};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] compiler::lexer::LexError),
    #[error("parse error: {0}")]
    Parse(#[from] compiler::parser::ParseError),
    #[error("analysis error: {0}")]
    Analysis(#[from] compiler::scope::AnalysisError),
    #[error("lowering error: {0}")]
    Lower(#[from] compiler::lower::LowerError),
    #[error("label error: {0}")]
    Label(#[from] AilError),
    #[error("module error: {0}")]
    Module(#[from] LoaderError),
}

impl CompileError {
    /// Source line and column of the error, when known.
    pub fn location(&self) -> Option<(usize, usize)> {
        use compiler::lexer::LexError;
        use compiler::lower::LowerError;
        use compiler::parser::ParseError;
        use compiler::scope::AnalysisError;

        let from_span = |span: &Option<Span>| span.map(|s| (s.line, s.col));
        match self {
            CompileError::Lex(
                LexError::UnexpectedChar { line, col, .. }
                | LexError::UnterminatedString { line, col }
                | LexError::InvalidLiteral { line, col, .. },
            ) => Some((*line, *col)),
            CompileError::Parse(
                ParseError::Unexpected { line, col, .. }
                | ParseError::Malformed { line, col, .. }
                | ParseError::UnquoteOutsideQuasiquote { line, col },
            ) => Some((*line, *col)),
            CompileError::Parse(ParseError::UnexpectedEof) => None,
            CompileError::Analysis(AnalysisError::DefineTarget { span }) => Some((span.line, span.col)),
            CompileError::Analysis(AnalysisError::InvalidHandle(_)) => None,
            CompileError::Lower(err) => match err {
                LowerError::NotAnalysed => None,
                LowerError::MalformedDefine { span }
                | LowerError::MalformedSet { span }
                | LowerError::MalformedIf { span }
                | LowerError::MalformedCallCc { span }
                | LowerError::MalformedFork { span }
                | LowerError::NotCallable { span, .. }
                | LowerError::Arity { span, .. }
                | LowerError::UnquoteOutsideQuasiquote { span }
                | LowerError::EmptyApplication { span }
                | LowerError::UnexpectedKeyword { span, .. } => from_span(span),
            },
            CompileError::Label(_) | CompileError::Module(_) => None,
        }
    }
}

/// Lex and parse `source` into an unanalysed AST.
pub fn parse(source: &str) -> Result<Ast, CompileError> {
    let tokens = compiler::lexer::Lexer::new(source).tokenize()?;
    let ast = compiler::parser::Parser::new(tokens).parse_program()?;
    Ok(ast)
}

/// Run scope and tail-call analysis.
pub fn analyse(ast: &mut Ast) -> Result<(), CompileError> {
    compiler::scope::analyse_scopes(ast)?;
    compiler::tailcall::analyse_tail_calls(ast);
    Ok(())
}

/// Lower an analysed AST and check its labels.
pub fn compile_ast(ast: &Ast) -> Result<Program, CompileError> {
    let program = compiler::lower::lower(ast)?;
    LabelTable::analyse(&program.instructions)?;
    Ok(program)
}

/// Compile a single source text with no imports resolved.
pub fn compile(source: &str) -> Result<Program, CompileError> {
    let mut ast = parse(source)?;
    analyse(&mut ast)?;
    let mut program = compile_ast(&ast)?;
    program.source_hash = compiler::emit::source_hash(source);
    Ok(program)
}

/// `file:line:col: message` for display.
pub fn format_error(error: &CompileError, filename: &str) -> String {
    match error.location() {
        Some((line, col)) => format!("{}:{}:{}: {}", filename, line, col, error),
        None => format!("{}: {}", filename, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_is_deterministic() {
        let src = "(define (f n) (if (= n 0) 'done (f (- n 1)))) (display (f 10)) (display `(1 ,(f 2)))";
        let a = compile(src).unwrap();
        let b = compile(src).unwrap();
        assert_eq!(a.to_ail_text(), b.to_ail_text());
        assert_eq!(a, b);
    }

    #[test]
    fn test_compile_sets_source_hash() {
        let program = compile("(display 1)").unwrap();
        assert_eq!(program.source_hash, compiler::emit::source_hash("(display 1)"));
    }

    #[test]
    fn test_empty_source_compiles() {
        let program = compile("").unwrap();
        assert_eq!(program.to_ail_text(), "call @&0\nhalt\n; lambda &0 ()\n@&0\npush #f\nreturn\n");
    }

    #[test]
    fn test_format_error_with_location() {
        let err = compile("(display\n  (if))").unwrap_err();
        assert_eq!(err.location(), Some((2, 3)));
        assert!(format_error(&err, "main.scm").starts_with("main.scm:2:3: "));
    }

    #[test]
    fn test_analyse_twice_is_harmless() {
        let mut ast = parse("(define (f) (g))").unwrap();
        analyse(&mut ast).unwrap();
        let tails = ast.tail_calls.clone();
        analyse(&mut ast).unwrap();
        assert_eq!(tails, ast.tail_calls);
    }
}
