pub mod ail;
pub mod ast;
pub mod emit;
pub mod lexer;
pub mod loader;
pub mod lower;
pub mod parser;
pub mod scope;
pub mod tailcall;
pub mod tokens;
