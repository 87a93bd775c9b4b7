//! Program serialization.

use crate::compiler::ail::Program;
use sha2::{Digest, Sha256};

/// Emit a program as pretty-printed JSON.
pub fn emit_json(program: &Program) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(program)
}

/// Emit a program as compact JSON (stable key order, used for hashing).
pub fn emit_canonical_json(program: &Program) -> Result<String, serde_json::Error> {
    serde_json::to_string(program)
}

/// Read a program back from either JSON form.
pub fn read_json(text: &str) -> Result<Program, serde_json::Error> {
    serde_json::from_str(text)
}

/// `sha256:<hex>` digest of some source text.
pub fn source_hash(source: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(source.as_bytes()))
}
