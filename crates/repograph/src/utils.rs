#![forbid(unsafe_code)]

//! Content hashing and stable identity derivation.
//!
//! Every node id is the SHA-256 of its kind label and identity basis, so
//! repeated runs over the same source produce the same ids.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::types::NodeKind;

pub fn hash_sha256(input: &str) -> String {
    hash_bytes(input.as_bytes())
}

pub fn hash_bytes(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Seconds since the Unix epoch; 0 if the clock is before it.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Each basis part is length-prefixed, so parts containing `|` cannot shift
/// into their neighbours.
pub fn node_id(kind: NodeKind, basis: &[&str]) -> String {
    let mut seed = String::from(kind.label());
    for part in basis {
        seed.push_str(&format!("|{}:{part}", part.len()));
    }
    hash_sha256(&seed)
}

pub fn file_id(path: &str) -> String {
    node_id(NodeKind::File, &[path])
}

pub fn class_id(path: &str, qualified_name: &str) -> String {
    node_id(NodeKind::Class, &[path, qualified_name])
}

pub fn external_class_id(name: &str) -> String {
    node_id(NodeKind::Class, &["<external>", name])
}

pub fn function_id(path: &str, qualified_name: &str, arity: usize) -> String {
    node_id(NodeKind::Function, &[path, qualified_name, &arity.to_string()])
}

/// `scope_id` is the id of the enclosing file (module variables) or
/// function (locals and parameters).
pub fn variable_id(scope_id: &str, name: &str) -> String {
    node_id(NodeKind::Variable, &[scope_id, name])
}

pub fn module_id(name: &str) -> String {
    node_id(NodeKind::Module, &[name])
}

pub fn decorator_id(path: &str, name: &str) -> String {
    node_id(NodeKind::Decorator, &[path, name])
}

pub fn exception_id(path: &str, name: &str) -> String {
    node_id(NodeKind::Exception, &[path, name])
}

pub fn data_file_id(name: &str) -> String {
    node_id(NodeKind::DataFile, &[name])
}

pub fn script_id(path: &str) -> String {
    node_id(NodeKind::Script, &[path])
}

pub fn endpoint_id(method: &str, route: &str) -> String {
    node_id(NodeKind::ApiEndpoint, &[method, route])
}
