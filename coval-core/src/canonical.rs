//! Canonical JSON encoding.
//!
//! Every hash, signature, and derived nonce in the engine is computed over
//! this encoding, so two replicas that built the same value through different
//! insertion orders agree byte-for-byte. Rules: object keys sorted
//! lexicographically at every depth, arrays kept in order, numbers in
//! shortest round-trip form, strings as JSON-escaped UTF-8, no whitespace.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonicalError {
    #[error("value cannot be represented as JSON: {0}")]
    NotJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CanonicalError>;

/// Canonical string form of an already-parsed JSON value.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical string form of any serializable value.
pub fn canonical_string<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_value(value)?;
    Ok(stable_stringify(&json))
}

/// Canonical byte form, as fed to hashes and signatures.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(canonical_string(value)?.into_bytes())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::String(s) => write_string(out, s),
        // serde_json renders numbers via ryu/itoa — shortest round-trip form.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json's escaping is already minimal and deterministic.
    match serde_json::to_string(s) {
        Ok(escaped) => out.push_str(&escaped),
        Err(_) => unreachable!("string serialization is infallible"),
    }
}
