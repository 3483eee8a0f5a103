//! Idempotency key generation.
//!
//! The key is a SHA-256 fingerprint over the operation, the account and a
//! canonical encoding of the params. Canonical encoding sorts object keys
//! recursively and drops insignificant whitespace, so the same logical
//! request always hashes to the same key while any change to a value
//! (quantity, price, side) produces a different one.
//!
//! Keys depend on nothing but their inputs: no clock, no randomness, no
//! process state. They are stable across restarts.

use std::fmt::Write as _;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{OrderOperation, OrderParams};

/// Field separator that cannot appear in an operation name.
const SEPARATOR: &[u8] = b"\x1f";

/// Compute the idempotency key for a request.
#[must_use]
pub fn generate_idempotency_key(
    operation: OrderOperation,
    account_id: &str,
    params: &OrderParams,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(operation.as_str().as_bytes());
    hasher.update(SEPARATOR);
    hasher.update(account_id.as_bytes());
    hasher.update(SEPARATOR);
    hasher.update(params.canonical().as_bytes());

    format!("{:x}", hasher.finalize())
}

/// Encode a JSON value with object keys sorted at every depth.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                if let Some(inner) = fields.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    out.push_str(&Value::String(s.to_string()).to_string());
}
