//! Decoding helpers shared by the attestation stages.
//!
//! `cosign verify-attestation` prints DSSE envelopes whose `payload` is a
//! base64-encoded in-toto Statement. Some producers additionally encode the
//! Statement's `predicate` as a JSON string; [`normalize_predicate`] folds
//! both shapes into one parsed value before any field is read.

use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Predicate values may be wrapped in strings at most this many times.
const MAX_PREDICATE_NESTING: usize = 2;

/// Decodes the first DSSE envelope in `stdout` that yields a JSON Statement.
///
/// Envelopes may be newline-delimited or pretty-printed back to back. Returns
/// a description of the last failure when no envelope decodes.
pub fn first_statement(stdout: &[u8]) -> Result<Value, String> {
    let mut last_err = "no attestation envelopes in tool output".to_string();
    for item in serde_json::Deserializer::from_slice(stdout).into_iter::<Value>() {
        let envelope = match item {
            Ok(v) => v,
            Err(e) => return Err(format!("malformed envelope stream: {e}")),
        };
        match decode_envelope(&envelope) {
            Ok(statement) => return Ok(statement),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Base64-decodes `envelope.payload` and parses it as JSON.
pub fn decode_envelope(envelope: &Value) -> Result<Value, String> {
    let encoded = envelope
        .get("payload")
        .and_then(Value::as_str)
        .ok_or_else(|| "envelope has no payload".to_string())?;
    let raw = decode_base64(encoded).ok_or_else(|| "payload is not valid base64".to_string())?;
    serde_json::from_slice(&raw).map_err(|e| format!("payload is not JSON: {e}"))
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    general_purpose::STANDARD
        .decode(s)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(s))
        .or_else(|_| general_purpose::URL_SAFE.decode(s))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(s))
        .ok()
}

/// Returns the predicate as a parsed object whether it arrived as an object
/// or as a string containing encoded JSON.
pub fn normalize_predicate(predicate: &Value) -> Result<Value, String> {
    let mut current = predicate.clone();
    for _ in 0..=MAX_PREDICATE_NESTING {
        match current {
            Value::Object(_) => return Ok(current),
            Value::String(s) => {
                current = serde_json::from_str(&s)
                    .map_err(|e| format!("predicate string is not JSON: {e}"))?;
            }
            Value::Null => return Err("statement has no predicate".to_string()),
            other => return Err(format!("unexpected predicate type: {}", json_kind(&other))),
        }
    }
    Err("predicate is encoded too many times".to_string())
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// String at a JSON pointer, ignoring empty strings.
pub fn str_at(v: &Value, pointer: &str) -> Option<String> {
    v.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// First pointer in `pointers` that yields a non-empty string.
pub fn first_str(v: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| str_at(v, p))
}

/// Integer at a JSON pointer; accepts numbers and numeric strings.
pub fn i64_at(v: &Value, pointer: &str) -> Option<i64> {
    match v.pointer(pointer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Formats a Unix timestamp as RFC 3339 UTC.
pub fn format_unix(ts: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
}
