//! Canonical state-point encoding and job identity.
//!
//! A job id must be a pure function of the parameter document, stable across
//! processes and runs:
//!
//! - mapping keys are sorted lexicographically at every nesting level
//! - sequence order is preserved
//! - numbers equal under ordinary numeric comparison encode identically
//!   (the integral float `1.0` encodes as the integer `1`)
//! - the id is the SHA-256 of the canonical bytes, rendered as lowercase hex

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::DocumentError;

/// Width of a job id in hex characters (SHA-256).
pub const JOB_ID_LEN: usize = 64;

/// A job id: `JOB_ID_LEN` lowercase hex characters.
pub type JobId = String;

/// Whether `s` has the shape of a full job id.
pub fn is_job_id(s: &str) -> bool {
    s.len() == JOB_ID_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Canonical encoding of a parameter document.
///
/// The top-level value must be a mapping; anything else is not a valid
/// state point.
pub fn canonical_bytes(doc: &Value) -> Result<Vec<u8>, DocumentError> {
    if !doc.is_object() {
        return Err(DocumentError::Unrepresentable(format!(
            "state point must be a mapping, got {}",
            type_name(doc)
        )));
    }
    let mut out = String::new();
    write_value(&mut out, doc)?;
    Ok(out.into_bytes())
}

/// Canonical encoding of an arbitrary JSON value, as text.
///
/// Used wherever a value must act as a deterministic set or map key
/// (schema detection, view path segments).
pub fn canonical_string(value: &Value) -> Result<String, DocumentError> {
    let mut out = String::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Compute the job id for a parameter document.
pub fn calc_id(doc: &Value) -> Result<JobId, DocumentError> {
    let bytes = canonical_bytes(doc)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hasher.finalize();
    let mut id = String::with_capacity(JOB_ID_LEN);
    for byte in digest {
        id.push(HEX[(byte >> 4) as usize]);
        id.push(HEX[(byte & 0x0f) as usize]);
    }
    Ok(id)
}

const HEX: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
];

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

fn write_value(out: &mut String, value: &Value) -> Result<(), DocumentError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n)?,
        Value::String(s) => {
            // serde_json handles JSON string escaping; a plain string
            // cannot fail to serialize.
            let escaped = serde_json::to_string(s).map_err(|err| {
                DocumentError::Unrepresentable(format!("string not serializable: {err}"))
            })?;
            out.push_str(&escaped);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let escaped = serde_json::to_string(key).map_err(|err| {
                    DocumentError::Unrepresentable(format!("key not serializable: {err}"))
                })?;
                out.push_str(&escaped);
                out.push(':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }
    Ok(())
}

/// Numbers are normalized so that equal values encode identically:
/// a finite float with zero fractional part in integer range is written
/// as the integer.
fn write_number(out: &mut String, n: &serde_json::Number) -> Result<(), DocumentError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or_else(|| {
        DocumentError::Unrepresentable(format!("number '{n}' has no finite representation"))
    })?;
    if !f.is_finite() {
        return Err(DocumentError::Unrepresentable(format!(
            "number '{f}' has no canonical JSON representation"
        )));
    }
    if f.fract() == 0.0 {
        // -0.0 normalizes to 0 here as well.
        if f >= i64::MIN as f64 && f < 0.0 {
            out.push_str(&(f as i64).to_string());
            return Ok(());
        }
        if f >= 0.0 && f <= u64::MAX as f64 {
            out.push_str(&(f as u64).to_string());
            return Ok(());
        }
    }
    // Non-integral (or out of integer range): serde_json's shortest
    // round-trip rendering is already deterministic.
    out.push_str(&n.to_string());
    Ok(())
}
