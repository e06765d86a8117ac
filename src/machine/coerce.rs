//! Scalar coercion
//!
//! Converts accumulated element text into a typed scalar. Whitespace is
//! trimmed on both ends unless any of the element's content arrived in a
//! CDATA section, in which case bytes are preserved verbatim.

use crate::schema::ScalarKind;
use crate::value::Value;

/// Coerce terminal text to the target scalar kind.
///
/// On failure the error carries a caller-facing message; the field is
/// expected to stay at its default.
pub fn coerce_scalar(kind: ScalarKind, raw: &str, verbatim: bool) -> Result<Value, String> {
    let text = if verbatim { raw } else { raw.trim() };

    match kind {
        ScalarKind::String => Ok(Value::Str(text.to_string())),
        ScalarKind::Integer => text
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("invalid integer literal {text:?}")),
        ScalarKind::Float => parse_float(text)
            .map(Value::Float)
            .ok_or_else(|| format!("invalid float literal {text:?}")),
        ScalarKind::Bool => parse_bool(text)
            .map(Value::Bool)
            .ok_or_else(|| format!("invalid bool literal {text:?}")),
        ScalarKind::Null => {
            if text.is_empty() || text.eq_ignore_ascii_case("null") || text == "None" {
                Ok(Value::Null)
            } else {
                Err(format!("expected null, found {text:?}"))
            }
        }
    }
}

/// Attempt coercion against each kind in declaration order; the first
/// success wins. Used for scalar unions at seal time.
pub fn coerce_first(kinds: &[ScalarKind], raw: &str, verbatim: bool) -> Option<Value> {
    kinds
        .iter()
        .find_map(|&k| coerce_scalar(k, raw, verbatim).ok())
}

/// Floats accept an optional fraction and exponent, plus `inf` and `nan`
/// case-insensitively. Hex or underscore forms are rejected.
fn parse_float(text: &str) -> Option<f64> {
    if text.is_empty() {
        return None;
    }
    let body = text
        .strip_prefix('+')
        .or_else(|| text.strip_prefix('-'))
        .unwrap_or(text);
    let lowered = body.to_ascii_lowercase();
    if lowered == "inf" || lowered == "infinity" || lowered == "nan" {
        return text.parse::<f64>().ok();
    }
    if !body.bytes().all(|b| matches!(b, b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')) {
        return None;
    }
    text.parse::<f64>().ok()
}

fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") || text == "1" {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") || text == "0" {
        Some(false)
    } else {
        None
    }
}
