//! XML entity decoding
//!
//! Handles the five built-in entities (&lt; &gt; &amp; &quot; &apos;) and
//! numeric character references (&#123; &#x7B;). Unknown entity names are
//! passed through verbatim, which is the safer choice for model output.
//!
//! Uses Cow for zero-copy when no entities are present.

use memchr::memchr;
use std::borrow::Cow;

/// Decode text content, handling entity references.
///
/// Returns Borrowed if no entities are present (zero-copy),
/// returns Owned if entities were decoded.
#[inline]
pub fn decode_text(input: &[u8]) -> Cow<'_, [u8]> {
    if memchr(b'&', input).is_none() {
        return Cow::Borrowed(input);
    }
    Cow::Owned(decode_entities(input))
}

/// Decode all entity references in the input.
pub fn decode_entities(input: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(input.len());
    let mut pos = 0;

    while pos < input.len() {
        if let Some(amp_pos) = memchr(b'&', &input[pos..]) {
            // Copy everything before the entity
            result.extend_from_slice(&input[pos..pos + amp_pos]);
            pos += amp_pos;

            // Find the semicolon
            if let Some(semi_offset) = memchr(b';', &input[pos..]) {
                let entity = &input[pos + 1..pos + semi_offset];

                if let Some(decoded) = decode_entity(entity) {
                    result.extend_from_slice(decoded.as_bytes());
                    pos += semi_offset + 1;
                } else if entity.first() == Some(&b'#') {
                    if let Some(c) = decode_numeric_char(&entity[1..]) {
                        let mut buf = [0u8; 4];
                        result.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        pos += semi_offset + 1;
                    } else {
                        // Malformed reference, keep as-is
                        result.push(b'&');
                        pos += 1;
                    }
                } else {
                    // Unknown entity, keep as-is
                    result.push(b'&');
                    pos += 1;
                }
            } else {
                // No semicolon found, keep the ampersand
                result.push(b'&');
                pos += 1;
            }
        } else {
            // No more entities, copy the rest
            result.extend_from_slice(&input[pos..]);
            break;
        }
    }

    result
}

/// Decode a single named entity (without & and ;)
fn decode_entity(entity: &[u8]) -> Option<&'static str> {
    match entity {
        b"lt" => Some("<"),
        b"gt" => Some(">"),
        b"amp" => Some("&"),
        b"quot" => Some("\""),
        b"apos" => Some("'"),
        _ => None,
    }
}

/// Decode the body of a numeric character reference (after `&#`).
pub fn decode_numeric_char(entity: &[u8]) -> Option<char> {
    if entity.is_empty() {
        return None;
    }
    let codepoint = if entity[0] == b'x' || entity[0] == b'X' {
        let hex = std::str::from_utf8(&entity[1..]).ok()?;
        u32::from_str_radix(hex, 16).ok()?
    } else {
        let dec = std::str::from_utf8(entity).ok()?;
        dec.parse::<u32>().ok()?
    };
    char::from_u32(codepoint)
}

/// Check whether a byte run ending the buffer could be the prefix of an
/// entity reference that is still arriving. Returns the offset of the `&`
/// to hold back, or None when the tail is safe to emit.
///
/// Entity references are short; anything longer than `MAX_ENTITY_LEN`
/// bytes after the `&` cannot be one and is flushed as literal text.
pub fn partial_entity_start(input: &[u8]) -> Option<usize> {
    const MAX_ENTITY_LEN: usize = 12;

    let start = input.len().saturating_sub(MAX_ENTITY_LEN);
    let amp = memchr::memrchr(b'&', &input[start..]).map(|i| start + i)?;
    let tail = &input[amp + 1..];
    if memchr(b';', tail).is_some() {
        // The last reference is already terminated
        return None;
    }
    // Everything after '&' must still look like an entity body
    let body_ok = match tail.first() {
        None => true,
        Some(&b'#') => tail[1..]
            .iter()
            .all(|&b| b.is_ascii_hexdigit() || b == b'x' || b == b'X'),
        Some(_) => tail.iter().all(|&b| b.is_ascii_alphanumeric()),
    };
    if body_ok {
        Some(amp)
    } else {
        None
    }
}
