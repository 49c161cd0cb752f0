//! Canonical JSON: the exact byte input to every transport signature.
//!
//! Object keys are sorted at every depth, arrays keep their order, and no
//! insignificant whitespace is emitted. Keys are ordered by UTF-16 code units
//! and numbers are rendered the way ECMAScript's `JSON.stringify` renders
//! them, so peers written against a JavaScript canonicalizer produce the same
//! bytes.

use crate::utils::Result;
use serde::Serialize;
use serde_json::{Number, Value};
use std::fmt::Write;

/// Canonicalize a JSON value into its signing string
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical UTF-8 bytes of a JSON value
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonicalize(value).into_bytes()
}

/// Canonicalize any serializable value
pub fn canonicalize_serializable<T: Serialize>(value: &T) -> Result<String> {
    Ok(canonicalize(&serde_json::to_value(value)?))
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
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
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &Number) {
    if n.is_i64() || n.is_u64() {
        out.push_str(&n.to_string());
        return;
    }

    let Some(f) = n.as_f64() else {
        out.push_str(&n.to_string());
        return;
    };

    if f == 0.0 {
        out.push('0');
    } else if f.fract() == 0.0 && f.abs() < 1e21 {
        let _ = write!(out, "{f:.0}");
    } else {
        let repr = n.to_string();
        match shortest_digits(&repr) {
            Some((negative, digits, point)) => write_ecmascript(out, negative, &digits, point),
            None => out.push_str(&repr),
        }
    }
}

/// Split a shortest round-trip rendering into sign, significant digits and
/// the decimal point position, so that the value is `0.DIGITS * 10^point`
fn shortest_digits(repr: &str) -> Option<(bool, String, i32)> {
    let (negative, unsigned) = match repr.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, repr),
    };
    let (mantissa, exponent) = match unsigned.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<i32>().ok()?),
        None => (unsigned, 0),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let mut point = i32::try_from(int.len()).ok()? + exponent;

    let all: String = int.chars().chain(frac.chars()).collect();
    let trimmed = all.trim_start_matches('0');
    point -= i32::try_from(all.len() - trimmed.len()).ok()?;
    let digits = trimmed.trim_end_matches('0');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((negative, digits.to_string(), point))
}

/// ECMAScript `Number::toString` layout for non-integral values
fn write_ecmascript(out: &mut String, negative: bool, digits: &str, point: i32) {
    if negative {
        out.push('-');
    }
    let k = i32::try_from(digits.len()).unwrap_or(i32::MAX);
    if k <= point && point <= 21 {
        out.push_str(digits);
        out.extend(std::iter::repeat('0').take((point - k) as usize));
    } else if 0 < point && point <= 21 {
        let (head, tail) = digits.split_at(point as usize);
        out.push_str(head);
        out.push('.');
        out.push_str(tail);
    } else if -6 < point && point <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take((-point) as usize));
        out.push_str(digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        let exponent = point - 1;
        let _ = write!(out, "e{}{}", if exponent < 0 { '-' } else { '+' }, exponent.abs());
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nested_keys_sorted() {
        let value = json!({"b": 1, "a": {"d": [3, {"z": 1, "y": 2}], "c": "x"}});
        assert_eq!(
            canonicalize(&value),
            r#"{"a":{"c":"x","d":[3,{"y":2,"z":1}]},"b":1}"#
        );
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"user_id":"u","meta":{"x":1,"a":[1,2]},"server_id":"s"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"server_id":"s","meta":{"a":[1,2],"x":1},"user_id":"u"}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[test]
    fn test_idempotent_through_reparse() {
        let value = json!({
            "ciphertext": "AbC-_9",
            "n": [1, 2.5, -3, null, true],
            "nested": {"k": {"j": "v"}}
        });
        let first = canonicalize(&value);
        let reparsed: Value = serde_json::from_str(&first).unwrap();
        assert_eq!(first, canonicalize(&reparsed));
    }

    #[test]
    fn test_array_order_preserved() {
        assert_eq!(canonicalize(&json!([3, 1, 2])), "[3,1,2]");
    }

    #[test]
    fn test_string_escaping_matches_json_stringify() {
        let value = json!("line\nbreak\t\"q\" \\ \u{0001}\u{001f} é");
        assert_eq!(
            canonicalize(&value),
            "\"line\\nbreak\\t\\\"q\\\" \\\\ \\u0001\\u001f é\""
        );
    }

    #[test]
    fn test_keys_sorted_by_utf16_code_units() {
        // U+E000 sorts before U+1F600 bytewise but after it in UTF-16.
        let value = json!({"\u{e000}": 1, "\u{1f600}": 2, "a": 0});
        assert_eq!(canonicalize(&value), "{\"a\":0,\"\u{1f600}\":2,\"\u{e000}\":1}");
    }

    #[test]
    fn test_numbers_render_like_ecmascript() {
        assert_eq!(canonicalize(&json!(1.0)), "1");
        assert_eq!(canonicalize(&json!(-0.0)), "0");
        assert_eq!(canonicalize(&json!(2.5)), "2.5");
        assert_eq!(canonicalize(&json!(1e21)), "1e+21");
        assert_eq!(canonicalize(&json!(1.5e300)), "1.5e+300");
        assert_eq!(canonicalize(&json!(1700000000000_i64)), "1700000000000");
    }

    #[test]
    fn test_small_fractions_render_in_plain_decimal() {
        assert_eq!(canonicalize(&json!(1e-6)), "0.000001");
        assert_eq!(canonicalize(&json!(-2.5e-5)), "-0.000025");
        assert_eq!(canonicalize(&json!(0.1)), "0.1");
        assert_eq!(canonicalize(&json!(1.25e-7)), "1.25e-7");
        assert_eq!(canonicalize(&json!(123.456)), "123.456");
    }

    #[test]
    fn test_decimal_parts() {
        assert_eq!(shortest_digits("1e-6"), Some((false, "1".to_string(), -5)));
        assert_eq!(shortest_digits("-0.00125"), Some((true, "125".to_string(), -2)));
        assert_eq!(shortest_digits("1.5e300"), Some((false, "15".to_string(), 301)));
        assert_eq!(shortest_digits("NaN"), None);
    }

    #[test]
    fn test_empty_containers() {
        assert_eq!(canonicalize(&json!({})), "{}");
        assert_eq!(canonicalize(&json!({"a": [], "b": {}})), r#"{"a":[],"b":{}}"#);
    }

    #[test]
    fn test_serializable_input() {
        #[derive(Serialize)]
        struct Hello {
            url: String,
            pubkey_b64url: String,
        }
        let hello = Hello {
            url: "ws://127.0.0.1:7081".to_string(),
            pubkey_b64url: "abc".to_string(),
        };
        assert_eq!(
            canonicalize_serializable(&hello).unwrap(),
            r#"{"pubkey_b64url":"abc","url":"ws://127.0.0.1:7081"}"#
        );
    }
}
