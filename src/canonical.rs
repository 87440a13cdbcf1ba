//! Canonical JSON encoding used for every digest in the audit trail.
//!
//! The byte layout is fixed here rather than left to an encoder: object keys are sorted,
//! no whitespace is emitted, integral floats are written as integers and other floats in
//! their shortest round-trip form. Two payloads that are logically equal always produce
//! the same bytes and therefore the same SHA-256.
use serde_json::{Map, Number, Value};
use std::fmt::Write;

/// Largest magnitude written as an integer when a float has no fractional part.
const INTEGRAL_FLOAT_LIMIT: f64 = 1e15;

pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// SHA-256 hex over the canonical encoding of a map-valued payload.
pub fn digest_payload(payload: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(payload, &mut out);
    sha256::digest(out)
}

pub fn digest_value(value: &Value) -> String {
    sha256::digest(to_canonical_string(value))
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push('{');
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}

fn is_integral(f: f64) -> bool {
    f.fract() == 0.0 && f.abs() < INTEGRAL_FLOAT_LIMIT
}

/// `Number` for a parsed float. Integral values are stored as integers, so any JSON
/// serializer writes them exactly as the canonical encoding does.
pub fn number_from_f64(f: f64) -> Option<Number> {
    if !f.is_finite() {
        return None;
    }
    if is_integral(f) {
        return Some(Number::from(f as i64));
    }
    Number::from_f64(f)
}

fn write_number(n: &Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
    } else if let Some(f) = n.as_f64() {
        if is_integral(f) {
            let _ = write!(out, "{}", f as i64);
        } else {
            // shortest round-trip form, exponent notation for very large or small
            // magnitudes (`1e300`, `1.5e-7`)
            let text = n.to_string();
            out.push_str(text.strip_suffix(".0").unwrap_or(&text));
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
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

    fn as_map(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn keys_are_sorted_without_whitespace() {
        let v = json!({"b": [1, 2, {"z": null, "a": true}], "a": "x"});
        assert_eq!(
            to_canonical_string(&v),
            r#"{"a":"x","b":[1,2,{"a":true,"z":null}]}"#
        );
    }

    #[test]
    fn integral_floats_are_written_as_integers() {
        assert_eq!(to_canonical_string(&json!(10.0)), "10");
        assert_eq!(to_canonical_string(&json!(-3.0)), "-3");
        assert_eq!(to_canonical_string(&json!(2.5)), "2.5");
        assert_eq!(to_canonical_string(&json!(0.1)), "0.1");
    }

    #[test]
    fn extreme_floats_use_exponent_form() {
        assert_eq!(to_canonical_string(&json!(1e300)), "1e300");
        assert_eq!(to_canonical_string(&json!(1.5e-7)), "1.5e-7");
        assert_eq!(to_canonical_string(&json!(-2.5e20)), "-2.5e20");
        assert_eq!(to_canonical_string(&json!(123.456)), "123.456");
        assert_eq!(to_canonical_string(&json!(4e15)), "4000000000000000");
    }

    #[test]
    fn parsed_integral_floats_become_integer_numbers() {
        let ten = number_from_f64(10.0).unwrap();
        assert_eq!(ten.as_i64(), Some(10));
        assert_eq!(serde_json::to_string(&ten).unwrap(), "10");
        assert_eq!(number_from_f64(2.5).and_then(|n| n.as_f64()), Some(2.5));
        assert_eq!(number_from_f64(1e300).and_then(|n| n.as_i64()), None);
        assert!(number_from_f64(f64::NAN).is_none());
        assert!(number_from_f64(f64::INFINITY).is_none());
    }

    #[test]
    fn strings_are_escaped() {
        assert_eq!(
            to_canonical_string(&json!("a\"b\\c\nd\u{01}é")),
            "\"a\\\"b\\\\c\\nd\\u0001é\""
        );
    }

    #[test]
    fn digest_ignores_insertion_order() {
        let a = as_map(json!({"a": 1, "b": 2}));
        let mut b = Map::new();
        b.insert("b".into(), json!(2));
        b.insert("a".into(), json!(1));

        assert_eq!(digest_payload(&a), digest_payload(&b));
        assert_ne!(digest_payload(&a), digest_payload(&as_map(json!({"a": 1, "b": 3}))));
    }

    #[test]
    fn digest_payload_matches_digest_value() {
        let m = as_map(json!({"k": [1, "two"]}));
        assert_eq!(digest_payload(&m), digest_value(&Value::Object(m.clone())));
    }
}
