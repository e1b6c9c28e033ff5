//! Value coercion for semi-structured rows.
//!
//! The SQLite backend registers these same functions as SQL scalars, so the in-memory
//! evaluator and the compiled query agree on what a "number", "text" or "timestamp" is.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Resolve a dotted path (`pricing.prompt`) inside a JSON object. JSON `null` counts as absent.
pub fn lookup<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = data;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    if cur.is_null() { None } else { Some(cur) }
}

/// Number coercion: JSON numbers, or strings that parse completely as a finite number.
pub fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => parse_num(s),
        _ => None,
    }
}

pub fn parse_num(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() { return None; }
    // reject the textual specials f64::from_str accepts
    if t.bytes().any(|b| b.is_ascii_alphabetic() && b != b'e' && b != b'E') { return None; }
    t.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Scalar text: strings as-is, numbers in shortest form. Booleans, arrays and objects are not text.
pub fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(fmt_num),
        _ => None,
    }
}

/// Shortest decimal rendering; integral values print without a fraction.
pub fn fmt_num(f: f64) -> String {
    if f == 0.0 { return "0".to_string(); }
    if f.fract() == 0.0 && f.abs() < 1e15 { format!("{}", f as i64) } else { format!("{}", f) }
}

/// Case folding used for set matching, substring search and text ordering.
pub fn fold(s: &str) -> String { s.trim().to_lowercase() }

/// Timestamp coercion to epoch milliseconds.
pub fn ts_millis(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => parse_ts(s),
        _ => None,
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS`, a bare date, or integer epoch millis.
pub fn parse_ts(s: &str) -> Option<i64> {
    let t = s.trim();
    if t.is_empty() { return None; }
    if let Ok(ms) = t.parse::<i64>() { return Some(ms); }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) { return Some(dt.timestamp_millis()); }
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(dt.and_utc().timestamp_millis());
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp_millis());
    }
    None
}

pub fn millis_to_utc(ms: i64) -> Option<DateTime<Utc>> { DateTime::<Utc>::from_timestamp_millis(ms) }
