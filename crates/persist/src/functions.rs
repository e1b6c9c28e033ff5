//! SQL scalar functions backed by `tally_core::coerce`.

use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tally_core::coerce;

fn as_text(v: ValueRef<'_>) -> Option<&str> {
    match v {
        ValueRef::Text(t) => std::str::from_utf8(t).ok(),
        _ => None,
    }
}

pub fn num(v: ValueRef<'_>) -> Option<f64> {
    match v {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f).filter(|f| f.is_finite()),
        ValueRef::Text(_) => as_text(v).and_then(coerce::parse_num),
        _ => None,
    }
}

pub fn text(v: ValueRef<'_>) -> Option<String> {
    match v {
        ValueRef::Text(_) => as_text(v).map(str::to_string),
        ValueRef::Integer(i) => Some(coerce::fmt_num(i as f64)),
        ValueRef::Real(f) if f.is_finite() => Some(coerce::fmt_num(f)),
        _ => None,
    }
}

pub fn ts(v: ValueRef<'_>) -> Option<i64> {
    match v {
        ValueRef::Integer(i) => Some(i),
        ValueRef::Real(f) if f.is_finite() => Some(f as i64),
        ValueRef::Text(_) => as_text(v).and_then(coerce::parse_ts),
        _ => None,
    }
}

/// Register `tally_num`, `tally_text`, `tally_fold` and `tally_ts` on a connection.
pub fn register(db: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;
    db.create_scalar_function("tally_num", 1, flags, |ctx| Ok(num(ctx.get_raw(0))))?;
    db.create_scalar_function("tally_text", 1, flags, |ctx| Ok(text(ctx.get_raw(0))))?;
    db.create_scalar_function("tally_fold", 1, flags, |ctx| Ok(as_text(ctx.get_raw(0)).map(coerce::fold)))?;
    db.create_scalar_function("tally_ts", 1, flags, |ctx| Ok(ts(ctx.get_raw(0))))?;
    Ok(())
}
