//! `Expr` -> SQLite compiler.
//!
//! Canonical values are computed inside SQLite with the `tally_*` scalar functions
//! registered in `functions`, which call the same coercion helpers as the in-memory
//! evaluator. Every user-supplied value is a bound parameter.

use rusqlite::types::Value as SqlValue;
use tally_core::{Expr, FieldKind, FieldSpec, SetMatch};

/// Alias of `catalog_rows` in every generated statement.
pub const ROW: &str = "r";

/// A SQL fragment plus its positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>) -> Self { Self { sql: sql.into(), params: Vec::new() } }

    fn with(sql: String, params: Vec<SqlValue>) -> Self { Self { sql, params } }

    /// Join fragments with `sep`, concatenating parameters in order.
    pub fn join(parts: Vec<Fragment>, sep: &str) -> Fragment {
        let mut sql = Vec::with_capacity(parts.len());
        let mut params = Vec::new();
        for p in parts {
            sql.push(p.sql);
            params.extend(p.params);
        }
        Fragment { sql: sql.join(sep), params }
    }
}

fn quote_path(path: &str) -> String { format!("'$.{}'", path.replace('\'', "''")) }

/// A source path's scalar value, or NULL when the JSON value there is not a string or number.
fn source(path: &str) -> String {
    let p = quote_path(path);
    format!("CASE WHEN json_type({ROW}.data, {p}) IN ('text', 'integer', 'real') THEN json_extract({ROW}.data, {p}) END")
}

fn coalesce(parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_else(|| "NULL".into())
    } else {
        format!("COALESCE({})", parts.join(", "))
    }
}

fn lit(f: f64) -> String { format!("{:?}", f) }

/// Canonical number, scaled.
pub fn canon_num(field: &FieldSpec) -> String {
    let raw = coalesce(field.sources.iter().map(|p| format!("tally_num({})", source(p))).collect());
    if field.scale == 1.0 { raw } else { format!("({} * {})", raw, lit(field.scale)) }
}

/// Canonical text; numeric fields render their canonical number.
pub fn canon_text(field: &FieldSpec) -> String {
    match field.kind {
        FieldKind::Number => format!("tally_text({})", canon_num(field)),
        FieldKind::TextList => "NULL".into(),
        FieldKind::Text | FieldKind::Timestamp => {
            coalesce(field.sources.iter().map(|p| format!("tally_text({})", source(p))).collect())
        }
    }
}

pub fn canon_ts(field: &FieldSpec) -> String {
    coalesce(field.sources.iter().map(|p| format!("tally_ts({})", source(p))).collect())
}

/// `EXISTS` over the string members of one array source, with an optional extra predicate on `j.value`.
fn list_exists(path: &str, member: Option<&str>) -> String {
    let p = quote_path(path);
    let extra = member.map(|m| format!(" AND {}", m)).unwrap_or_default();
    format!(
        "(json_type({ROW}.data, {p}) = 'array' AND EXISTS (SELECT 1 FROM json_each({ROW}.data, {p}) j WHERE j.type = 'text'{extra}))"
    )
}

/// True when the row has at least one string member in any source of a list field.
pub fn list_present(field: &FieldSpec) -> String {
    let parts: Vec<String> = field.sources.iter().map(|p| list_exists(p, None)).collect();
    format!("({})", parts.join(" OR "))
}

fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

pub fn compile(expr: &Expr<'_>) -> Fragment {
    match expr {
        Expr::True => Fragment::new("1"),
        Expr::And(parts) if parts.is_empty() => Fragment::new("1"),
        Expr::Or(parts) if parts.is_empty() => Fragment::new("0"),
        Expr::And(parts) => {
            let f = Fragment::join(parts.iter().map(compile).collect(), " AND ");
            Fragment::with(format!("({})", f.sql), f.params)
        }
        Expr::Or(parts) => {
            let f = Fragment::join(parts.iter().map(compile).collect(), " OR ");
            Fragment::with(format!("({})", f.sql), f.params)
        }
        Expr::In { field, values } => {
            let lhs = match field.set_match {
                SetMatch::Folded => format!("tally_fold({})", canon_text(field)),
                SetMatch::Exact => canon_text(field),
            };
            Fragment::with(
                format!("({} IN ({}))", lhs, placeholders(values.len())),
                values.iter().map(|v| SqlValue::Text(v.clone())).collect(),
            )
        }
        Expr::InNum { field, values } => Fragment::with(
            format!("({} IN ({}))", canon_num(field), placeholders(values.len())),
            values.iter().map(|v| SqlValue::Real(*v)).collect(),
        ),
        Expr::Contains { field, needle } => Fragment::with(
            format!("(instr(tally_fold({}), ?) > 0)", canon_text(field)),
            vec![SqlValue::Text(needle.clone())],
        ),
        Expr::Equals { field, value } => Fragment::with(
            format!("(tally_fold({}) = ?)", canon_text(field)),
            vec![SqlValue::Text(value.clone())],
        ),
        Expr::Range { field, min, max } => {
            let c = canon_num(field);
            match max {
                Some(m) => Fragment::with(
                    format!("({c} IS NULL OR ({c} >= ? AND {c} <= ?))"),
                    vec![SqlValue::Real(*min), SqlValue::Real(*m)],
                ),
                None => Fragment::with(format!("({c} IS NULL OR {c} >= ?)"), vec![SqlValue::Real(*min)]),
            }
        }
        Expr::Between { field, from, to } => {
            let c = canon_ts(field);
            Fragment::with(
                format!("({c} IS NULL OR ({c} >= ? AND {c} <= ?))"),
                vec![SqlValue::Integer(*from), SqlValue::Integer(*to)],
            )
        }
        Expr::ListHas { field, tag } => {
            let parts: Vec<String> = field.sources.iter().map(|p| list_exists(p, Some("tally_fold(j.value) = ?"))).collect();
            Fragment::with(
                format!("({})", parts.join(" OR ")),
                field.sources.iter().map(|_| SqlValue::Text(tag.clone())).collect(),
            )
        }
        Expr::Search { fields, needle } => {
            let joined: Vec<String> = fields.iter().map(|f| format!("COALESCE({}, '')", canon_text(f))).collect();
            let hay = if joined.is_empty() { "''".to_string() } else { joined.join(" || ' ' || ") };
            Fragment::with(format!("(instr(tally_fold({}), ?) > 0)", hay), vec![SqlValue::Text(needle.clone())])
        }
    }
}

/// The value a field sorts by: folded text, canonical number or epoch millis.
pub fn sort_value(field: &FieldSpec) -> String {
    match field.kind {
        FieldKind::Number => canon_num(field),
        FieldKind::Text | FieldKind::TextList => format!("tally_fold({})", canon_text(field)),
        FieldKind::Timestamp => canon_ts(field),
    }
}

/// `ORDER BY` body: nulls last, the optional unbounded group, the value, then the tie-break.
pub fn order_by(field: &FieldSpec, descending: bool) -> String {
    let v = sort_value(field);
    let dir = if descending { "DESC" } else { "ASC" };
    let mut keys = vec![format!("({v} IS NULL)")];
    match field.unbounded_at {
        Some(at) if field.kind == FieldKind::Number => {
            let at = lit(at);
            let (inside, outside) = if descending { (0, 1) } else { (1, 0) };
            keys.push(format!("(CASE WHEN {v} >= {at} THEN {inside} ELSE {outside} END)"));
            keys.push(format!("(CASE WHEN {v} >= {at} THEN NULL ELSE {v} END) {dir}"));
        }
        _ => keys.push(format!("{v} {dir}")),
    }
    keys.push(format!("{ROW}.stable_key ASC"));
    keys.push(format!("{ROW}.id ASC"));
    keys.join(", ")
}
