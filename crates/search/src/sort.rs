//! Deterministic ordering: canonical value, nulls last, stable_key then id as tie-break.

use std::cmp::Ordering;

use tally_core::coerce::fold;
use tally_core::{CatalogSchema, CoreError, FieldKind, FieldSpec, Row, SortState};

#[derive(Debug, Clone, PartialEq)]
pub enum SortValue {
    Num(f64),
    Text(String),
    Ts(i64),
}

impl SortValue {
    fn cmp(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Num(a), SortValue::Num(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Ts(a), SortValue::Ts(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

/// Placement group. Lower groups come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Group {
    First,
    Second,
    Missing,
}

#[derive(Debug, Clone)]
pub struct SortKey {
    group: Group,
    /// `None` inside the unbounded group so ties fall through to the tie-break.
    value: Option<SortValue>,
    descending: bool,
}

pub fn sort_value(field: &FieldSpec, data: &serde_json::Value) -> Option<SortValue> {
    match field.kind {
        FieldKind::Number => field.canonical_num(data).map(SortValue::Num),
        FieldKind::Text => field.canonical_text(data).map(|t| SortValue::Text(fold(&t))),
        FieldKind::Timestamp => field.canonical_ts(data).map(SortValue::Ts),
        FieldKind::TextList => None,
    }
}

pub fn key_for(field: &FieldSpec, descending: bool, data: &serde_json::Value) -> SortKey {
    let value = sort_value(field, data);
    let unbounded = match (&value, field.unbounded_at) {
        (Some(SortValue::Num(n)), Some(at)) => *n >= at,
        _ => false,
    };
    let group = match (&value, unbounded, descending) {
        (None, _, _) => Group::Missing,
        (Some(_), true, false) => Group::Second,
        (Some(_), true, true) => Group::First,
        (Some(_), false, false) => Group::First,
        (Some(_), false, true) => Group::Second,
    };
    SortKey { group, value: if unbounded { None } else { value }, descending }
}

pub fn compare(a: &SortKey, ak: (&str, &str), b: &SortKey, bk: (&str, &str)) -> Ordering {
    a.group
        .cmp(&b.group)
        .then_with(|| match (&a.value, &b.value) {
            (Some(x), Some(y)) => {
                let o = x.cmp(y);
                if a.descending { o.reverse() } else { o }
            }
            _ => Ordering::Equal,
        })
        .then_with(|| ak.cmp(&bk))
}

pub fn sort_rows(schema: &CatalogSchema, sort: Option<&SortState>, rows: &mut Vec<&Row>) -> Result<(), CoreError> {
    let (field, descending) = schema.sort_spec(sort)?;
    let mut keyed: Vec<(SortKey, &Row)> = rows.iter().map(|r| (key_for(field, descending, &r.data), *r)).collect();
    keyed.sort_by(|(ka, ra), (kb, rb)| {
        compare(ka, (ra.stable_key.as_str(), ra.id.as_str()), kb, (rb.stable_key.as_str(), rb.id.as_str()))
    });
    *rows = keyed.into_iter().map(|(_, r)| r).collect();
    Ok(())
}
