//! Facet result types and the ordering/truncation step shared by both backends.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::coerce::fold;
use crate::fields::{FacetOrder, FieldKind, FieldSpec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacetValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetRow {
    /// `None` is the bucket of rows lacking the dimension.
    pub value: Option<FacetValue>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Facet {
    pub rows: Vec<FacetRow>,
    /// Dataset row count.
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Facet {
    pub fn count_of(&self, value: &str) -> Option<u64> {
        self.rows.iter().find_map(|r| match &r.value {
            Some(FacetValue::Text(t)) if t == value => Some(r.count),
            _ => None,
        })
    }

    pub fn count_of_num(&self, value: f64) -> Option<u64> {
        self.rows.iter().find_map(|r| match &r.value {
            Some(FacetValue::Number(n)) if *n == value => Some(r.count),
            _ => None,
        })
    }

    pub fn missing(&self) -> u64 { self.rows.iter().filter(|r| r.value.is_none()).map(|r| r.count).sum() }

    pub fn sum(&self) -> u64 { self.rows.iter().map(|r| r.count).sum() }
}

pub type Facets = BTreeMap<String, Facet>;

fn cmp_value(a: &FacetValue, b: &FacetValue) -> Ordering {
    match (a, b) {
        (FacetValue::Number(x), FacetValue::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (FacetValue::Text(x), FacetValue::Text(y)) => fold(x).cmp(&fold(y)).then_with(|| x.cmp(y)),
        (FacetValue::Number(_), FacetValue::Text(_)) => Ordering::Less,
        (FacetValue::Text(_), FacetValue::Number(_)) => Ordering::Greater,
    }
}

fn priority_of(list: &[String], v: &FacetValue) -> usize {
    match v {
        FacetValue::Text(t) => {
            let f = fold(t);
            list.iter().position(|p| fold(p) == f).unwrap_or(usize::MAX)
        }
        FacetValue::Number(_) => usize::MAX,
    }
}

/// Order value rows per the field's facet spec, apply top-N, and append the missing bucket.
///
/// `counts` holds one entry per distinct canonical value; `None` entries are rows without one.
pub fn finalize(spec: &FieldSpec, counts: Vec<(Option<FacetValue>, u64)>, total: u64) -> Facet {
    let mut missing = 0u64;
    let mut rows: Vec<(FacetValue, u64)> = Vec::with_capacity(counts.len());
    for (v, c) in counts {
        match v {
            Some(v) => rows.push((v, c)),
            None => missing += c,
        }
    }

    let (mut min, mut max) = (None::<f64>, None::<f64>);
    if spec.kind == FieldKind::Number {
        for (v, _) in &rows {
            if let FacetValue::Number(n) = v {
                min = Some(min.map_or(*n, |m: f64| m.min(*n)));
                max = Some(max.map_or(*n, |m: f64| m.max(*n)));
            }
        }
    }

    let order = spec.facet.as_ref().map(|f| f.order.clone()).unwrap_or(FacetOrder::ValueAsc);
    match &order {
        FacetOrder::Priority(list) => rows.sort_by(|a, b| {
            priority_of(list, &a.0).cmp(&priority_of(list, &b.0)).then_with(|| cmp_value(&a.0, &b.0))
        }),
        FacetOrder::CountDesc => rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| cmp_value(&a.0, &b.0))),
        FacetOrder::ValueAsc => rows.sort_by(|a, b| cmp_value(&a.0, &b.0)),
    }

    if let Some(top) = spec.facet.as_ref().and_then(|f| f.top) {
        if rows.len() > top {
            missing += rows[top..].iter().map(|(_, c)| *c).sum::<u64>();
            rows.truncate(top);
        }
    }

    let mut out: Vec<FacetRow> = rows.into_iter().map(|(v, c)| FacetRow { value: Some(v), count: c }).collect();
    if missing > 0 {
        out.push(FacetRow { value: None, count: missing });
    }
    Facet { rows: out, total, min, max }
}
