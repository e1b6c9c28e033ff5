//! Predicate tree over canonical fields.
//!
//! `lower` turns a `FilterState` into an `Expr`. The in-memory evaluator and the SQL
//! compiler both walk this tree, so filter semantics are written once.

use crate::coerce::{self, fold};
use crate::fields::{CatalogSchema, FieldKind, FieldSpec, ScalarMatch, SetMatch};
use crate::filter::{FilterState, FilterValue, ModalityDirection};
use crate::CoreError;

/// A range max at or above this value means "or higher".
pub const OPEN_ENDED_MAX_SENTINEL: f64 = 1_000_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr<'a> {
    True,
    And(Vec<Expr<'a>>),
    Or(Vec<Expr<'a>>),
    /// Text equality against any value. Values are pre-folded for `SetMatch::Folded` fields.
    In { field: &'a FieldSpec, values: Vec<String> },
    /// Numeric equality against any value.
    InNum { field: &'a FieldSpec, values: Vec<f64> },
    /// Case-insensitive substring; `needle` is folded.
    Contains { field: &'a FieldSpec, needle: String },
    /// Case-insensitive equality; `value` is folded.
    Equals { field: &'a FieldSpec, value: String },
    /// Inclusive numeric range; rows without a value pass.
    Range { field: &'a FieldSpec, min: f64, max: Option<f64> },
    /// Inclusive epoch-millis range; rows without a value pass.
    Between { field: &'a FieldSpec, from: i64, to: i64 },
    /// A list field contains `tag` (folded equality).
    ListHas { field: &'a FieldSpec, tag: String },
    /// Folded substring of the space-joined canonical text of `fields`.
    Search { fields: Vec<&'a FieldSpec>, needle: String },
}

impl<'a> Expr<'a> {
    fn all(mut parts: Vec<Expr<'a>>) -> Expr<'a> {
        parts.retain(|e| *e != Expr::True);
        match parts.len() {
            0 => Expr::True,
            1 => parts.pop().unwrap_or(Expr::True),
            _ => Expr::And(parts),
        }
    }

    fn any(mut parts: Vec<Expr<'a>>) -> Expr<'a> {
        match parts.len() {
            1 => parts.pop().unwrap_or(Expr::True),
            _ => Expr::Or(parts),
        }
    }

    pub fn is_true(&self) -> bool { matches!(self, Expr::True) }
}

fn shape_err(field: &FieldSpec, value: &FilterValue) -> CoreError {
    CoreError::FilterShape { field: field.name.clone(), shape: value.shape() }
}

fn lower_field<'a>(field: &'a FieldSpec, value: &FilterValue) -> Result<Expr<'a>, CoreError> {
    let e = match (field.kind, value) {
        (FieldKind::Text | FieldKind::Timestamp, FilterValue::Set(vs)) => {
            let values: Vec<String> = vs
                .iter()
                .filter(|v| !v.trim().is_empty())
                .map(|v| match field.set_match { SetMatch::Folded => fold(v), SetMatch::Exact => v.clone() })
                .collect();
            if values.is_empty() { Expr::True } else { Expr::In { field, values } }
        }
        (FieldKind::Number, FilterValue::Set(vs)) => {
            let values: Vec<f64> = vs.iter().filter_map(|v| coerce::parse_num(v)).collect();
            if values.is_empty() { Expr::True } else { Expr::InNum { field, values } }
        }
        (FieldKind::Text | FieldKind::Number, FilterValue::Scalar(s)) => {
            if s.trim().is_empty() {
                Expr::True
            } else {
                match field.scalar_match {
                    ScalarMatch::Substring => Expr::Contains { field, needle: fold(s) },
                    ScalarMatch::Exact => Expr::Equals { field, value: fold(s) },
                }
            }
        }
        (FieldKind::Number, FilterValue::Range(a, b)) => {
            let (min, max) = if a <= b { (*a, *b) } else { (*b, *a) };
            let max = if max >= OPEN_ENDED_MAX_SENTINEL { None } else { Some(max) };
            Expr::Range { field, min, max }
        }
        (FieldKind::Timestamp, FilterValue::DateRange(a, b)) => {
            let (from, to) = (a.timestamp_millis(), b.timestamp_millis());
            Expr::Between { field, from: from.min(to), to: from.max(to) }
        }
        (FieldKind::Timestamp, FilterValue::Range(a, b)) => {
            let (from, to) = (*a as i64, *b as i64);
            Expr::Between { field, from: from.min(to), to: from.max(to) }
        }
        (FieldKind::TextList, FilterValue::Set(vs)) => {
            let parts: Vec<Expr<'a>> = vs
                .iter()
                .filter(|v| !v.trim().is_empty())
                .map(|v| Expr::ListHas { field, tag: fold(v) })
                .collect();
            if parts.is_empty() { Expr::True } else { Expr::any(parts) }
        }
        (FieldKind::TextList, FilterValue::Scalar(s)) => {
            if s.trim().is_empty() { Expr::True } else { Expr::ListHas { field, tag: fold(s) } }
        }
        _ => return Err(shape_err(field, value)),
    };
    Ok(e)
}

/// Lower a filter state against a catalog schema.
pub fn lower<'a>(schema: &'a CatalogSchema, filter: &FilterState) -> Result<Expr<'a>, CoreError> {
    let mut parts: Vec<Expr<'a>> = Vec::with_capacity(filter.fields.len() + 2);
    for (name, value) in &filter.fields {
        let field = schema.require(name)?;
        parts.push(lower_field(field, value)?);
    }

    if let Some(needle) = filter.search.as_deref().map(fold).filter(|n| !n.is_empty()) {
        parts.push(Expr::Search { fields: schema.search_specs(), needle });
    }

    if !filter.modalities.is_empty() {
        let mf = schema
            .modality
            .as_ref()
            .ok_or_else(|| CoreError::UnknownField { catalog: schema.catalog, field: "modalities".into() })?;
        let input = schema.require(&mf.input)?;
        let output = schema.require(&mf.output)?;
        for m in &filter.modalities {
            let tag = fold(&m.tag);
            if tag.is_empty() { continue; }
            parts.push(match m.direction {
                ModalityDirection::Input => Expr::ListHas { field: input, tag },
                ModalityDirection::Output => Expr::ListHas { field: output, tag },
                ModalityDirection::Both => Expr::Or(vec![
                    Expr::ListHas { field: input, tag: tag.clone() },
                    Expr::ListHas { field: output, tag },
                ]),
            });
        }
    }

    Ok(Expr::all(parts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Catalog;

    #[test]
    fn empty_filter_lowers_to_true() {
        let s = Catalog::Gpu.schema();
        assert!(lower(&s, &FilterState::default()).unwrap().is_true());
    }

    #[test]
    fn open_ended_max_drops_upper_bound() {
        let s = Catalog::Gpu.schema();
        let f = FilterState::default().with("vram_gb", FilterValue::range(80.0, OPEN_ENDED_MAX_SENTINEL));
        match lower(&s, &f).unwrap() {
            Expr::Range { min, max, .. } => { assert_eq!(min, 80.0); assert_eq!(max, None); }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn folded_sets_are_lowercased() {
        let s = Catalog::Gpu.schema();
        let f = FilterState::default().with("gpu_model", FilterValue::set([" H100 "]));
        match lower(&s, &f).unwrap() {
            Expr::In { values, .. } => assert_eq!(values, vec!["h100".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let s = Catalog::Gpu.schema();
        let f = FilterState::default().with("provider", FilterValue::range(1.0, 2.0));
        assert!(matches!(lower(&s, &f), Err(CoreError::FilterShape { .. })));
        let f = FilterState::default().with("nope", FilterValue::Scalar("x".into()));
        assert!(matches!(lower(&s, &f), Err(CoreError::UnknownField { .. })));
    }

    #[test]
    fn modalities_need_a_model_schema() {
        let f = FilterState::default().with_modality("image", ModalityDirection::Both);
        assert!(lower(&Catalog::Gpu.schema(), &f).is_err());
        let s = Catalog::Model.schema();
        assert!(matches!(lower(&s, &f).unwrap(), Expr::Or(_)));
    }
}
