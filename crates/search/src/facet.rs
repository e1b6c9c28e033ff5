//! In-memory facet grouping. Ordering and top-N live in `tally_core::facet::finalize`.

use rustc_hash::FxHashMap;
use tally_core::facet::{finalize, Facet, FacetValue, Facets};
use tally_core::{CatalogSchema, FieldKind, FieldSpec, Row};

#[derive(Hash, PartialEq, Eq)]
enum GroupKey {
    Num(u64),
    Text(String),
}

fn facet_for(field: &FieldSpec, rows: &[Row]) -> Facet {
    let mut groups: FxHashMap<GroupKey, (FacetValue, u64)> = FxHashMap::default();
    let mut missing = 0u64;
    let mut bump = |key: GroupKey, value: FacetValue| {
        groups.entry(key).or_insert((value, 0)).1 += 1;
    };
    for r in rows {
        match field.kind {
            FieldKind::Number => match field.canonical_num(&r.data) {
                // -0.0 and 0.0 group together
                Some(n) => bump(GroupKey::Num((n + 0.0).to_bits()), FacetValue::Number(n + 0.0)),
                None => missing += 1,
            },
            FieldKind::TextList => {
                let tags = field.list_values(&r.data);
                if tags.is_empty() {
                    missing += 1;
                }
                for t in tags {
                    bump(GroupKey::Text(t.clone()), FacetValue::Text(t));
                }
            }
            FieldKind::Text | FieldKind::Timestamp => match field.canonical_text(&r.data) {
                Some(t) => bump(GroupKey::Text(t.clone()), FacetValue::Text(t)),
                None => missing += 1,
            },
        }
    }
    let mut counts: Vec<(Option<FacetValue>, u64)> = groups.into_values().map(|(v, c)| (Some(v), c)).collect();
    if missing > 0 {
        counts.push((None, missing));
    }
    finalize(field, counts, rows.len() as u64)
}

/// Facets for every facet-enabled field over `rows` (the full dataset).
pub fn compute(schema: &CatalogSchema, rows: &[Row]) -> Facets {
    schema.facet_fields().map(|f| (f.name.clone(), facet_for(f, rows))).collect()
}
