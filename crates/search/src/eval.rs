//! In-memory predicate evaluation over canonical values.

use serde_json::Value;
use tally_core::coerce::fold;
use tally_core::{Expr, SetMatch};

pub fn matches(expr: &Expr<'_>, data: &Value) -> bool {
    match expr {
        Expr::True => true,
        Expr::And(parts) => parts.iter().all(|e| matches(e, data)),
        Expr::Or(parts) => parts.iter().any(|e| matches(e, data)),
        Expr::In { field, values } => match field.canonical_text(data) {
            Some(t) => {
                let t = match field.set_match { SetMatch::Folded => fold(&t), SetMatch::Exact => t };
                values.iter().any(|v| *v == t)
            }
            None => false,
        },
        Expr::InNum { field, values } => field.canonical_num(data).map_or(false, |n| values.iter().any(|v| *v == n)),
        Expr::Contains { field, needle } => field.canonical_text(data).map_or(false, |t| fold(&t).contains(needle.as_str())),
        Expr::Equals { field, value } => field.canonical_text(data).map_or(false, |t| fold(&t) == *value),
        Expr::Range { field, min, max } => match field.canonical_num(data) {
            None => true,
            Some(n) => n >= *min && max.map_or(true, |m| n <= m),
        },
        Expr::Between { field, from, to } => match field.canonical_ts(data) {
            None => true,
            Some(t) => t >= *from && t <= *to,
        },
        Expr::ListHas { field, tag } => field.list_values(data).iter().any(|v| fold(v) == *tag),
        Expr::Search { fields, needle } => search_text(fields, data).contains(needle.as_str()),
    }
}

/// Folded, space-joined canonical text of the search fields. Missing values join as empty.
pub fn search_text(fields: &[&tally_core::FieldSpec], data: &Value) -> String {
    let joined = fields.iter().map(|f| f.canonical_text(data).unwrap_or_default()).collect::<Vec<_>>().join(" ");
    fold(&joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::{lower, Catalog, FilterState, FilterValue, ModalityDirection};

    fn eval(catalog: Catalog, f: &FilterState, data: &Value) -> bool {
        let schema = catalog.schema();
        let e = lower(&schema, f).unwrap();
        matches(&e, data)
    }

    #[test]
    fn ranges_keep_rows_without_a_value() {
        let f = FilterState::default().with("vram_gb", FilterValue::range(40.0, 90.0));
        assert!(eval(Catalog::Gpu, &f, &json!({"vram_gb": 80})));
        assert!(!eval(Catalog::Gpu, &f, &json!({"vram_gb": 24})));
        assert!(eval(Catalog::Gpu, &f, &json!({"provider": "lambda"})));
        assert!(eval(Catalog::Gpu, &f, &json!({"vram_gb": "n/a"})));
    }

    #[test]
    fn folded_set_and_fallback_source() {
        let f = FilterState::default().with("gpu_model", FilterValue::set(["h100"]));
        assert!(eval(Catalog::Gpu, &f, &json!({"item": " H100 "})));
        assert!(!eval(Catalog::Gpu, &f, &json!({"item": "A100"})));
        let exact = FilterState::default().with("provider", FilterValue::set(["Lambda"]));
        assert!(!eval(Catalog::Gpu, &exact, &json!({"provider": "lambda"})));
    }

    #[test]
    fn scalar_modes() {
        let sub = FilterState::default().with("name", FilterValue::Scalar("GPT".into()));
        assert!(eval(Catalog::Model, &sub, &json!({"name": "OpenAI: gpt-4o"})));
        let exact = FilterState::default().with("type", FilterValue::Scalar("vm".into()));
        assert!(eval(Catalog::Gpu, &exact, &json!({"type": "VM"})));
        assert!(!eval(Catalog::Gpu, &exact, &json!({"type": "VM spot"})));
    }

    #[test]
    fn search_spans_numbers_and_text() {
        let f = FilterState::default().with_search("80 ");
        assert!(eval(Catalog::Gpu, &f, &json!({"gpu_model": "H100", "vram_gb": 80})));
        let f = FilterState::default().with_search("100 SX");
        assert!(eval(Catalog::Gpu, &f, &json!({"gpu_model": "H100 SXM", "provider": "Lambda"})));
        let f = FilterState::default().with_search("coreweave");
        assert!(!eval(Catalog::Gpu, &f, &json!({"gpu_model": "H100 SXM", "provider": "Lambda"})));
    }

    #[test]
    fn modalities_and_across_tags() {
        let row = json!({"inputModalities": ["text", "image"], "outputModalities": ["text"]});
        let f = FilterState::default().with_modality("image", ModalityDirection::Input).with_modality("text", ModalityDirection::Output);
        assert!(eval(Catalog::Model, &f, &row));
        let f = FilterState::default().with_modality("image", ModalityDirection::Output);
        assert!(!eval(Catalog::Model, &f, &row));
        let f = FilterState::default().with_modality("IMAGE", ModalityDirection::Both);
        assert!(eval(Catalog::Model, &f, &row));
    }
}
