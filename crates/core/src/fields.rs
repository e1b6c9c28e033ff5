//! Declared dimensions per catalog.
//!
//! This module provides:
//! - `FieldSpec`: name, canonical source precedence, kind and matching policy
//! - Built-in schemas for the GPU, CPU and model catalogs
//! - Canonical value resolution shared by filtering, sorting and faceting

use serde_json::Value;
use smallvec::SmallVec;

use crate::coerce;
use crate::filter::SortState;
use crate::{Catalog, CoreError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    /// Epoch-millisecond comparable.
    Timestamp,
    /// JSON array of strings; the union of all sources.
    TextList,
}

/// How array filter values compare against a row value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetMatch {
    Exact,
    /// Trimmed, case-insensitive equality.
    Folded,
}

/// How a lone scalar filter value compares against a row value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarMatch {
    /// Case-insensitive substring.
    Substring,
    /// Case-insensitive equality.
    Exact,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FacetOrder {
    /// Listed values first in list order, then the rest by value.
    Priority(Vec<String>),
    CountDesc,
    ValueAsc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FacetSpec {
    pub order: FacetOrder,
    /// Keep only the first `top` value rows; the remainder is folded into the missing row.
    pub top: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    /// Source paths in precedence order; the first present one is canonical.
    pub sources: SmallVec<[String; 2]>,
    pub kind: FieldKind,
    /// Multiplier applied to canonical numbers (per-token prices become per-million).
    pub scale: f64,
    pub set_match: SetMatch,
    pub scalar_match: ScalarMatch,
    pub facet: Option<FacetSpec>,
    /// Values at or above this threshold sort together as "unbounded".
    pub unbounded_at: Option<f64>,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            sources: SmallVec::from_iter([name.to_string()]),
            kind,
            scale: 1.0,
            set_match: SetMatch::Exact,
            scalar_match: ScalarMatch::Substring,
            facet: None,
            unbounded_at: None,
        }
    }

    pub fn text(name: &str) -> Self { Self::new(name, FieldKind::Text) }
    pub fn number(name: &str) -> Self { Self::new(name, FieldKind::Number) }
    pub fn timestamp(name: &str) -> Self { Self::new(name, FieldKind::Timestamp) }
    pub fn list(name: &str) -> Self { Self::new(name, FieldKind::TextList) }

    pub fn sources(mut self, paths: &[&str]) -> Self {
        self.sources = paths.iter().map(|p| p.to_string()).collect();
        self
    }
    pub fn scale(mut self, s: f64) -> Self { self.scale = s; self }
    pub fn folded(mut self) -> Self { self.set_match = SetMatch::Folded; self }
    pub fn exact_scalar(mut self) -> Self { self.scalar_match = ScalarMatch::Exact; self }
    pub fn unbounded_at(mut self, v: f64) -> Self { self.unbounded_at = Some(v); self }
    pub fn facet(mut self, order: FacetOrder) -> Self { self.facet = Some(FacetSpec { order, top: None }); self }
    pub fn facet_top(mut self, order: FacetOrder, top: usize) -> Self { self.facet = Some(FacetSpec { order, top: Some(top) }); self }

    /// Canonical number: first source that coerces to a number, then scaled.
    pub fn canonical_num(&self, data: &Value) -> Option<f64> {
        let n = self.sources.iter().find_map(|p| coerce::lookup(data, p).and_then(coerce::num))?;
        Some(if self.scale == 1.0 { n } else { n * self.scale })
    }

    /// Canonical text. Numeric fields render their canonical number.
    pub fn canonical_text(&self, data: &Value) -> Option<String> {
        match self.kind {
            FieldKind::Number => self.canonical_num(data).map(coerce::fmt_num),
            FieldKind::TextList => None,
            _ => self.sources.iter().find_map(|p| coerce::lookup(data, p).and_then(coerce::text)),
        }
    }

    pub fn canonical_ts(&self, data: &Value) -> Option<i64> {
        self.sources.iter().find_map(|p| coerce::lookup(data, p).and_then(coerce::ts_millis))
    }

    /// String members across every array source, deduplicated, in first-seen order.
    pub fn list_values(&self, data: &Value) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in &self.sources {
            if let Some(Value::Array(items)) = coerce::lookup(data, p) {
                for it in items {
                    if let Value::String(s) = it {
                        if !out.iter().any(|x| x == s) { out.push(s.clone()); }
                    }
                }
            }
        }
        out
    }
}

/// The input/output list fields used by modality filters.
#[derive(Clone, Debug, PartialEq)]
pub struct ModalityFields {
    pub input: String,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogSchema {
    pub catalog: Catalog,
    pub fields: Vec<FieldSpec>,
    /// Fields concatenated for free-text search, in order.
    pub search_fields: Vec<String>,
    pub default_sort: SortState,
    pub percentile_field: Option<String>,
    pub modality: Option<ModalityFields>,
}

impl CatalogSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> { self.fields.iter().find(|f| f.name == name) }

    pub fn require(&self, name: &str) -> Result<&FieldSpec, CoreError> {
        self.field(name).ok_or_else(|| CoreError::UnknownField { catalog: self.catalog, field: name.to_string() })
    }

    pub fn facet_fields(&self) -> impl Iterator<Item = &FieldSpec> { self.fields.iter().filter(|f| f.facet.is_some()) }

    pub fn search_specs(&self) -> Vec<&FieldSpec> {
        self.search_fields.iter().filter_map(|n| self.field(n)).collect()
    }

    /// The effective sort field and direction: the requested sort or the schema default.
    pub fn sort_spec(&self, sort: Option<&SortState>) -> Result<(&FieldSpec, bool), CoreError> {
        let s = sort.unwrap_or(&self.default_sort);
        let field = self.require(&s.field)?;
        if field.kind == FieldKind::TextList {
            return Err(CoreError::NotSortable(s.field.clone()));
        }
        Ok((field, s.descending))
    }

    /// Override the canonical source precedence of a field.
    pub fn set_precedence(&mut self, name: &str, sources: &[&str]) -> Result<(), CoreError> {
        let catalog = self.catalog;
        let f = self
            .fields
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| CoreError::UnknownField { catalog, field: name.to_string() })?;
        if sources.is_empty() {
            return Err(CoreError::InvalidRow(format!("field `{}` needs at least one source", name)));
        }
        f.sources = sources.iter().map(|s| s.to_string()).collect();
        Ok(())
    }
}

pub const PER_MILLION: f64 = 1_000_000.0;
pub const CONTEXT_UNBOUNDED: f64 = 1_000_000.0;

fn sort(field: &str, descending: bool) -> SortState { SortState { field: field.to_string(), descending } }

fn prio(names: &[&str]) -> FacetOrder { FacetOrder::Priority(names.iter().map(|s| s.to_string()).collect()) }

fn strings(names: &[&str]) -> Vec<String> { names.iter().map(|s| s.to_string()).collect() }

/// Built-in schema for a catalog.
pub fn schema_for(catalog: Catalog) -> CatalogSchema {
    match catalog {
        Catalog::Gpu => gpu_schema(),
        Catalog::Cpu => cpu_schema(),
        Catalog::Model => model_schema(),
    }
}

const CLOUD_PROVIDERS: &[&str] = &["coreweave", "lambda", "runpod", "digitalocean", "oracle", "nebius", "hyperstack", "crusoe"];

fn gpu_schema() -> CatalogSchema {
    let fields = vec![
        FieldSpec::text("provider").facet(prio(CLOUD_PROVIDERS)),
        FieldSpec::text("type").exact_scalar().facet(FacetOrder::CountDesc),
        FieldSpec::text("gpu_model").sources(&["gpu_model", "item"]).folded().facet(FacetOrder::CountDesc),
        FieldSpec::number("gpu_count").facet(FacetOrder::ValueAsc),
        FieldSpec::number("vram_gb").facet(FacetOrder::ValueAsc),
        FieldSpec::number("price_hour_usd").sources(&["price_hour_usd", "price_usd"]).facet(FacetOrder::ValueAsc),
        FieldSpec::timestamp("observed_at"),
        FieldSpec::number("system_ram_gb").sources(&["system_ram_gb", "ram_gb"]),
        FieldSpec::number("vcpus"),
        FieldSpec::number("local_storage_tb"),
        FieldSpec::number("price_month_usd"),
        FieldSpec::number("price_usd"),
        FieldSpec::text("item"),
        FieldSpec::text("region"),
        FieldSpec::text("zone"),
        FieldSpec::text("sku"),
        FieldSpec::text("billing_notes"),
        FieldSpec::text("price_unit"),
        FieldSpec::text("network"),
        FieldSpec::text("raw_cost"),
    ];
    CatalogSchema {
        catalog: Catalog::Gpu,
        fields,
        search_fields: strings(&[
            "gpu_model", "item", "provider", "region", "zone", "sku", "billing_notes", "price_unit", "type", "network",
            "gpu_count", "vram_gb", "system_ram_gb", "local_storage_tb", "vcpus", "price_hour_usd", "price_month_usd",
            "price_usd", "raw_cost",
        ]),
        default_sort: sort("provider", false),
        percentile_field: Some("price_hour_usd".into()),
        modality: None,
    }
}

fn cpu_schema() -> CatalogSchema {
    let fields = vec![
        FieldSpec::text("provider").facet(prio(CLOUD_PROVIDERS)),
        FieldSpec::text("type").exact_scalar().facet(FacetOrder::CountDesc),
        FieldSpec::text("cpu_model").sources(&["cpu_model", "item", "sku"]).folded().facet(FacetOrder::CountDesc),
        FieldSpec::number("vcpus").facet(FacetOrder::ValueAsc),
        FieldSpec::number("system_ram_gb").sources(&["system_ram_gb", "ram_gb"]).facet(FacetOrder::ValueAsc),
        FieldSpec::number("price_hour_usd").sources(&["price_hour_usd", "price_usd"]).facet(FacetOrder::ValueAsc),
        FieldSpec::timestamp("observed_at"),
        FieldSpec::number("local_storage_tb"),
        FieldSpec::number("price_month_usd"),
        FieldSpec::text("cpu_type"),
        FieldSpec::text("region"),
        FieldSpec::text("zone"),
        FieldSpec::text("billing_notes"),
        FieldSpec::text("price_unit"),
        FieldSpec::text("network"),
    ];
    CatalogSchema {
        catalog: Catalog::Cpu,
        fields,
        search_fields: strings(&[
            "cpu_model", "provider", "region", "zone", "billing_notes", "price_unit", "type", "network", "cpu_type",
            "vcpus", "system_ram_gb", "local_storage_tb", "price_hour_usd", "price_month_usd",
        ]),
        default_sort: sort("provider", false),
        percentile_field: Some("price_hour_usd".into()),
        modality: None,
    }
}

const MODEL_PROVIDERS: &[&str] = &[
    "Azure", "Google Vertex", "Groq", "Together", "Fireworks", "OpenAI", "Anthropic", "Google AI Studio",
    "Amazon Bedrock", "Mistral", "Cohere", "xAI", "Meta", "Perplexity", "DeepSeek", "Cerebras", "SambaNova",
    "DeepInfra", "Cloudflare", "NVIDIA",
];

const MODEL_AUTHORS: &[&str] = &[
    "OpenAI", "Anthropic", "xAI", "Google", "Meta", "Perplexity", "DeepSeek", "Z.AI", "Qwen", "Mistral", "Cohere",
    "MoonshotAI", "NVIDIA", "Microsoft", "Amazon", "Alibaba",
];

fn model_schema() -> CatalogSchema {
    let fields = vec![
        FieldSpec::text("provider").facet(prio(MODEL_PROVIDERS)),
        FieldSpec::text("author").facet(prio(MODEL_AUTHORS)),
        FieldSpec::text("name").facet_top(FacetOrder::CountDesc, 20),
        FieldSpec::text("description"),
        FieldSpec::text("slug"),
        FieldSpec::number("contextLength").sources(&["contextLength", "context_length"]).unbounded_at(CONTEXT_UNBOUNDED),
        FieldSpec::number("inputPrice").sources(&["pricing.prompt", "inputPrice"]).scale(PER_MILLION),
        FieldSpec::number("outputPrice").sources(&["pricing.completion", "outputPrice"]).scale(PER_MILLION),
        FieldSpec::number("mmlu"),
        FieldSpec::list("inputModalities"),
        FieldSpec::list("outputModalities"),
        FieldSpec::list("modalities").sources(&["inputModalities", "outputModalities"]).facet(FacetOrder::ValueAsc),
    ];
    CatalogSchema {
        catalog: Catalog::Model,
        fields,
        search_fields: strings(&["name", "description", "provider", "author"]),
        default_sort: sort("provider", false),
        percentile_field: Some("inputPrice".into()),
        modality: Some(ModalityFields { input: "inputModalities".into(), output: "outputModalities".into() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_prefers_first_present_source() {
        let s = schema_for(Catalog::Gpu);
        let price = s.field("price_hour_usd").unwrap();
        assert_eq!(price.canonical_num(&json!({"price_hour_usd": 2.0, "price_usd": 9.0})), Some(2.0));
        assert_eq!(price.canonical_num(&json!({"price_usd": 9.0})), Some(9.0));
        assert_eq!(price.canonical_num(&json!({"price_hour_usd": "n/a", "price_usd": 9.0})), Some(9.0));
        let model = s.field("gpu_model").unwrap();
        assert_eq!(model.canonical_text(&json!({"item": "H100 SXM"})), Some("H100 SXM".into()));
    }

    #[test]
    fn model_prices_scale_to_per_million() {
        let s = schema_for(Catalog::Model);
        let f = s.field("inputPrice").unwrap();
        let v = f.canonical_num(&json!({"pricing": {"prompt": "0.000003"}})).unwrap();
        assert!((v - 3.0).abs() < 1e-9);
    }

    #[test]
    fn precedence_is_configurable() {
        let mut s = schema_for(Catalog::Gpu);
        s.set_precedence("price_hour_usd", &["price_usd", "price_hour_usd"]).unwrap();
        let price = s.field("price_hour_usd").unwrap();
        assert_eq!(price.canonical_num(&json!({"price_hour_usd": 2.0, "price_usd": 9.0})), Some(9.0));
        assert!(s.set_precedence("nope", &["x"]).is_err());
    }

    #[test]
    fn list_values_union_sources() {
        let s = schema_for(Catalog::Model);
        let f = s.field("modalities").unwrap();
        let v = f.list_values(&json!({"inputModalities": ["text", "image"], "outputModalities": ["text"]}));
        assert_eq!(v, vec!["text".to_string(), "image".to_string()]);
    }
}
