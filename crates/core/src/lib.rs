//! Tally core types: catalog rows, field schemas, filter state and the predicate tree
//! shared by the in-memory engine and the SQLite compiler.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod coerce;
pub mod config;
pub mod expr;
pub mod facet;
pub mod fields;
pub mod filter;
pub mod keys;
pub mod page;

pub use expr::{lower, Expr};
pub use facet::{Facet, FacetRow, Facets};
pub use fields::{CatalogSchema, FieldKind, FieldSpec, ScalarMatch, SetMatch};
pub use filter::{FilterState, FilterValue, ListQuery, ModalityDirection, ModalityTag, PageDirection, SortState};
pub use page::{ListMeta, ListPage, PageRow, Percentiles};

/// One of the catalogs served by the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Catalog {
    Gpu,
    Cpu,
    Model,
}

impl Catalog {
    pub const ALL: [Catalog; 3] = [Catalog::Gpu, Catalog::Cpu, Catalog::Model];

    pub fn as_str(&self) -> &'static str {
        match self { Catalog::Gpu => "gpu", Catalog::Cpu => "cpu", Catalog::Model => "model" }
    }

    pub fn schema(&self) -> CatalogSchema { fields::schema_for(*self) }
}

impl std::fmt::Display for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

impl std::str::FromStr for Catalog {
    type Err = CoreError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "gpus" => Ok(Catalog::Gpu),
            "cpu" | "cpus" => Ok(Catalog::Cpu),
            "model" | "models" => Ok(Catalog::Model),
            other => Err(CoreError::UnknownCatalog(other.to_string())),
        }
    }
}

/// A catalog entry. `id` is the storage identity and may change on re-ingestion;
/// `stable_key` is derived from content and is what favorites reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    pub id: String,
    pub stable_key: String,
    pub catalog: Catalog,
    /// Semi-structured source record; field names vary across data sources.
    pub data: serde_json::Value,
}

impl Row {
    /// Build a row, deriving its stable key from `data`.
    pub fn new(catalog: Catalog, id: impl Into<String>, data: serde_json::Value) -> Self {
        let stable_key = keys::stable_key(catalog, &data);
        Self { id: id.into(), stable_key, catalog, data }
    }

    /// Build a row from a bare JSON record, taking `id` (or `uuid`) from the record itself.
    pub fn from_record(catalog: Catalog, data: serde_json::Value) -> Result<Self, CoreError> {
        if !data.is_object() {
            return Err(CoreError::InvalidRow("record is not a JSON object".into()));
        }
        let id = ["id", "uuid"]
            .iter()
            .find_map(|k| coerce::lookup(&data, k).and_then(coerce::text))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CoreError::InvalidRow("record has no id".into()))?;
        Ok(Self::new(catalog, id, data))
    }
}

/// Immutable view of one catalog as loaded in memory.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub epoch: u64,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CoreError {
    #[error("unknown catalog: {0}")]
    UnknownCatalog(String),
    #[error("unknown field `{field}` for catalog {catalog}")]
    UnknownField { catalog: Catalog, field: String },
    #[error("field `{field}` does not accept {shape} filters")]
    FilterShape { field: String, shape: &'static str },
    #[error("field `{0}` is not sortable")]
    NotSortable(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("config: {0}")]
    Config(String),
}

pub mod prelude {
    pub use super::{Catalog, CatalogSchema, CoreError, Dataset, Expr, FieldSpec, FilterState, FilterValue, ListQuery, Row, SortState};
}
