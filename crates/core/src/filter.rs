use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A filter value, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    Scalar(String),
    Set(Vec<String>),
    /// Inclusive `[min, max]`; a max at or above the open-ended sentinel means "min or higher".
    Range(f64, f64),
    DateRange(DateTime<Utc>, DateTime<Utc>),
}

impl FilterValue {
    /// Ordered range constructor.
    pub fn range(a: f64, b: f64) -> Self { if a <= b { FilterValue::Range(a, b) } else { FilterValue::Range(b, a) } }

    pub fn date_range(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        if a <= b { FilterValue::DateRange(a, b) } else { FilterValue::DateRange(b, a) }
    }

    pub fn set<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterValue::Set(values.into_iter().map(Into::into).collect())
    }

    pub fn shape(&self) -> &'static str {
        match self {
            FilterValue::Scalar(_) => "scalar",
            FilterValue::Set(_) => "set",
            FilterValue::Range(..) => "range",
            FilterValue::DateRange(..) => "date range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModalityDirection {
    #[default]
    Input,
    Output,
    Both,
}

impl ModalityDirection {
    pub fn as_str(&self) -> &'static str {
        match self { ModalityDirection::Input => "input", ModalityDirection::Output => "output", ModalityDirection::Both => "both" }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" => Some(ModalityDirection::Input),
            "output" => Some(ModalityDirection::Output),
            "both" => Some(ModalityDirection::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModalityTag {
    pub tag: String,
    pub direction: ModalityDirection,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterState {
    pub fields: BTreeMap<String, FilterValue>,
    pub search: Option<String>,
    /// Every tag must match (AND); each on its own direction.
    pub modalities: Vec<ModalityTag>,
}

impl FilterState {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.search.as_deref().map_or(true, |s| s.trim().is_empty()) && self.modalities.is_empty()
    }

    pub fn with(mut self, field: &str, value: FilterValue) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }

    pub fn with_search(mut self, needle: &str) -> Self {
        self.search = Some(needle.to_string());
        self
    }

    pub fn with_modality(mut self, tag: &str, direction: ModalityDirection) -> Self {
        self.modalities.push(ModalityTag { tag: tag.to_string(), direction });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortState {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    Prev,
    #[default]
    Next,
}

/// Everything a list request carries: filters, at most one sort, and the offset window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    pub filter: FilterState,
    pub sort: Option<SortState>,
    pub size: usize,
    pub cursor: usize,
    pub direction: PageDirection,
    /// Selected row, carried through for sharable URLs.
    pub uuid: Option<String>,
}

pub const DEFAULT_PAGE_SIZE: usize = 50;

impl Default for ListQuery {
    fn default() -> Self {
        Self { filter: FilterState::default(), sort: None, size: DEFAULT_PAGE_SIZE, cursor: 0, direction: PageDirection::Next, uuid: None }
    }
}

impl ListQuery {
    pub fn with_filter(mut self, filter: FilterState) -> Self { self.filter = filter; self }
    pub fn sorted(mut self, field: &str, descending: bool) -> Self {
        self.sort = Some(SortState { field: field.to_string(), descending });
        self
    }
    pub fn page(mut self, cursor: usize, size: usize) -> Self { self.cursor = cursor; self.size = size; self }
}
