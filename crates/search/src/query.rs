//! Query-state codec: flat URL parameters <-> typed `ListQuery`.
//!
//! Parsing fails soft per field. A malformed value is dropped and reported, the rest
//! of the query still applies. Serialization is the exact inverse and omits defaults,
//! so the serialized form doubles as a request key.

use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use tally_core::coerce::{self, fmt_num};
use tally_core::filter::DEFAULT_PAGE_SIZE;
use tally_core::{Catalog, CatalogSchema, FieldKind, FilterValue, ListQuery, ModalityDirection, ModalityTag, PageDirection, SortState};

pub const ARRAY_DELIMITER: char = ',';
pub const RANGE_DELIMITER: char = '-';
pub const SORT_DELIMITER: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    StringArray,
    IntRange,
    FloatRange,
    TimestampRange,
    /// Scalar filter on the field of the same name.
    Text,
    Search,
    Modalities,
    ModalityDirections,
    Sort,
    Size,
    Cursor,
    /// Legacy offset; folded into `cursor` when no cursor is given.
    Start,
    Direction,
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub key: &'static str,
    pub kind: ParamKind,
}

const fn p(key: &'static str, kind: ParamKind) -> ParamSpec { ParamSpec { key, kind } }

use ParamKind::*;

const GPU_PARAMS: &[ParamSpec] = &[
    p("provider", StringArray),
    p("type", StringArray),
    p("gpu_model", StringArray),
    p("vram_gb", IntRange),
    p("price_hour_usd", FloatRange),
    p("observed_at", TimestampRange),
    p("search", Search),
    p("sort", Sort),
    p("size", Size),
    p("cursor", Cursor),
    p("uuid", Uuid),
];

const CPU_PARAMS: &[ParamSpec] = &[
    p("provider", StringArray),
    p("type", StringArray),
    p("cpu_model", StringArray),
    p("vcpus", IntRange),
    p("system_ram_gb", IntRange),
    p("price_hour_usd", FloatRange),
    p("observed_at", TimestampRange),
    p("search", Search),
    p("sort", Sort),
    p("size", Size),
    p("cursor", Cursor),
    p("uuid", Uuid),
];

const MODEL_PARAMS: &[ParamSpec] = &[
    p("provider", StringArray),
    p("author", StringArray),
    p("modalities", Modalities),
    p("modalityDirections", ModalityDirections),
    p("contextLength", FloatRange),
    p("inputPrice", FloatRange),
    p("outputPrice", FloatRange),
    p("search", Search),
    p("name", Text),
    p("description", Text),
    p("sort", Sort),
    p("size", Size),
    p("start", Start),
    p("direction", Direction),
    p("cursor", Cursor),
    p("uuid", Uuid),
];

pub fn params_for(catalog: Catalog) -> &'static [ParamSpec] {
    match catalog {
        Catalog::Gpu => GPU_PARAMS,
        Catalog::Cpu => CPU_PARAMS,
        Catalog::Model => MODEL_PARAMS,
    }
}

/// A dropped parameter and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseReport {
    pub query: ListQuery,
    pub rejected: Vec<ValidationFailure>,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(ARRAY_DELIMITER).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_range(raw: &str, integer: bool) -> Result<FilterValue, String> {
    let parts: Vec<&str> = raw.split(RANGE_DELIMITER).map(str::trim).collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(format!("expected one or two values, got {}", parts.len()));
    }
    let mut nums = Vec::with_capacity(2);
    for part in &parts {
        let n = if integer {
            part.parse::<i64>().map(|v| v as f64).map_err(|_| format!("`{}` is not an integer", part))?
        } else {
            coerce::parse_num(part).ok_or_else(|| format!("`{}` is not a number", part))?
        };
        nums.push(n);
    }
    let (a, b) = (nums[0], *nums.last().unwrap_or(&nums[0]));
    Ok(FilterValue::range(a, b))
}

fn parse_ts_range(raw: &str) -> Result<FilterValue, String> {
    let parts: Vec<&str> = raw.split(RANGE_DELIMITER).map(str::trim).collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(format!("expected one or two timestamps, got {}", parts.len()));
    }
    let mut out = Vec::with_capacity(2);
    for part in &parts {
        let ms = part.parse::<i64>().map_err(|_| format!("`{}` is not an epoch-millisecond timestamp", part))?;
        out.push(coerce::millis_to_utc(ms).ok_or_else(|| format!("`{}` is out of range", part))?);
    }
    Ok(FilterValue::date_range(out[0], *out.last().unwrap_or(&out[0])))
}

fn parse_sort(schema: &CatalogSchema, raw: &str) -> Result<SortState, String> {
    let (field, dir) = match raw.rsplit_once(SORT_DELIMITER) {
        Some((f, d)) => (f.trim(), d.trim()),
        None => (raw.trim(), "asc"),
    };
    let descending = match dir {
        "asc" => false,
        "desc" => true,
        other => return Err(format!("unknown sort direction `{}`", other)),
    };
    match schema.field(field) {
        Some(f) if f.kind != FieldKind::TextList => Ok(SortState { field: field.to_string(), descending }),
        Some(_) => Err(format!("`{}` is not sortable", field)),
        None => Err(format!("unknown sort field `{}`", field)),
    }
}

fn parse_offset(raw: &str) -> Result<usize, String> {
    raw.trim().parse::<usize>().map_err(|_| format!("`{}` is not a non-negative integer", raw))
}

/// Parse a parameter bag. The first occurrence of a key wins; unknown keys are ignored.
pub fn parse<'a, I>(catalog: Catalog, pairs: I) -> ParseReport
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let schema = catalog.schema();
    let table = params_for(catalog);
    let mut bag: BTreeMap<&str, &str> = BTreeMap::new();
    for (k, v) in pairs {
        bag.entry(k).or_insert(v);
    }

    let mut q = ListQuery::default();
    let mut rejected: Vec<ValidationFailure> = Vec::new();
    let mut reject = |key: &str, reason: String| rejected.push(ValidationFailure { key: key.to_string(), reason });
    let mut start: Option<usize> = None;
    let mut cursor: Option<usize> = None;
    let mut tags: Vec<String> = Vec::new();
    let mut directions: BTreeMap<String, ModalityDirection> = BTreeMap::new();

    for spec in table {
        let Some(raw) = bag.get(spec.key).copied() else { continue };
        if raw.trim().is_empty() {
            continue;
        }
        match spec.kind {
            StringArray => {
                let items = split_list(raw);
                if items.is_empty() { reject(spec.key, "empty list".into()); } else { q.filter.fields.insert(spec.key.into(), FilterValue::Set(items)); }
            }
            IntRange | FloatRange => match parse_range(raw, spec.kind == IntRange) {
                Ok(v) => { q.filter.fields.insert(spec.key.into(), v); }
                Err(e) => reject(spec.key, e),
            },
            TimestampRange => match parse_ts_range(raw) {
                Ok(v) => { q.filter.fields.insert(spec.key.into(), v); }
                Err(e) => reject(spec.key, e),
            },
            Text => { q.filter.fields.insert(spec.key.into(), FilterValue::Scalar(raw.to_string())); }
            Search => q.filter.search = Some(raw.to_string()),
            Modalities => tags = split_list(raw),
            ModalityDirections => {
                for entry in split_list(raw) {
                    match entry.split_once(':').and_then(|(t, d)| ModalityDirection::parse(d).map(|d| (t.trim().to_string(), d))) {
                        Some((t, d)) if !t.is_empty() => { directions.insert(t, d); }
                        _ => reject(spec.key, format!("`{}` is not tag:input|output|both", entry)),
                    }
                }
            }
            Sort => match parse_sort(&schema, raw) {
                Ok(s) => q.sort = Some(s),
                Err(e) => reject(spec.key, e),
            },
            Size => match parse_offset(raw) {
                Ok(n) if n > 0 => q.size = n,
                Ok(_) => reject(spec.key, "size must be positive".into()),
                Err(e) => reject(spec.key, e),
            },
            Cursor => match parse_offset(raw) {
                Ok(n) => cursor = Some(n),
                Err(e) => reject(spec.key, e),
            },
            Start => match parse_offset(raw) {
                Ok(n) => start = Some(n),
                Err(e) => reject(spec.key, e),
            },
            Direction => match raw.trim() {
                "prev" => q.direction = PageDirection::Prev,
                "next" => q.direction = PageDirection::Next,
                other => reject(spec.key, format!("unknown direction `{}`", other)),
            },
            Uuid => q.uuid = Some(raw.to_string()),
        }
    }

    q.cursor = cursor.or(start).unwrap_or(0);
    q.filter.modalities = tags
        .into_iter()
        .map(|tag| {
            let direction = directions.get(&tag).copied().unwrap_or_default();
            ModalityTag { tag, direction }
        })
        .collect();

    ParseReport { query: q, rejected }
}

fn fmt_range(a: f64, b: f64) -> String { format!("{}{}{}", fmt_num(a), RANGE_DELIMITER, fmt_num(b)) }

/// Serialize in parameter-table order, omitting defaults.
pub fn serialize(catalog: Catalog, q: &ListQuery) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for spec in params_for(catalog) {
        let key = spec.key.to_string();
        let value: Option<String> = match spec.kind {
            StringArray | IntRange | FloatRange | TimestampRange | Text => match q.filter.fields.get(spec.key) {
                Some(FilterValue::Set(items)) if !items.is_empty() => Some(items.join(&ARRAY_DELIMITER.to_string())),
                Some(FilterValue::Range(a, b)) => Some(fmt_range(*a, *b)),
                Some(FilterValue::DateRange(a, b)) => {
                    Some(format!("{}{}{}", a.timestamp_millis(), RANGE_DELIMITER, b.timestamp_millis()))
                }
                Some(FilterValue::Scalar(s)) if !s.trim().is_empty() => Some(s.clone()),
                _ => None,
            },
            Search => q.filter.search.clone().filter(|s| !s.trim().is_empty()),
            Modalities => {
                let tags: Vec<&str> = q.filter.modalities.iter().map(|m| m.tag.as_str()).collect();
                if tags.is_empty() { None } else { Some(tags.join(&ARRAY_DELIMITER.to_string())) }
            }
            ModalityDirections => {
                let dirs: Vec<String> = q
                    .filter
                    .modalities
                    .iter()
                    .filter(|m| m.direction != ModalityDirection::Input)
                    .map(|m| format!("{}:{}", m.tag, m.direction.as_str()))
                    .collect();
                if dirs.is_empty() { None } else { Some(dirs.join(&ARRAY_DELIMITER.to_string())) }
            }
            Sort => q.sort.as_ref().map(|s| format!("{}{}{}", s.field, SORT_DELIMITER, if s.descending { "desc" } else { "asc" })),
            Size => (q.size != DEFAULT_PAGE_SIZE).then(|| q.size.to_string()),
            Cursor => (q.cursor != 0).then(|| q.cursor.to_string()),
            Start => None,
            Direction => (q.direction == PageDirection::Prev).then(|| "prev".to_string()),
            Uuid => q.uuid.clone(),
        };
        if let Some(v) = value {
            out.push((key, v));
        }
    }
    out
}

/// Bytes kept verbatim in query values; list and range delimiters stay readable.
const VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~').remove(b',').remove(b':');

/// Form-style decoding: `+` is a space, `%XX` escapes are resolved, invalid UTF-8 is replaced.
fn form_decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Render as `a=1&b=2`. This string is also the request key for stale-response detection.
pub fn to_query_string(catalog: Catalog, q: &ListQuery) -> String {
    serialize(catalog, q).into_iter().map(|(k, v)| format!("{}={}", k, utf8_percent_encode(&v, VALUE))).collect::<Vec<_>>().join("&")
}

pub fn parse_query_string(catalog: Catalog, qs: &str) -> ParseReport {
    let qs = qs.trim_start_matches('?');
    let pairs: Vec<(String, String)> = qs
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (form_decode(k), form_decode(v)),
            None => (form_decode(kv), String::new()),
        })
        .collect();
    parse(catalog, pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}
