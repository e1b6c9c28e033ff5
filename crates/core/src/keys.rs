//! Stable, content-derived row identities.
//!
//! Storage ids change when a catalog is re-scraped; these keys are built only from
//! attributes that identify the offering itself (never price or timestamps), so a
//! favorite keeps pointing at the same offering across refreshes.

use serde_json::Value;

use crate::coerce::{self, lookup};
use crate::Catalog;

fn norm(data: &Value, paths: &[&str]) -> String {
    paths
        .iter()
        .find_map(|p| lookup(data, p).and_then(coerce::text).filter(|s| !s.trim().is_empty()))
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default()
}

fn num_part(data: &Value, path: &str, suffix: &str) -> String {
    match lookup(data, path) {
        Some(v @ Value::Number(_)) => coerce::text(v).map(|n| format!("{}{}", n, suffix)).unwrap_or_default(),
        _ => String::new(),
    }
}

fn join(parts: &[String]) -> String {
    parts.iter().filter(|p| !p.is_empty()).map(String::as_str).collect::<Vec<_>>().join(":")
}

/// `provider:model:{count}x:{vram}gb:type`, e.g. `coreweave:h100:8x:80gb:vm`.
pub fn stable_gpu_key(data: &Value) -> String {
    join(&[
        norm(data, &["provider"]),
        norm(data, &["gpu_model", "item"]),
        num_part(data, "gpu_count", "x"),
        num_part(data, "vram_gb", "gb"),
        norm(data, &["type"]),
    ])
}

/// `provider:model:vcpus:{ram}gb:type`. `vcpus` may be a range string such as `8-40`.
pub fn stable_cpu_key(data: &Value) -> String {
    let vcpus = match lookup(data, "vcpus") {
        Some(Value::Number(_)) => norm(data, &["vcpus"]),
        _ => String::new(),
    };
    join(&[
        norm(data, &["provider"]),
        norm(data, &["cpu_model", "item", "sku"]),
        vcpus,
        num_part(data, "system_ram_gb", "gb"),
        norm(data, &["type"]),
    ])
}

/// The source id when present, otherwise `provider:slug` (or `provider:name`).
pub fn stable_model_key(data: &Value) -> String {
    if let Some(id) = lookup(data, "id").and_then(coerce::text).filter(|s| !s.is_empty()) {
        return id;
    }
    let slug = norm(data, &["slug"]);
    let tail = if slug.is_empty() { norm(data, &["name"]) } else { slug };
    join(&[norm(data, &["provider"]), tail])
}

pub fn stable_key(catalog: Catalog, data: &Value) -> String {
    match catalog {
        Catalog::Gpu => stable_gpu_key(data),
        Catalog::Cpu => stable_cpu_key(data),
        Catalog::Model => stable_model_key(data),
    }
}
