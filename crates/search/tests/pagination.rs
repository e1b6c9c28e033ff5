#![forbid(unsafe_code)]

use std::sync::Arc;

use serde_json::json;
use tally_core::{Catalog, Dataset, FilterState, FilterValue, ListQuery, Row};
use tally_search::query::{parse_query_string, to_query_string};
use tally_search::MemEngine;

fn model(id: &str, provider: &str, price: f64) -> Row {
    Row::new(
        Catalog::Model,
        id,
        json!({"id": id, "provider": provider, "name": format!("{} {}", provider, id), "pricing": {"prompt": price}}),
    )
}

fn provider_fixture() -> MemEngine {
    let mut rows = Vec::new();
    for i in 0..3 { rows.push(model(&format!("oa-{i}"), "openai", 0.000001 * (i + 1) as f64)); }
    for i in 0..2 { rows.push(model(&format!("an-{i}"), "anthropic", 0.000003)); }
    for (i, p) in ["mistral", "meta", "cohere", "xai", "qwen"].iter().enumerate() {
        rows.push(model(&format!("ot-{i}"), p, 0.0000005));
    }
    MemEngine::build(Catalog::Model.schema(), Arc::new(Dataset { epoch: 1, rows }))
}

fn gpu_fixture(n: usize) -> MemEngine {
    let rows = (0..n)
        .map(|i| {
            Row::new(
                Catalog::Gpu,
                format!("g{i:03}"),
                json!({"provider": (["lambda", "runpod", "nebius"][i % 3]), "gpu_model": "H100", "gpu_count": i, "price_hour_usd": (i % 5) as f64}),
            )
        })
        .collect();
    MemEngine::build(Catalog::Gpu.schema(), Arc::new(Dataset { epoch: 1, rows }))
}

#[test]
fn provider_filter_and_unfiltered_facet() {
    let e = provider_fixture();
    let q = ListQuery::default().with_filter(FilterState::default().with("provider", FilterValue::set(["openai", "anthropic"])));
    let page = e.list(&q).unwrap();
    assert_eq!(page.meta.filter_row_count, 5);
    assert_eq!(page.data.len(), 5);
    assert_eq!(page.meta.total_row_count, 10);
    let prov = &page.meta.facets["provider"];
    assert_eq!(prov.count_of("openai"), Some(3));
    assert_eq!(prov.count_of("anthropic"), Some(2));
    assert_eq!(prov.sum(), 10);
}

#[test]
fn consecutive_pages_are_disjoint_and_contiguous() {
    let e = gpu_fixture(37);
    let all = e.list(&ListQuery::default().sorted("price_hour_usd", false).page(0, 200)).unwrap();
    let all_ids = all.ids();
    for c in [0usize, 5, 10, 30] {
        let s = 5;
        let a = e.list(&ListQuery::default().sorted("price_hour_usd", false).page(c, s)).unwrap();
        let b = e.list(&ListQuery::default().sorted("price_hour_usd", false).page(c + s, s)).unwrap();
        let (ai, bi) = (a.ids(), b.ids());
        assert!(ai.iter().all(|x| !bi.contains(x)), "overlap at cursor {}", c);
        let joined: Vec<&str> = ai.into_iter().chain(bi).collect();
        let end = (c + 2 * s).min(all_ids.len());
        assert_eq!(joined, all_ids[c.min(end)..end].to_vec());
    }
}

#[test]
fn next_cursor_walks_to_the_end() {
    let e = gpu_fixture(12);
    let mut q = ListQuery::default().page(0, 5);
    let mut seen = Vec::new();
    loop {
        let p = e.list(&q).unwrap();
        seen.extend(p.ids().into_iter().map(str::to_string));
        match p.next_cursor {
            Some(n) => q.cursor = n as usize,
            None => break,
        }
    }
    assert_eq!(seen.len(), 12);
}

#[test]
fn facet_sums_hold_under_any_filter() {
    let e = gpu_fixture(20);
    let q = ListQuery::default().with_filter(FilterState::default().with("price_hour_usd", FilterValue::range(1.0, 2.0)));
    let p = e.list(&q).unwrap();
    for name in ["provider", "type", "gpu_model", "gpu_count", "vram_gb", "price_hour_usd"] {
        assert_eq!(p.meta.facets[name].sum(), 20, "facet {}", name);
    }
}

#[test]
fn url_state_reproduces_the_same_page() {
    let e = gpu_fixture(30);
    let r = parse_query_string(Catalog::Gpu, "provider=lambda,nebius&price_hour_usd=1-3&sort=gpu_count.desc&size=4&cursor=4");
    assert!(r.rejected.is_empty());
    let again = parse_query_string(Catalog::Gpu, &to_query_string(Catalog::Gpu, &r.query));
    assert_eq!(e.list(&r.query).unwrap().ids(), e.list(&again.query).unwrap().ids());
}
