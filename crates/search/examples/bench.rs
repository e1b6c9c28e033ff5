use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tally_core::{Catalog, Dataset, FilterState, FilterValue, ListQuery, Row};
use tally_search::MemEngine;

const PROVIDERS: [&str; 6] = ["coreweave", "lambda", "runpod", "nebius", "oracle", "crusoe"];
const MODELS: [&str; 5] = ["H100 SXM", "A100", "L40S", "H200", "B200"];

fn gen_row(i: usize) -> Row {
    let vram = [24, 48, 80, 141, 192][i % 5];
    Row::new(
        Catalog::Gpu,
        format!("row-{i:07}"),
        json!({
            "provider": PROVIDERS[i % PROVIDERS.len()],
            "gpu_model": MODELS[i % MODELS.len()],
            "gpu_count": 1 << (i % 4),
            "vram_gb": vram,
            "type": if i % 7 == 0 { "Bare Metal" } else { "VM" },
            "price_hour_usd": (i % 4000) as f64 / 100.0,
            "region": format!("region-{}", i % 17),
        }),
    )
}

fn percentile_us(xs: &mut [u128], p: f64) -> u128 {
    xs.sort_unstable();
    let idx = ((xs.len() as f64 - 1.0) * p).round() as usize;
    xs[idx]
}

fn main() {
    let n: usize = std::env::var("TALLY_BENCH_ROWS").ok().and_then(|s| s.parse().ok()).unwrap_or(100_000);

    let t0 = Instant::now();
    let rows: Vec<Row> = (0..n).map(gen_row).collect();
    let engine = MemEngine::build(Catalog::Gpu.schema(), Arc::new(Dataset { epoch: 1, rows }));
    println!("build: rows={} took={:.1}ms", n, t0.elapsed().as_secs_f64() * 1_000.0);

    let queries: Vec<(&str, ListQuery)> = vec![
        ("unfiltered", ListQuery::default()),
        ("provider", ListQuery::default().with_filter(FilterState::default().with("provider", FilterValue::set(["lambda", "runpod"])))),
        ("range+sort", ListQuery::default()
            .with_filter(FilterState::default().with("vram_gb", FilterValue::range(80.0, 1_000_000.0)))
            .sorted("price_hour_usd", true)),
        ("search", ListQuery::default().with_filter(FilterState::default().with_search("h100 sxm"))),
    ];

    for (label, q) in &queries {
        let mut times: Vec<u128> = Vec::with_capacity(20);
        for _ in 0..20 {
            let t = Instant::now();
            let _ = engine.list(q);
            times.push(t.elapsed().as_micros());
        }
        let p50 = percentile_us(&mut times.clone(), 0.50) as f64 / 1000.0;
        let p99 = percentile_us(&mut times, 0.99) as f64 / 1000.0;
        println!("{}: p50={:.3}ms p99={:.3}ms", label, p50, p99);
    }
}
