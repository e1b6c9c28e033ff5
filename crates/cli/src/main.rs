use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tally_api::{CatalogApi, InProcApi, Session, TallyError};
use tally_core::facet::FacetValue;
use tally_core::{Catalog, Facets, ListPage, Row};
use tally_persist::SqliteCatalog;
use tally_search::query::parse_query_string;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tallyctl", version, about = "Tally catalog CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database file (default: ~/.tally/tally.db)
    #[arg(long = "db", global = true, env = "TALLY_DB_PATH")]
    db: Option<String>,

    /// User id for favorites commands
    #[arg(long = "user", global = true, env = "TALLY_USER")]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replace a catalog with the records of a JSON file (an array, or an object with `data`)
    Load {
        /// gpu | cpu | model
        catalog: String,
        file: String,
    },
    /// List one page of a catalog
    Ls {
        catalog: String,
        /// URL query string, e.g. "provider=lambda,runpod&vram_gb=40-80&sort=price_hour_usd.asc"
        #[arg(default_value = "")]
        query: String,
        /// Print rejected parameters and pipeline counts
        #[arg(long = "explain", action = ArgAction::SetTrue)]
        explain: bool,
    },
    /// Print facets over the full catalog
    Facets {
        catalog: String,
        /// Only this field
        #[arg(long = "field")]
        field: Option<String>,
    },
    /// Manage favorites of --user; each catalog keeps its own set
    Fav {
        #[command(subcommand)]
        action: FavAction,
    },
    /// Resolve stable keys to rows
    Resolve {
        catalog: String,
        keys: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum FavAction {
    /// Show favorited keys
    Ls { catalog: String },
    Add { catalog: String, keys: Vec<String> },
    Rm { catalog: String, keys: Vec<String> },
    /// List favorited rows of a catalog through filters and sort
    Rows {
        catalog: String,
        #[arg(default_value = "")]
        query: String,
    },
}

fn init_tracing() {
    let env = std::env::var("TALLY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TALLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TALLY_METRICS_ADDR; expected host:port");
        }
    }
}

fn open_api(db: Option<&str>) -> Result<InProcApi> {
    let catalog = match db {
        Some(path) => SqliteCatalog::open(path)?,
        None => SqliteCatalog::open_default()?,
    };
    InProcApi::new(catalog).map_err(api_err)
}

fn session(user: Option<&str>) -> Option<Session> { user.filter(|u| !u.trim().is_empty()).map(Session::new) }

/// Surface API errors with their status code.
fn api_err(e: TallyError) -> anyhow::Error { anyhow::anyhow!("{} (status {})", e, e.status()) }

fn read_rows(catalog: Catalog, file: &str) -> Result<Vec<Row>> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    let doc: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", file))?;
    let records = match doc {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj.remove("data") {
            Some(serde_json::Value::Array(items)) => items,
            _ => anyhow::bail!("{}: expected an array or an object with a `data` array", file),
        },
        _ => anyhow::bail!("{}: expected an array or an object with a `data` array", file),
    };
    let mut rows = Vec::with_capacity(records.len());
    let mut skipped = 0usize;
    for rec in records {
        match Row::from_record(catalog, rec) {
            Ok(r) => rows.push(r),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "load: skipping record");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, kept = rows.len(), "load: some records were skipped");
    }
    Ok(rows)
}

fn render_value(v: &Option<FacetValue>) -> String {
    match v {
        None => "(missing)".to_string(),
        Some(FacetValue::Number(n)) => format!("{}", n),
        Some(FacetValue::Text(t)) => t.clone(),
    }
}

fn print_page(output: Output, page: &ListPage) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<24} {:<40} {:>6}", "ID", "STABLE KEY", "PCTL");
            for r in &page.data {
                let pct = r.percentile.map(|p| format!("{:.0}", p)).unwrap_or_else(|| "-".to_string());
                println!("{:<24} {:<40} {:>6}", r.row.id, r.row.stable_key, pct);
            }
            let cur = |c: Option<u64>| c.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "rows: {}/{} (total {}) prev={} next={}",
                page.data.len(),
                page.meta.filter_row_count,
                page.meta.total_row_count,
                cur(page.prev_cursor),
                cur(page.next_cursor)
            );
            if let Some(p) = &page.meta.percentiles {
                println!("p50={} p75={} p90={} p95={} p99={}", p.p50, p.p75, p.p90, p.p95, p.p99);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(page)?),
    }
    Ok(())
}

fn print_facets(output: Output, facets: &Facets, only: Option<&str>) -> Result<()> {
    let selected: Facets = facets.iter().filter(|(k, _)| only.map_or(true, |f| f == k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect();
    if let Some(f) = only {
        if selected.is_empty() {
            anyhow::bail!("no facet named `{}`", f);
        }
    }
    match output {
        Output::Human => {
            for (name, facet) in &selected {
                let range = match (facet.min, facet.max) {
                    (Some(lo), Some(hi)) => format!(" [{}..{}]", lo, hi),
                    _ => String::new(),
                };
                println!("{} (total {}){}", name, facet.total, range);
                for r in &facet.rows {
                    println!("  {:<32} {}", render_value(&r.value), r.count);
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&selected)?),
    }
    Ok(())
}

fn print_keys(output: Output, keys: &[String]) -> Result<()> {
    match output {
        Output::Human => {
            for k in keys {
                println!("{}", k);
            }
            println!("{} favorite(s)", keys.len());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(keys)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = open_api(cli.db.as_deref())?;
    let sess = session(cli.user.as_deref());

    match cli.command {
        Commands::Load { catalog, file } => {
            let catalog = Catalog::from_str(&catalog)?;
            let t0 = Instant::now();
            let rows = read_rows(catalog, &file)?;
            let n = api.load(catalog, rows).await.map_err(api_err)?;
            info!(catalog = %catalog, rows = n, took_ms = %t0.elapsed().as_millis(), "load invoked");
            match cli.output {
                Output::Human => println!("loaded {} {} rows", n, catalog),
                Output::Json => println!("{}", serde_json::json!({ "catalog": catalog, "rows": n })),
            }
        }
        Commands::Ls { catalog, query, explain } => {
            let catalog = Catalog::from_str(&catalog)?;
            let report = parse_query_string(catalog, &query);
            for r in &report.rejected {
                warn!(key = %r.key, reason = %r.reason, "ls: ignoring parameter");
            }
            info!(catalog = %catalog, query = %query, "ls invoked");
            let page = api.list(catalog, report.query).await.map_err(api_err)?;
            print_page(cli.output, &page)?;
            if explain && matches!(cli.output, Output::Human) {
                let rejected: Vec<String> = report.rejected.iter().map(|r| format!("{}: {}", r.key, r.reason)).collect();
                eprintln!(
                    "debug: total={} filtered={} page={} rejected=[{}]",
                    page.meta.total_row_count,
                    page.meta.filter_row_count,
                    page.data.len(),
                    rejected.join("; ")
                );
            }
        }
        Commands::Facets { catalog, field } => {
            let catalog = Catalog::from_str(&catalog)?;
            let facets = api.facets(catalog).await.map_err(api_err)?;
            print_facets(cli.output, &facets, field.as_deref())?;
        }
        Commands::Fav { action } => match action {
            FavAction::Ls { catalog } => {
                let catalog = Catalog::from_str(&catalog)?;
                let keys = api.favorites(sess.as_ref(), catalog).await.map_err(api_err)?;
                print_keys(cli.output, &keys)?;
            }
            FavAction::Add { catalog, keys } => {
                let catalog = Catalog::from_str(&catalog)?;
                let keys = api.add_favorites(sess.as_ref(), catalog, keys).await.map_err(api_err)?;
                print_keys(cli.output, &keys)?;
            }
            FavAction::Rm { catalog, keys } => {
                let catalog = Catalog::from_str(&catalog)?;
                let keys = api.remove_favorites(sess.as_ref(), catalog, keys).await.map_err(api_err)?;
                print_keys(cli.output, &keys)?;
            }
            FavAction::Rows { catalog, query } => {
                let catalog = Catalog::from_str(&catalog)?;
                let report = parse_query_string(catalog, &query);
                for r in &report.rejected {
                    warn!(key = %r.key, reason = %r.reason, "fav rows: ignoring parameter");
                }
                let page = api.favorite_rows(sess.as_ref(), catalog, report.query).await.map_err(api_err)?;
                print_page(cli.output, &page)?;
            }
        },
        Commands::Resolve { catalog, keys } => {
            let catalog = Catalog::from_str(&catalog)?;
            let rows = api.resolve_rows(catalog, keys).await.map_err(api_err)?;
            match cli.output {
                Output::Human => {
                    for r in &rows {
                        println!("{:<40} {}", r.stable_key, r.id);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
    }

    Ok(())
}
