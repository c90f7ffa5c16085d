//! screener-cli: fetch fundamentals for a tracked portfolio, reconcile the
//! persisted dataset, and score it.
//!
//! For each ticker in the input portfolio, fetches the fundamental snapshot
//! and price history, derives all registered metrics with per-metric fault
//! isolation, merges the batch into the output CSV (update semantics), and
//! recomputes the composite and residual-momentum scores.
//!
//! Usage:
//!   screener-cli --input portfolio.csv --output dataset.csv
//!   screener-cli -i portfolio.csv -o dataset.csv --create
//!   screener-cli -i portfolio.csv -o dataset.csv --country SE --concurrency 5

use analysis_pipeline::{
    apply_momentum_scores, conservative_formula, greenblatt_formula, quality_score,
    stamp_run_date,
};
use chrono::Utc;
use dataset_store::{create_dataset, extract_tickers_from_csv, update_dataset, CsvDatasetStore,
    ReconcileOptions};
use eodhd_client::{EodhdClient, HttpFactorProvider};
use factor_model::FactorModelEngine;
use fetch_orchestrator::{run_batch, FetchOrchestrator};
use screener_core::SideChannelRecord;
use std::sync::Arc;

const DEFAULT_CONCURRENCY: usize = 10;

fn arg_value(args: &[String], long: &str, short: Option<&str>) -> Option<String> {
    args.iter()
        .position(|a| a == long || short.is_some_and(|s| a == s))
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  screener-cli --input PORTFOLIO.csv --output DATASET.csv   Update (or create) the dataset");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -i, --input PATH       Portfolio CSV: header row, then company,ticker");
    eprintln!("  -o, --output PATH      Persisted dataset CSV");
    eprintln!("  --create               Rebuild the dataset from scratch instead of updating");
    eprintln!("  --drop-on-empty        Remove rows whose refresh fetch returned nothing");
    eprintln!("  --country CODE         Factor-model country (default: US)");
    eprintln!("  --factor-url URL       Factor data base URL (default: env FACTOR_DATA_URL)");
    eprintln!("  --concurrency N        Max parallel tickers (default: {DEFAULT_CONCURRENCY})");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  EODHD_API_KEY          Required. EODHD API token");
    eprintln!("  EODHD_RATE_LIMIT       Requests per minute (default: 900)");
    eprintln!("  FACTOR_DATA_URL        Factor data base URL");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screener_cli=info,fetch_orchestrator=info,eodhd_client=warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let Some(input) = arg_value(&args, "--input", Some("-i")) else {
        usage();
    };
    let Some(output) = arg_value(&args, "--output", Some("-o")) else {
        usage();
    };
    let create = args.iter().any(|a| a == "--create");
    let drop_on_empty = args.iter().any(|a| a == "--drop-on-empty");
    let country = arg_value(&args, "--country", None).unwrap_or_else(|| "US".to_string());
    let concurrency: usize = arg_value(&args, "--concurrency", None)
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CONCURRENCY);
    let factor_url = arg_value(&args, "--factor-url", None)
        .or_else(|| std::env::var("FACTOR_DATA_URL").ok());

    let api_key =
        std::env::var("EODHD_API_KEY").map_err(|_| anyhow::anyhow!("EODHD_API_KEY must be set"))?;

    let (companies, tickers) = extract_tickers_from_csv(&input)?;
    if tickers.is_empty() {
        anyhow::bail!("{input}: no tickers found");
    }
    let entities: Vec<(String, String)> = companies.into_iter().zip(tickers).collect();
    tracing::info!(
        "screener-cli: {} tickers, output={}, create={}, concurrency={}",
        entities.len(),
        output,
        create,
        concurrency
    );

    let source = Arc::new(EodhdClient::new(api_key));
    let orchestrator = FetchOrchestrator::new(source);
    let fetches = run_batch(&orchestrator, &entities, concurrency).await;

    let fetched = fetches.iter().filter(|f| !f.combined.is_empty()).count();
    tracing::info!("fetched {}/{} tickers with data", fetched, fetches.len());

    let store = CsvDatasetStore::new(&output);
    let options = ReconcileOptions {
        preserve_on_empty: !drop_on_empty,
    };

    let mut dataset = if create {
        create_dataset(&fetches)
    } else {
        match store.load()? {
            Some(existing) => update_dataset(existing, &fetches, &options),
            None => {
                tracing::info!("{} not found, creating a new dataset", output);
                create_dataset(&fetches)
            }
        }
    };

    let side_records: Vec<SideChannelRecord> = fetches.iter().map(|f| f.side.clone()).collect();

    greenblatt_formula(&mut dataset);
    conservative_formula(&mut dataset, &side_records);
    quality_score(&mut dataset);

    // Residual momentum: the shared factor fetch is fatal to this engine
    // only; the dataset is still reconciled and saved without rMOM.
    match factor_url {
        Some(url) => {
            let engine = FactorModelEngine::new(HttpFactorProvider::new(url));
            match engine.score(&country, &side_records).await {
                Ok(scores) => apply_momentum_scores(&mut dataset, &scores),
                Err(e) => {
                    tracing::error!("factor model failed for {country}, no rMOM this run: {e}")
                }
            }
        }
        None => {
            tracing::warn!("no factor data source configured, skipping residual momentum");
        }
    }

    stamp_run_date(&mut dataset, &Utc::now().format("%Y-%m-%d").to_string());
    store.save(&dataset)?;
    tracing::info!("saved {} rows x {} columns to {}", dataset.len(), dataset.columns.len() + 2, output);

    Ok(())
}
