//! End-to-end pipeline checks against deterministic in-memory collaborators:
//! fetch -> reconcile -> composite scores -> residual momentum.

use analysis_pipeline::{
    apply_momentum_scores, columns, conservative_formula, greenblatt_formula, quality_score,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use dataset_store::{create_dataset, update_dataset, ReconcileOptions};
use factor_model::FactorModelEngine;
use fetch_orchestrator::{run_batch, FetchOrchestrator};
use screener_core::{
    Dataset, FactorDataProvider, FactorObservation, FactorSeries, FundamentalSnapshot,
    MetricSource, PricePoint, ScreenerError, SideChannelRecord,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

struct MockSource {
    fundamentals: HashMap<String, FundamentalSnapshot>,
    prices: HashMap<String, Vec<PricePoint>>,
}

#[async_trait]
impl MetricSource for MockSource {
    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalSnapshot, ScreenerError> {
        self.fundamentals
            .get(ticker)
            .cloned()
            .ok_or_else(|| ScreenerError::Api(format!("no fundamentals for {ticker}")))
    }

    async fn fetch_price_series(&self, ticker: &str) -> Result<Vec<PricePoint>, ScreenerError> {
        self.prices
            .get(ticker)
            .cloned()
            .ok_or_else(|| ScreenerError::Api(format!("no prices for {ticker}")))
    }
}

struct StaticFactors(FactorSeries);

#[async_trait]
impl FactorDataProvider for StaticFactors {
    async fn factor_series(&self, _country: &str) -> Result<FactorSeries, ScreenerError> {
        Ok(self.0.clone())
    }
}

fn wiggle(i: usize, scale: f64) -> f64 {
    ((i as f64 * 2.39996).sin()) * scale
}

fn factor_series(periods: usize) -> FactorSeries {
    FactorSeries {
        country: "US".into(),
        observations: (0..periods)
            .map(|i| FactorObservation {
                date: NaiveDate::from_ymd_opt(2021 + (i / 12) as i32, (i % 12) as u32 + 1, 28)
                    .unwrap(),
                mkt_rf: 0.008 + wiggle(i, 0.03),
                smb: wiggle(i + 5, 0.02),
                hml: wiggle(i + 11, 0.02),
                rf: 0.003,
            })
            .collect(),
    }
}

fn prices(months: usize, seed: usize) -> Vec<PricePoint> {
    let mut close = 100.0 + seed as f64 * 10.0;
    (0..months)
        .map(|i| {
            close *= 1.0 + 0.01 + wiggle(i + seed * 31, 0.05);
            PricePoint {
                date: NaiveDate::from_ymd_opt(2020 + (i / 12) as i32, (i % 12) as u32 + 1, 28)
                    .unwrap(),
                adjusted_close: close,
            }
        })
        .collect()
}

fn snapshot(seed: f64) -> FundamentalSnapshot {
    FundamentalSnapshot::new(json!({
        "General": {"CurrencyCode": "USD", "Sector": "Technology"},
        "Highlights": {
            "MarketCapitalization": 1.0e9 * seed,
            "EarningsShare": 4.0 + seed,
            "PERatio": 18.0 + seed,
        },
        "Earnings": {"Annual": {
            "2024-12-31": {"epsActual": 4.0 + seed},
            "2023-12-31": {"epsActual": 3.5 + seed},
            "2022-12-31": {"epsActual": 3.0 + seed},
        }},
        "Financials": {
            "Balance_Sheet": {"yearly": {
                "2024-12-31": {
                    "totalAssets": 500.0e6 * seed,
                    "totalCurrentLiabilities": 100.0e6,
                    "commonStockSharesOutstanding": 190.0e6,
                },
                "2023-12-31": {
                    "totalAssets": 460.0e6 * seed,
                    "totalCurrentLiabilities": 95.0e6,
                    "commonStockSharesOutstanding": 200.0e6,
                },
            }},
            "Income_Statement": {"yearly": {
                "2024-12-31": {
                    "totalRevenue": 400.0e6, "grossProfit": 200.0e6,
                    "operatingIncome": 120.0e6, "netIncome": 100.0e6, "ebit": 120.0e6,
                },
                "2023-12-31": {
                    "totalRevenue": 340.0e6, "grossProfit": 170.0e6,
                    "operatingIncome": 100.0e6, "netIncome": 85.0e6, "ebit": 100.0e6,
                },
            }},
            "Cash_Flow": {"yearly": {
                "2024-12-31": {
                    "totalCashFromOperatingActivities": 130.0e6,
                    "capitalExpenditures": 30.0e6,
                    "dividendsPaid": -20.0e6,
                    "salePurchaseOfStock": -30.0e6,
                    "depreciation": 25.0e6,
                },
                "2023-12-31": {
                    "totalCashFromOperatingActivities": 110.0e6,
                    "capitalExpenditures": 28.0e6,
                    "dividendsPaid": -18.0e6,
                    "salePurchaseOfStock": -12.0e6,
                    "depreciation": 23.0e6,
                },
            }},
        },
    }))
}

fn source_for(tickers: &[&str]) -> MockSource {
    let mut fundamentals = HashMap::new();
    let mut price_map = HashMap::new();
    for (i, ticker) in tickers.iter().enumerate() {
        fundamentals.insert(ticker.to_string(), snapshot(1.0 + i as f64 * 0.3));
        price_map.insert(ticker.to_string(), prices(40, i));
    }
    MockSource {
        fundamentals,
        prices: price_map,
    }
}

fn entities(tickers: &[&str]) -> Vec<(String, String)> {
    tickers
        .iter()
        .map(|t| (format!("{t} INC"), t.to_string()))
        .collect()
}

async fn full_run(source: MockSource, list: &[&str]) -> (Dataset, Vec<SideChannelRecord>) {
    let orchestrator = FetchOrchestrator::new(Arc::new(source));
    let fetches = run_batch(&orchestrator, &entities(list), 4).await;
    let side: Vec<SideChannelRecord> = fetches.iter().map(|f| f.side.clone()).collect();

    let mut dataset = create_dataset(&fetches);
    greenblatt_formula(&mut dataset);
    conservative_formula(&mut dataset, &side);
    quality_score(&mut dataset);

    let engine = FactorModelEngine::new(StaticFactors(factor_series(36)));
    let scores = engine.score("US", &side).await.unwrap();
    apply_momentum_scores(&mut dataset, &scores);

    (dataset, side)
}

#[tokio::test]
async fn pipeline_is_idempotent_against_identical_collaborators() {
    let list = ["AAPL", "MSFT", "TSLA"];

    let (first, _) = full_run(source_for(&list), &list).await;
    let (second, _) = full_run(source_for(&list), &list).await;

    // No timestamp column is stamped here, so the runs must match exactly
    assert_eq!(first, second);
}

#[tokio::test]
async fn failed_profitability_derivation_still_keeps_all_rows() {
    let list = ["AAPL", "MSFT", "TSLA"];
    let mut source = source_for(&list);
    // Break exactly the gross-profitability input for TSLA
    let tsla = source.fundamentals.get_mut("TSLA").unwrap();
    tsla.0["Financials"]["Income_Statement"]["yearly"]["2024-12-31"]
        .as_object_mut()
        .unwrap()
        .remove("grossProfit");

    let (dataset, _) = full_run(source, &list).await;

    assert_eq!(dataset.len(), 3);
    assert!(dataset
        .row("AAPL")
        .unwrap()
        .get_f64("Gross Profitability")
        .is_some());
    assert!(dataset
        .row("MSFT")
        .unwrap()
        .get_f64("Gross Profitability")
        .is_some());
    assert!(dataset
        .row("TSLA")
        .unwrap()
        .get("Gross Profitability")
        .is_none());
}

#[tokio::test]
async fn update_run_replaces_departed_ticker_and_adds_new() {
    // First run tracks {AAPL, MSFT}
    let first_list = ["AAPL", "MSFT"];
    let (existing, _) = full_run(source_for(&first_list), &first_list).await;
    assert_eq!(existing.len(), 2);

    // Second run tracks {MSFT, GOOG}
    let second_list = ["MSFT", "GOOG"];
    let orchestrator = FetchOrchestrator::new(Arc::new(source_for(&second_list)));
    let fetches = run_batch(&orchestrator, &entities(&second_list), 4).await;
    let updated = update_dataset(existing, &fetches, &ReconcileOptions::default());

    let tickers: Vec<&str> = updated.tickers().collect();
    assert_eq!(tickers, vec!["MSFT", "GOOG"]);
    assert!(updated.row("AAPL").is_none());
    assert!(updated.row("GOOG").unwrap().get_f64("ROCE").is_some());
}

#[tokio::test]
async fn momentum_column_tracks_history_sufficiency() {
    let list = ["FULL", "SHORT"];
    let mut source = source_for(&list);
    // 36 month-end closes -> only 35 monthly returns for SHORT
    source.prices.insert("SHORT".to_string(), prices(36, 1));

    let (dataset, _) = full_run(source, &list).await;

    assert!(dataset
        .row("FULL")
        .unwrap()
        .get_f64(columns::RESIDUAL_MOMENTUM)
        .is_some());
    assert!(dataset
        .row("SHORT")
        .unwrap()
        .get(columns::RESIDUAL_MOMENTUM)
        .is_none());
}
