//! Merge a batch of per-ticker fetches into the persisted dataset.

use screener_core::{CompanyFetch, Dataset, TickerRecord};
use std::collections::HashSet;

/// Knobs for `update_dataset`.
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// When a refresh fetch returns nothing for a ticker that already has
    /// a row, keep that row untouched instead of dropping it. A transient
    /// provider failure must not destroy previously known-good data.
    /// Turning this off treats an empty fetch as authoritative and removes
    /// the row.
    pub preserve_on_empty: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            preserve_on_empty: true,
        }
    }
}

/// Build a fresh dataset from a batch fetch: one row per ticker, in input
/// order.
pub fn create_dataset(fetches: &[CompanyFetch]) -> Dataset {
    let mut dataset = Dataset::new();
    for fetch in fetches {
        if dataset.row(&fetch.ticker).is_some() {
            tracing::warn!(ticker = %fetch.ticker, "duplicate ticker in batch, keeping first row");
            continue;
        }
        let mut record = TickerRecord::new(&fetch.ticker, &fetch.company);
        record.metrics = fetch.combined.clone();
        dataset.push_row(record);
    }
    dataset
}

/// Reconcile a batch fetch into an existing dataset.
///
/// Tickers absent from the incoming batch are removed outright. Incoming
/// tickers update their row field-by-field (columns not fetched this run
/// are preserved) or append a new row. New metric names extend the column
/// schema; pre-existing rows read null there. The schema never shrinks.
pub fn update_dataset(
    mut existing: Dataset,
    fetches: &[CompanyFetch],
    options: &ReconcileOptions,
) -> Dataset {
    let incoming: HashSet<&str> = fetches.iter().map(|f| f.ticker.as_str()).collect();

    let before = existing.len();
    existing.rows.retain(|row| incoming.contains(row.ticker.as_str()));
    let removed = before - existing.len();
    if removed > 0 {
        tracing::info!(removed, "dropped rows for tickers no longer tracked");
    }

    for fetch in fetches {
        if fetch.combined.is_empty() {
            // Nothing usable came back. Either keep the previously
            // known-good row untouched, or (configurably) drop it.
            if !options.preserve_on_empty {
                existing.rows.retain(|row| row.ticker != fetch.ticker);
            }
            if existing.row(&fetch.ticker).is_some() {
                tracing::warn!(ticker = %fetch.ticker, "empty refresh, keeping existing row");
            }
            continue;
        }

        for key in fetch.combined.keys() {
            existing.ensure_column(key);
        }

        match existing.row_mut(&fetch.ticker) {
            Some(row) => {
                row.company = fetch.company.clone();
                for (key, value) in &fetch.combined {
                    row.metrics.insert(key.clone(), value.clone());
                }
            }
            None => {
                let mut record = TickerRecord::new(&fetch.ticker, &fetch.company);
                record.metrics = fetch.combined.clone();
                existing.push_row(record);
            }
        }
    }

    existing
}
