//! Cross-sectional composite scores over the reconciled dataset.
//!
//! All composites are pure functions of the dataset (plus the per-run side
//! channel), recomputed from scratch every run. Rows missing a required
//! input are left null rather than punished with a worst-case rank.

use screener_core::{Dataset, MetricValue, SideChannelRecord, VOLATILITY_KEY};
use std::collections::HashMap;

/// Score column names written by this crate.
pub mod columns {
    pub const GREENBLATT: &str = "Greenblatt Rank";
    pub const CONSERVATIVE: &str = "Conservative Score";
    pub const QUALITY: &str = "Quality Score";
    pub const RESIDUAL_MOMENTUM: &str = "rMOM";
    pub const LAST_UPDATED: &str = "Last Updated";
}

/// 1-based ordinal ranks over (row index, value) pairs. Stable: ties keep
/// row order, which keeps reruns deterministic.
fn ordinal_ranks(values: &[(usize, f64)], ascending: bool) -> HashMap<usize, usize> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
    sorted
        .iter()
        .enumerate()
        .map(|(position, (row, _))| (*row, position + 1))
        .collect()
}

/// Percentile ranks in [0, 1] where 1.0 is always "best". A population of
/// one sits at 0.5.
fn percentile_ranks(values: &[(usize, f64)], higher_is_better: bool) -> HashMap<usize, f64> {
    let n = values.len();
    // Sorting so the best value lands last makes its 0-based position,
    // scaled by n-1, come out as 1.0.
    let ranks = ordinal_ranks(values, higher_is_better);
    ranks
        .into_iter()
        .map(|(row, rank)| {
            let pct = if n > 1 {
                (rank - 1) as f64 / (n - 1) as f64
            } else {
                0.5
            };
            (row, pct)
        })
        .collect()
}

fn rows_with(dataset: &Dataset, column: &str) -> Vec<(usize, f64)> {
    dataset
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| row.get_f64(column).map(|v| (i, v)))
        .collect()
}

fn set_by_index(dataset: &mut Dataset, index: usize, column: &str, value: f64) {
    dataset.ensure_column(column);
    dataset.rows[index]
        .metrics
        .insert(column.to_string(), MetricValue::Number(value));
}

/// Composites are recomputed from scratch each run: drop any values a
/// previous run left behind so newly ineligible rows read null again.
fn clear_column(dataset: &mut Dataset, column: &str) {
    dataset.ensure_column(column);
    for row in &mut dataset.rows {
        row.metrics.remove(column);
    }
}

/// Magic-formula composite: rank cheapness (five-year average P/E,
/// ascending) and profitability (ROCE, descending) independently over the
/// rows that have both inputs, then sum the ranks. Lower is better.
pub fn greenblatt_formula(dataset: &mut Dataset) {
    let eligible: Vec<(usize, f64, f64)> = dataset
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            match (row.get_f64("Avg PE 5Y"), row.get_f64("ROCE")) {
                (Some(pe), Some(roce)) => Some((i, pe, roce)),
                _ => None,
            }
        })
        .collect();

    let pe: Vec<(usize, f64)> = eligible.iter().map(|&(i, pe, _)| (i, pe)).collect();
    let roce: Vec<(usize, f64)> = eligible.iter().map(|&(i, _, roce)| (i, roce)).collect();

    let pe_ranks = ordinal_ranks(&pe, true);
    let roce_ranks = ordinal_ranks(&roce, false);

    clear_column(dataset, columns::GREENBLATT);
    for (index, _, _) in eligible {
        let combined = pe_ranks[&index] + roce_ranks[&index];
        set_by_index(dataset, index, columns::GREENBLATT, combined as f64);
    }
}

const CONSERVATIVE_WEIGHTS: &[(&str, f64, bool)] = &[
    ("Accruals", 0.2, false),
    ("Asset Growth 1Y", 0.2, false),
    ("Total Yield", 0.2, true),
];
const VOLATILITY_WEIGHT: f64 = 0.4;

/// Defensive-quality composite: low volatility (from the side channel),
/// low accruals, low asset growth, high total yield. Scored 0-100 from
/// cross-sectional percentiles; rows without the side-channel volatility
/// stay null.
pub fn conservative_formula(dataset: &mut Dataset, side_records: &[SideChannelRecord]) {
    let volatility_by_ticker: HashMap<&str, f64> = side_records
        .iter()
        .filter_map(|r| r.scalar(VOLATILITY_KEY).map(|v| (r.ticker.as_str(), v)))
        .collect();

    let volatility: Vec<(usize, f64)> = dataset
        .rows
        .iter()
        .enumerate()
        .filter_map(|(i, row)| {
            volatility_by_ticker
                .get(row.ticker.as_str())
                .map(|v| (i, *v))
        })
        .collect();

    let volatility_pct = percentile_ranks(&volatility, false);
    let component_pcts: Vec<(f64, HashMap<usize, f64>)> = CONSERVATIVE_WEIGHTS
        .iter()
        .map(|(column, weight, higher)| {
            (*weight, percentile_ranks(&rows_with(dataset, column), *higher))
        })
        .collect();

    clear_column(dataset, columns::CONSERVATIVE);
    for (index, _) in &volatility {
        let mut weighted = volatility_pct[index] * VOLATILITY_WEIGHT;
        let mut weight_sum = VOLATILITY_WEIGHT;
        for (weight, pcts) in &component_pcts {
            if let Some(pct) = pcts.get(index) {
                weighted += pct * weight;
                weight_sum += weight;
            }
        }
        set_by_index(
            dataset,
            *index,
            columns::CONSERVATIVE,
            weighted / weight_sum * 100.0,
        );
    }
}

const QUALITY_WEIGHTS: &[(&str, f64)] = &[
    ("ROCE", 0.25),
    ("Gross Profitability", 0.20),
    ("COP/AT", 0.20),
    ("EPS CAGR 3Y", 0.15),
    ("Total Yield", 0.20),
];

/// Weighted blend of profitability, growth and yield percentiles into one
/// 0-100 figure. Rows with none of the inputs stay null; partial rows are
/// scored over the weights of the columns they do have.
pub fn quality_score(dataset: &mut Dataset) {
    let component_pcts: Vec<(f64, HashMap<usize, f64>)> = QUALITY_WEIGHTS
        .iter()
        .map(|(column, weight)| {
            (*weight, percentile_ranks(&rows_with(dataset, column), true))
        })
        .collect();

    clear_column(dataset, columns::QUALITY);
    for index in 0..dataset.rows.len() {
        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        for (weight, pcts) in &component_pcts {
            if let Some(pct) = pcts.get(&index) {
                weighted += pct * weight;
                weight_sum += weight;
            }
        }
        if weight_sum > 0.0 {
            set_by_index(dataset, index, columns::QUALITY, weighted / weight_sum * 100.0);
        }
    }
}

/// Write the factor model's cross-sectional z-scores into the `rMOM`
/// column. Tickers absent from `scores` stay null.
pub fn apply_momentum_scores(dataset: &mut Dataset, scores: &HashMap<String, f64>) {
    clear_column(dataset, columns::RESIDUAL_MOMENTUM);
    for index in 0..dataset.rows.len() {
        if let Some(score) = scores.get(&dataset.rows[index].ticker) {
            set_by_index(dataset, index, columns::RESIDUAL_MOMENTUM, *score);
        }
    }
}

/// Stamp every row with the run date.
pub fn stamp_run_date(dataset: &mut Dataset, date: &str) {
    dataset.ensure_column(columns::LAST_UPDATED);
    for row in &mut dataset.rows {
        row.metrics.insert(
            columns::LAST_UPDATED.to_string(),
            MetricValue::Text(date.to_string()),
        );
    }
}
