use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Side-channel key for the trailing monthly return series.
pub const MONTHLY_RETURNS_KEY: &str = "Monthly Returns";
/// Side-channel key for annualized 36-month volatility.
pub const VOLATILITY_KEY: &str = "Volatility 3Y";

/// Trailing window of monthly observations used by the factor model.
pub const MOMENTUM_LOOKBACK_MONTHS: usize = 36;

/// One daily price observation (dividend/split adjusted)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub adjusted_close: f64,
}

/// One tabular cell: most metrics are numeric, but the provider also
/// supplies text cells (currency code, sector name) that live in the
/// same table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetricValue::Number(_) => None,
            MetricValue::Text(s) => Some(s),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(n: f64) -> Self {
        MetricValue::Number(n)
    }
}

impl From<&str> for MetricValue {
    fn from(s: &str) -> Self {
        MetricValue::Text(s.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(s: String) -> Self {
        MetricValue::Text(s)
    }
}

/// One row of the dataset. `metrics` is sparse: an absent key means
/// "not computable this run", never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerRecord {
    pub ticker: String,
    pub company: String,
    pub metrics: BTreeMap<String, MetricValue>,
}

impl TickerRecord {
    pub fn new(ticker: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            company: company.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&MetricValue> {
        self.metrics.get(column)
    }

    pub fn get_f64(&self, column: &str) -> Option<f64> {
        self.metrics.get(column).and_then(MetricValue::as_f64)
    }
}

/// Non-scalar per-ticker value carried alongside the tabular record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SideValue {
    Scalar(f64),
    Series(Vec<f64>),
}

impl SideValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SideValue::Scalar(v) => Some(*v),
            SideValue::Series(_) => None,
        }
    }

    pub fn as_series(&self) -> Option<&[f64]> {
        match self {
            SideValue::Scalar(_) => None,
            SideValue::Series(s) => Some(s),
        }
    }
}

/// Per-ticker artifacts too complex for one table cell (e.g. a monthly
/// return series). Lifetime is one run; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideChannelRecord {
    pub ticker: String,
    pub company: String,
    pub values: BTreeMap<String, SideValue>,
}

impl SideChannelRecord {
    pub fn new(ticker: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            company: company.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn scalar(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(SideValue::as_scalar)
    }

    pub fn series(&self, key: &str) -> Option<&[f64]> {
        self.values.get(key).and_then(SideValue::as_series)
    }
}

/// The full result of one per-ticker fetch: scalar metrics destined for
/// the dataset plus the non-scalar side channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CompanyFetch {
    pub company: String,
    pub ticker: String,
    pub combined: BTreeMap<String, MetricValue>,
    pub side: SideChannelRecord,
}

impl CompanyFetch {
    /// Degenerate row: ticker and company only, no metrics. Produced when
    /// the whole per-ticker pipeline failed rather than one derivation.
    pub fn degenerate(company: impl Into<String>, ticker: impl Into<String>) -> Self {
        let company = company.into();
        let ticker = ticker.into();
        Self {
            side: SideChannelRecord::new(ticker.clone(), company.clone()),
            company,
            ticker,
            combined: BTreeMap::new(),
        }
    }
}

/// Ordered collection of ticker rows with an explicit column schema.
///
/// Invariants: at most one row per ticker; `columns` is the union of every
/// metric name ever observed, in first-seen order, and never shrinks
/// automatically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    pub columns: Vec<String>,
    pub rows: Vec<TickerRecord>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn tickers(&self) -> impl Iterator<Item = &str> {
        self.rows.iter().map(|r| r.ticker.as_str())
    }

    pub fn row(&self, ticker: &str) -> Option<&TickerRecord> {
        self.rows.iter().find(|r| r.ticker == ticker)
    }

    pub fn row_mut(&mut self, ticker: &str) -> Option<&mut TickerRecord> {
        self.rows.iter_mut().find(|r| r.ticker == ticker)
    }

    /// Add a column to the schema if absent. Pre-existing rows implicitly
    /// read null for it.
    pub fn ensure_column(&mut self, name: &str) {
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_string());
        }
    }

    /// Append a row, extending the schema with any new metric keys.
    /// Panics in debug builds if the ticker already has a row.
    pub fn push_row(&mut self, record: TickerRecord) {
        debug_assert!(
            self.row(&record.ticker).is_none(),
            "duplicate ticker row: {}",
            record.ticker
        );
        for key in record.metrics.keys() {
            self.ensure_column(key);
        }
        self.rows.push(record);
    }

    /// Set one cell, extending the schema if needed. No-op when the ticker
    /// has no row.
    pub fn set(&mut self, ticker: &str, column: &str, value: MetricValue) {
        self.ensure_column(column);
        if let Some(row) = self.row_mut(ticker) {
            row.metrics.insert(column.to_string(), value);
        }
    }
}

/// One period of country factor returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorObservation {
    pub date: NaiveDate,
    /// Market return minus the risk-free rate
    pub mkt_rf: f64,
    /// Small-minus-big size factor
    pub smb: f64,
    /// High-minus-low value factor
    pub hml: f64,
    /// Risk-free rate for the period
    pub rf: f64,
}

/// Time-aligned factor returns for one country, ordered ascending by date.
/// Fetched once per run and shared read-only across all scored tickers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSeries {
    pub country: String,
    pub observations: Vec<FactorObservation>,
}

impl FactorSeries {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Trailing `window` observations, or None if history is too short.
    pub fn trailing(&self, window: usize) -> Option<&[FactorObservation]> {
        if self.observations.len() < window {
            return None;
        }
        Some(&self.observations[self.observations.len() - window..])
    }
}

/// Per-ticker OLS fit over the lookback window.
#[derive(Debug, Clone, PartialEq)]
pub struct RegressionResult {
    pub alpha: f64,
    /// Slopes on [Mkt-RF, SMB, HML]
    pub betas: [f64; 3],
    pub residuals: Vec<f64>,
}

/// Opaque fundamental payload from the data provider, with typed accessors
/// for the handful of JSON paths the derivations read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundamentalSnapshot(pub Value);

/// Read a numeric field that the provider may encode as a JSON number or
/// as a decimal string.
pub fn field_f64(value: &Value, key: &str) -> Option<f64> {
    let v = value.get(key)?;
    v.as_f64()
        .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
}

impl FundamentalSnapshot {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn general_str(&self, field: &str) -> Option<&str> {
        self.0.get("General")?.get(field)?.as_str()
    }

    pub fn highlight(&self, field: &str) -> Option<f64> {
        field_f64(self.0.get("Highlights")?, field)
    }

    pub fn shares_stat(&self, field: &str) -> Option<f64> {
        field_f64(self.0.get("SharesStats")?, field)
    }

    pub fn technical(&self, field: &str) -> Option<f64> {
        field_f64(self.0.get("Technicals")?, field)
    }

    /// Yearly entries of one financial statement, most recent first.
    /// Statement names follow the provider: "Balance_Sheet",
    /// "Income_Statement", "Cash_Flow".
    pub fn yearly(&self, statement: &str) -> Vec<(&str, &Value)> {
        let mut entries: Vec<(&str, &Value)> = self
            .0
            .get("Financials")
            .and_then(|f| f.get(statement))
            .and_then(|s| s.get("yearly"))
            .and_then(|y| y.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.as_str(), v)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| b.0.cmp(a.0));
        entries
    }

    /// Annual reported EPS, most recent first.
    pub fn annual_eps(&self) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> = self
            .0
            .get("Earnings")
            .and_then(|e| e.get("Annual"))
            .and_then(|a| a.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| field_f64(v, "epsActual").map(|eps| (k.as_str(), eps)))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| b.0.cmp(a.0));
        entries
    }
}
