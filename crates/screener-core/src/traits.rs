use crate::{FactorSeries, FundamentalSnapshot, PricePoint, ScreenerError};
use async_trait::async_trait;

/// Upstream data provider for per-ticker raw payloads. Implementations
/// own transport concerns (rate limits, transient retries); the core
/// treats every failure identically.
#[async_trait]
pub trait MetricSource: Send + Sync {
    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalSnapshot, ScreenerError>;

    /// Daily adjusted closes, ordered ascending by date.
    async fn fetch_price_series(&self, ticker: &str) -> Result<Vec<PricePoint>, ScreenerError>;
}

/// Country factor-return source for the factor model. Failure is fatal to
/// the whole factor-model run, never per ticker.
#[async_trait]
pub trait FactorDataProvider: Send + Sync {
    async fn factor_series(&self, country: &str) -> Result<FactorSeries, ScreenerError>;
}
