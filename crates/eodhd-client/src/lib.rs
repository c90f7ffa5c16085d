//! EODHD HTTP client: the upstream `MetricSource`, plus the HTTP factor
//! data provider used by the factor model.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use reqwest::Client;
use screener_core::{
    FactorDataProvider, FactorObservation, FactorSeries, FundamentalSnapshot, MetricSource,
    PricePoint, ScreenerError,
};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BASE_URL: &str = "https://eodhd.com/api";

/// Years of daily history requested per ticker: enough for the 36-month
/// momentum window and for matching five fiscal-year-end prices.
const PRICE_HISTORY_YEARS: i64 = 6;

/// Sliding-window rate limiter: at most `max_requests` per `window` duration.
#[derive(Clone)]
struct RateLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            // Remove timestamps outside the window
            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            // Need to wait until the oldest request falls out of the window
            let wait_until = ts.front().unwrap().checked_add(self.window).unwrap();
            let sleep_dur = wait_until.duration_since(now) + Duration::from_millis(50);
            drop(ts);
            tracing::debug!(
                "Rate limiter: waiting {:.1}s for EODHD API slot",
                sleep_dur.as_secs_f64()
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

#[derive(Clone)]
pub struct EodhdClient {
    api_key: String,
    client: Client,
    rate_limiter: RateLimiter,
    base_url: String,
}

impl EodhdClient {
    pub fn new(api_key: String) -> Self {
        // EODHD all-in-one plans allow 1000 req/min; stay under it.
        let rate_limit: usize = std::env::var("EODHD_RATE_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(900);

        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            api_key,
            client,
            rate_limiter: RateLimiter::new(rate_limit, Duration::from_secs(60)),
            base_url: BASE_URL.to_string(),
        }
    }

    /// Point the client at a different host (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Send a request with rate limiting and automatic 429 retry.
    async fn send_request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ScreenerError> {
        let request = builder
            .build()
            .map_err(|e| ScreenerError::Api(e.to_string()))?;

        for attempt in 0..3u32 {
            self.rate_limiter.acquire().await;
            let req_clone = request
                .try_clone()
                .ok_or_else(|| ScreenerError::Api("Cannot clone request".to_string()))?;
            let response = self
                .client
                .execute(req_clone)
                .await
                .map_err(|e| ScreenerError::Api(e.to_string()))?;

            if response.status().as_u16() != 429 {
                return Ok(response);
            }

            let wait_secs = 15u64;
            tracing::warn!(
                "EODHD 429 rate limited, waiting {}s before retry {}/3",
                wait_secs,
                attempt + 1
            );
            tokio::time::sleep(Duration::from_secs(wait_secs)).await;
        }

        Err(ScreenerError::Api(
            "Rate limited by EODHD after 3 retries".to_string(),
        ))
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<serde_json::Value, ScreenerError> {
        let response = self
            .send_request(self.client.get(url).query(query))
            .await?;

        if !response.status().is_success() {
            return Err(ScreenerError::Api(format!(
                "HTTP {}: {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ScreenerError::Api(e.to_string()))
    }
}

/// One daily bar from the EOD endpoint; only the adjusted close matters here.
#[derive(Debug, Clone, Deserialize)]
struct EodBar {
    date: NaiveDate,
    adjusted_close: f64,
}

fn bars_to_price_points(mut bars: Vec<EodBar>) -> Vec<PricePoint> {
    bars.sort_by_key(|b| b.date);
    bars.into_iter()
        .map(|b| PricePoint {
            date: b.date,
            adjusted_close: b.adjusted_close,
        })
        .collect()
}

#[async_trait]
impl MetricSource for EodhdClient {
    async fn fetch_fundamentals(&self, ticker: &str) -> Result<FundamentalSnapshot, ScreenerError> {
        let url = format!("{}/fundamentals/{}", self.base_url, ticker);
        let value = self
            .get_json(&url, &[("api_token", self.api_key.as_str()), ("fmt", "json")])
            .await?;

        if !value.is_object() {
            return Err(ScreenerError::InvalidData(format!(
                "{ticker}: fundamentals payload is not an object"
            )));
        }
        Ok(FundamentalSnapshot::new(value))
    }

    async fn fetch_price_series(&self, ticker: &str) -> Result<Vec<PricePoint>, ScreenerError> {
        let from = (Utc::now() - ChronoDuration::days(PRICE_HISTORY_YEARS * 365))
            .format("%Y-%m-%d")
            .to_string();
        let url = format!("{}/eod/{}", self.base_url, ticker);
        let value = self
            .get_json(
                &url,
                &[
                    ("api_token", self.api_key.as_str()),
                    ("fmt", "json"),
                    ("period", "d"),
                    ("from", from.as_str()),
                ],
            )
            .await?;

        let bars: Vec<EodBar> = serde_json::from_value(value)
            .map_err(|e| ScreenerError::InvalidData(format!("{ticker}: {e}")))?;
        if bars.is_empty() {
            return Err(ScreenerError::InsufficientData(format!(
                "{ticker}: empty price series"
            )));
        }
        Ok(bars_to_price_points(bars))
    }
}

/// One period from the factor endpoint.
#[derive(Debug, Clone, Deserialize)]
struct FactorRow {
    date: NaiveDate,
    mkt_rf: f64,
    smb: f64,
    hml: f64,
    rf: f64,
}

/// Fetches country factor returns as JSON from a configurable base URL
/// (`{base}/{COUNTRY}.json`). Any failure here is fatal to the factor
/// model for the run, so errors map to `FactorSource`.
pub struct HttpFactorProvider {
    base_url: String,
    client: Client,
}

impl HttpFactorProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl FactorDataProvider for HttpFactorProvider {
    async fn factor_series(&self, country: &str) -> Result<FactorSeries, ScreenerError> {
        let url = format!("{}/{}.json", self.base_url, country.to_uppercase());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ScreenerError::FactorSource(format!("{country}: {e}")))?;

        if !response.status().is_success() {
            return Err(ScreenerError::FactorSource(format!(
                "{country}: HTTP {}",
                response.status()
            )));
        }

        let mut rows: Vec<FactorRow> = response
            .json()
            .await
            .map_err(|e| ScreenerError::FactorSource(format!("{country}: {e}")))?;
        if rows.is_empty() {
            return Err(ScreenerError::FactorSource(format!(
                "{country}: empty factor series"
            )));
        }
        rows.sort_by_key(|r| r.date);

        Ok(FactorSeries {
            country: country.to_string(),
            observations: rows
                .into_iter()
                .map(|r| FactorObservation {
                    date: r.date,
                    mkt_rf: r.mkt_rf,
                    smb: r.smb,
                    hml: r.hml,
                    rf: r.rf,
                })
                .collect(),
        })
    }
}
