//! Residual momentum: a cross-sectional momentum signal computed from the
//! part of monthly returns that a three-factor model cannot explain.
//!
//! Per ticker the stages are linear: insufficient history is terminal
//! null; otherwise excess returns are regressed on the country factor
//! returns, the residual mean/std over the skip-month sub-window forms
//! the momentum statistic, and the statistic is z-scored across the run's
//! ticker set. A failure at any stage yields null for that ticker only;
//! only the shared factor fetch is fatal to the whole run.

use dashmap::DashMap;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use screener_core::{
    FactorDataProvider, FactorSeries, RegressionResult, ScreenerError, SideChannelRecord,
    MOMENTUM_LOOKBACK_MONTHS, MONTHLY_RETURNS_KEY,
};
use statrs::statistics::Statistics;
use std::collections::HashMap;

pub struct FactorModelEngine<P: FactorDataProvider> {
    provider: P,
    lookback: usize,
    /// One factor fetch per country per run; shared read-only afterwards.
    cache: DashMap<String, FactorSeries>,
}

impl<P: FactorDataProvider> FactorModelEngine<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            lookback: MOMENTUM_LOOKBACK_MONTHS,
            cache: DashMap::new(),
        }
    }

    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Factor series for a country, fetched at most once per run.
    /// Too-short history from the provider is a factor-source failure:
    /// no ticker could be scored against it.
    pub async fn factor_series(&self, country: &str) -> Result<FactorSeries, ScreenerError> {
        if let Some(series) = self.cache.get(country) {
            return Ok(series.clone());
        }

        let series = self.provider.factor_series(country).await?;
        if series.len() < self.lookback {
            return Err(ScreenerError::FactorSource(format!(
                "{country}: {} factor periods, need {}",
                series.len(),
                self.lookback
            )));
        }

        self.cache.insert(country.to_string(), series.clone());
        Ok(series)
    }

    /// Score every record's monthly-return series against the country
    /// factors and return the cross-sectional `rMOM` z-scores. Tickers
    /// with insufficient history or a degenerate fit are absent from the
    /// map (null downstream).
    pub async fn score(
        &self,
        country: &str,
        records: &[SideChannelRecord],
    ) -> Result<HashMap<String, f64>, ScreenerError> {
        let factors = self.factor_series(country).await?;
        let lookback = self.lookback;

        let stats: Vec<(String, Option<f64>)> = records
            .par_iter()
            .map(|record| {
                let stat = record
                    .series(MONTHLY_RETURNS_KEY)
                    .and_then(|returns| residual_momentum(returns, &factors, lookback));
                if stat.is_none() {
                    tracing::debug!(ticker = %record.ticker, "no residual momentum (insufficient history or degenerate fit)");
                }
                (record.ticker.clone(), stat)
            })
            .collect();

        let scored = stats.iter().filter(|(_, s)| s.is_some()).count();
        tracing::info!(country, scored, total = records.len(), "residual momentum computed");

        Ok(cross_sectional_zscores(&stats))
    }
}

/// The full per-ticker chain: align, regress, summarize residuals.
pub fn residual_momentum(monthly: &[f64], factors: &FactorSeries, lookback: usize) -> Option<f64> {
    let excess = excess_returns(monthly, factors, lookback)?;
    let fit = regress(&excess, factors)?;
    momentum_statistic(&fit.residuals)
}

/// Trailing `lookback` monthly returns minus the contemporaneous
/// risk-free rate. None when fewer aligned periods exist; short series
/// are never padded or silently truncated into a shorter fit.
pub fn excess_returns(monthly: &[f64], factors: &FactorSeries, lookback: usize) -> Option<Vec<f64>> {
    if monthly.len() < lookback {
        return None;
    }
    let tail = &monthly[monthly.len() - lookback..];
    let observations = factors.trailing(lookback)?;
    Some(
        tail.iter()
            .zip(observations)
            .map(|(r, o)| r - o.rf)
            .collect(),
    )
}

/// OLS of excess returns on [Mkt-RF, SMB, HML] with intercept, over the
/// trailing window matching the excess-return length.
pub fn regress(excess: &[f64], factors: &FactorSeries) -> Option<RegressionResult> {
    let n = excess.len();
    if n <= 4 {
        return None;
    }
    let observations = factors.trailing(n)?;

    let mut x = DMatrix::<f64>::from_element(n, 4, 1.0);
    for (i, o) in observations.iter().enumerate() {
        x[(i, 1)] = o.mkt_rf;
        x[(i, 2)] = o.smb;
        x[(i, 3)] = o.hml;
    }
    let y = DVector::from_column_slice(excess);

    let beta = x.clone().svd(true, true).solve(&y, 1e-10).ok()?;
    let residuals = &y - &x * &beta;

    Some(RegressionResult {
        alpha: beta[0],
        betas: [beta[1], beta[2], beta[3]],
        residuals: residuals.iter().copied().collect(),
    })
}

/// Risk-adjusted average residual over the sub-window that skips the most
/// recent period (the 11-of-12 convention). Zero residual variance is
/// undefined, not a divide-by-zero.
pub fn momentum_statistic(residuals: &[f64]) -> Option<f64> {
    if residuals.len() < 3 {
        return None;
    }
    let window = &residuals[..residuals.len() - 1];
    let mean = window.mean();
    let std_dev = window.std_dev();
    if !(std_dev > 0.0) || !std_dev.is_finite() {
        return None;
    }
    Some(mean / std_dev)
}

/// Normalize the momentum statistics cross-sectionally. Undefined inputs
/// are excluded from the statistics and from the output.
pub fn cross_sectional_zscores(stats: &[(String, Option<f64>)]) -> HashMap<String, f64> {
    let defined: Vec<f64> = stats.iter().filter_map(|(_, s)| *s).collect();
    if defined.is_empty() {
        return HashMap::new();
    }
    let mean = defined.as_slice().mean();
    let std_dev = defined.as_slice().std_dev();

    stats
        .iter()
        .filter_map(|(ticker, stat)| {
            stat.map(|s| {
                let z = if std_dev > 0.0 && std_dev.is_finite() {
                    (s - mean) / std_dev
                } else {
                    0.0
                };
                (ticker.clone(), z)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use screener_core::{FactorObservation, SideValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic pseudo-noise in [-scale, scale]; keeps tests free of
    /// RNG seeds while still exercising a non-degenerate fit.
    fn wiggle(i: usize, scale: f64) -> f64 {
        ((i as f64 * 2.39996).sin()) * scale
    }

    fn synthetic_factors(periods: usize) -> FactorSeries {
        let observations = (0..periods)
            .map(|i| FactorObservation {
                date: NaiveDate::from_ymd_opt(2021 + (i / 12) as i32, (i % 12) as u32 + 1, 28)
                    .unwrap(),
                mkt_rf: 0.01 + wiggle(i, 0.04),
                smb: wiggle(i + 7, 0.02),
                hml: wiggle(i + 13, 0.03),
                rf: 0.003,
            })
            .collect();
        FactorSeries {
            country: "US".into(),
            observations,
        }
    }

    /// Monthly raw returns generated as a known linear combination of the
    /// factors plus the risk-free rate and small noise.
    fn generated_returns(
        factors: &FactorSeries,
        alpha: f64,
        betas: [f64; 3],
        noise: f64,
    ) -> Vec<f64> {
        factors
            .observations
            .iter()
            .enumerate()
            .map(|(i, o)| {
                alpha
                    + betas[0] * o.mkt_rf
                    + betas[1] * o.smb
                    + betas[2] * o.hml
                    + o.rf
                    + wiggle(i + 29, noise)
            })
            .collect()
    }

    struct StaticProvider {
        series: FactorSeries,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FactorDataProvider for StaticProvider {
        async fn factor_series(&self, _country: &str) -> Result<FactorSeries, ScreenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.series.clone())
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl FactorDataProvider for FailingProvider {
        async fn factor_series(&self, country: &str) -> Result<FactorSeries, ScreenerError> {
            Err(ScreenerError::FactorSource(format!(
                "{country} unsupported"
            )))
        }
    }

    fn record_with_returns(ticker: &str, returns: Vec<f64>) -> SideChannelRecord {
        let mut record = SideChannelRecord::new(ticker, format!("{ticker} INC"));
        record
            .values
            .insert(MONTHLY_RETURNS_KEY.to_string(), SideValue::Series(returns));
        record
    }

    #[test]
    fn regression_recovers_generating_coefficients() {
        let factors = synthetic_factors(36);
        let alpha = 0.002;
        let betas = [1.1, 0.4, -0.3];
        let returns = generated_returns(&factors, alpha, betas, 1e-4);

        let excess = excess_returns(&returns, &factors, 36).unwrap();
        let fit = regress(&excess, &factors).unwrap();

        assert!((fit.alpha - alpha).abs() < 1e-2);
        for (fitted, expected) in fit.betas.iter().zip(betas.iter()) {
            assert!((fitted - expected).abs() < 1e-1, "{fitted} vs {expected}");
        }
        assert_eq!(fit.residuals.len(), 36);
    }

    #[test]
    fn noiseless_fit_has_negligible_residuals() {
        let factors = synthetic_factors(36);
        let returns = generated_returns(&factors, 0.001, [1.0, 0.2, 0.1], 0.0);

        let excess = excess_returns(&returns, &factors, 36).unwrap();
        let fit = regress(&excess, &factors).unwrap();

        for r in &fit.residuals {
            assert!(r.abs() < 1e-10);
        }
    }

    #[test]
    fn short_history_yields_no_excess_returns() {
        let factors = synthetic_factors(36);
        let returns = vec![0.01; 35];
        assert!(excess_returns(&returns, &factors, 36).is_none());
    }

    #[test]
    fn zero_variance_residuals_are_undefined() {
        assert!(momentum_statistic(&[0.01; 36]).is_none());
        assert!(momentum_statistic(&[0.1, 0.2]).is_none());
    }

    #[test]
    fn momentum_skips_most_recent_period() {
        // All-but-last residuals are positive; the last one is a huge
        // negative outlier that must not affect the statistic.
        let mut residuals = vec![0.01; 36];
        residuals
            .iter_mut()
            .enumerate()
            .for_each(|(i, r)| *r += wiggle(i, 0.002));
        let with_outlier = {
            let mut r = residuals.clone();
            r[35] = -10.0;
            r
        };

        let a = momentum_statistic(&residuals).unwrap();
        let b = momentum_statistic(&with_outlier).unwrap();
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn zscores_exclude_undefined_tickers() {
        let stats = vec![
            ("A".to_string(), Some(2.0)),
            ("B".to_string(), Some(0.0)),
            ("C".to_string(), Some(-2.0)),
            ("D".to_string(), None),
        ];

        let scores = cross_sectional_zscores(&stats);
        assert_eq!(scores.len(), 3);
        assert!(!scores.contains_key("D"));
        assert!(scores["A"] > 0.0);
        assert!((scores["B"]).abs() < 1e-12);
        assert!(scores["C"] < 0.0);
    }

    #[tokio::test]
    async fn thirty_five_months_null_thirty_six_numeric() {
        let factors = synthetic_factors(40);
        let engine = FactorModelEngine::new(StaticProvider {
            series: factors.clone(),
            calls: AtomicUsize::new(0),
        });

        let full = generated_returns(&factors, 0.001, [1.0, 0.3, -0.2], 1e-3);
        let records = vec![
            record_with_returns("FULL", full[full.len() - 36..].to_vec()),
            record_with_returns("SHORT", full[full.len() - 35..].to_vec()),
        ];

        let scores = engine.score("US", &records).await.unwrap();
        assert!(scores.contains_key("FULL"));
        assert!(!scores.contains_key("SHORT"));
    }

    #[tokio::test]
    async fn factor_series_is_fetched_once_per_run() {
        let factors = synthetic_factors(36);
        let provider = StaticProvider {
            series: factors.clone(),
            calls: AtomicUsize::new(0),
        };
        let engine = FactorModelEngine::new(provider);

        let returns = generated_returns(&factors, 0.0, [1.0, 0.0, 0.0], 1e-3);
        let records: Vec<SideChannelRecord> = (0..5)
            .map(|i| record_with_returns(&format!("T{i}"), returns.clone()))
            .collect();

        engine.score("US", &records).await.unwrap();
        engine.score("US", &records).await.unwrap();

        assert_eq!(engine.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_fatal_for_the_run() {
        let engine = FactorModelEngine::new(FailingProvider);
        let records = vec![record_with_returns("AAPL", vec![0.01; 36])];

        let result = engine.score("XX", &records).await;
        assert!(matches!(result, Err(ScreenerError::FactorSource(_))));
    }

    #[tokio::test]
    async fn short_provider_history_is_a_factor_source_error() {
        let engine = FactorModelEngine::new(StaticProvider {
            series: synthetic_factors(20),
            calls: AtomicUsize::new(0),
        });

        let result = engine.score("US", &[]).await;
        assert!(matches!(result, Err(ScreenerError::FactorSource(_))));
    }
}
