//! Per-ticker fetch orchestration and the ordered concurrent batch runner.

use fundamental_metrics::{derive_conservative, DerivationInput, SCALAR_DERIVATIONS};
use screener_core::{CompanyFetch, MetricSource, MetricValue, SideChannelRecord};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs every registered derivation for one ticker with per-derivation
/// fault isolation. `process` never fails: a failed derivation simply
/// contributes no keys.
pub struct FetchOrchestrator<S: MetricSource> {
    source: Arc<S>,
}

impl<S: MetricSource> Clone for FetchOrchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<S: MetricSource> FetchOrchestrator<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self { source }
    }

    /// Fetch the two shared payloads once, then evaluate each derivation
    /// inside its own failure boundary. A shared-payload failure is not
    /// isolated per se, but every derivation is still attempted and fails
    /// cleanly on the missing input, so the result is an empty record
    /// rather than an early abort.
    pub async fn process(&self, company: &str, ticker: &str) -> CompanyFetch {
        let (fundamentals_result, prices_result) = tokio::join!(
            self.source.fetch_fundamentals(ticker),
            self.source.fetch_price_series(ticker),
        );

        if let Err(e) = &fundamentals_result {
            tracing::warn!(ticker, "fundamental snapshot fetch failed: {e}");
        }
        if let Err(e) = &prices_result {
            tracing::warn!(ticker, "price series fetch failed: {e}");
        }

        let input = DerivationInput {
            ticker,
            fundamentals: fundamentals_result.as_ref().ok(),
            prices: prices_result.as_ref().ok().map(Vec::as_slice),
        };

        let mut combined: BTreeMap<String, MetricValue> = BTreeMap::new();
        for (name, derive) in SCALAR_DERIVATIONS {
            match derive(&input) {
                Ok(outputs) => merge_outputs(&mut combined, name, outputs),
                Err(e) => {
                    tracing::warn!(ticker, derivation = name, "derivation failed: {e}");
                }
            }
        }

        let mut side = SideChannelRecord::new(ticker, company);
        match derive_conservative(&input) {
            Ok(values) => {
                side.values.extend(values);
            }
            Err(e) => {
                tracing::warn!(ticker, derivation = "conservative", "derivation failed: {e}");
            }
        }

        CompanyFetch {
            company: company.to_string(),
            ticker: ticker.to_string(),
            combined,
            side,
        }
    }
}

/// First write wins. Derivation key namespaces are designed disjoint, so a
/// collision is a bug in the registry, not a runtime conflict to resolve.
fn merge_outputs(
    combined: &mut BTreeMap<String, MetricValue>,
    derivation: &str,
    outputs: Vec<(String, MetricValue)>,
) {
    for (key, value) in outputs {
        match combined.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(slot) => {
                debug_assert!(false, "duplicate metric key {} from {derivation}", slot.key());
                tracing::error!(
                    derivation,
                    key = %slot.key(),
                    "duplicate metric key across derivations; keeping the first value"
                );
            }
        }
    }
}

/// Apply the orchestrator across `entities` with a bounded worker pool.
///
/// The output is positionally aligned with the input regardless of task
/// completion order; callers may zip inputs to outputs by index. A task
/// that panics still yields a degenerate row (ticker + company, empty
/// metrics) and never aborts its siblings.
pub async fn run_batch<S>(
    orchestrator: &FetchOrchestrator<S>,
    entities: &[(String, String)],
    concurrency: usize,
) -> Vec<CompanyFetch>
where
    S: MetricSource + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let handles: Vec<_> = entities
        .iter()
        .cloned()
        .map(|(company, ticker)| {
            let orchestrator = orchestrator.clone();
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                orchestrator.process(&company, &ticker).await
            })
        })
        .collect();

    // Awaiting the handles in spawn order is what pins output order to
    // input order; completion order is irrelevant.
    let mut results = Vec::with_capacity(entities.len());
    for (handle, (company, ticker)) in handles.into_iter().zip(entities) {
        match handle.await {
            Ok(fetch) => results.push(fetch),
            Err(e) => {
                tracing::error!(ticker = %ticker, "ticker pipeline panicked: {e}");
                results.push(CompanyFetch::degenerate(company.clone(), ticker.clone()));
            }
        }
    }
    results
}
