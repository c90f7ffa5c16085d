use crate::types::PricePoint;
use chrono::Datelike;

/// Resample a daily price series (ascending by date) to month-end
/// observations: the last trading day of each calendar month.
pub fn month_end_closes(prices: &[PricePoint]) -> Vec<PricePoint> {
    let mut out: Vec<PricePoint> = Vec::new();
    for p in prices {
        if let Some(last) = out.last_mut() {
            if last.date.year() == p.date.year() && last.date.month() == p.date.month() {
                *last = *p;
                continue;
            }
        }
        out.push(*p);
    }
    out
}

/// Simple period-over-period returns of a close series.
pub fn simple_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect()
}

/// Trailing monthly returns from a daily price series, capped at `window`
/// periods. Returns fewer than `window` entries when history is short;
/// callers that need the full window must check the length.
pub fn trailing_monthly_returns(prices: &[PricePoint], window: usize) -> Vec<f64> {
    let closes: Vec<f64> = month_end_closes(prices)
        .iter()
        .map(|p| p.adjusted_close)
        .collect();
    let mut returns = simple_returns(&closes);
    if returns.len() > window {
        returns.drain(..returns.len() - window);
    }
    returns
}
