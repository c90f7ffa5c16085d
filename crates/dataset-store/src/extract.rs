//! Ticker-list extraction from a two-column portfolio file.

use screener_core::{normalize_company, normalize_ticker, ScreenerError};
use std::path::Path;

/// Read a two-column CSV (company name, raw ticker) with a header row and
/// return parallel lists of normalized company names and tickers. Rows
/// whose ticker cell is blank after normalization are skipped.
pub fn extract_tickers_from_csv(
    path: impl AsRef<Path>,
) -> Result<(Vec<String>, Vec<String>), ScreenerError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", path.display())))?;

    let mut companies = Vec::new();
    let mut tickers = Vec::new();

    // Reader consumes the header row itself
    for record in reader.records() {
        let record =
            record.map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", path.display())))?;

        let ticker = normalize_ticker(record.get(1).unwrap_or(""));
        if ticker.is_empty() {
            continue;
        }
        companies.push(normalize_company(record.get(0).unwrap_or("")));
        tickers.push(ticker);
    }

    Ok((companies, tickers))
}
