//! CSV persistence for the screener dataset.
//!
//! Layout: `Ticker`, `Company`, then one column per metric in schema
//! order. Null cells are written empty; on load, cells that parse as f64
//! become numeric, anything else is text.

use screener_core::{Dataset, MetricValue, ScreenerError, TickerRecord};
use std::path::{Path, PathBuf};

pub struct CsvDatasetStore {
    path: PathBuf,
}

impl CsvDatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted dataset. A missing file is the valid
    /// "create new" signal, not an error.
    pub fn load(&self) -> Result<Option<Dataset>, ScreenerError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;

        let headers = reader
            .headers()
            .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?
            .clone();
        if headers.len() < 2 || &headers[0] != "Ticker" || &headers[1] != "Company" {
            return Err(ScreenerError::DatasetIo(format!(
                "{}: expected a header starting with Ticker,Company",
                self.path.display()
            )));
        }

        let columns: Vec<String> = headers.iter().skip(2).map(str::to_string).collect();

        let mut dataset = Dataset {
            columns: columns.clone(),
            rows: Vec::new(),
        };

        for record in reader.records() {
            let record = record
                .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;
            let ticker = record.get(0).unwrap_or("").to_string();
            if ticker.is_empty() {
                continue;
            }
            let company = record.get(1).unwrap_or("").to_string();

            let mut row = TickerRecord::new(ticker, company);
            for (i, column) in columns.iter().enumerate() {
                let cell = record.get(i + 2).unwrap_or("");
                if cell.is_empty() {
                    continue;
                }
                let value = match cell.parse::<f64>() {
                    Ok(n) => MetricValue::Number(n),
                    Err(_) => MetricValue::Text(cell.to_string()),
                };
                row.metrics.insert(column.clone(), value);
            }
            dataset.rows.push(row);
        }

        Ok(Some(dataset))
    }

    /// Persist the dataset, one row per ticker, a column per metric.
    pub fn save(&self, dataset: &Dataset) -> Result<(), ScreenerError> {
        let mut writer = csv::Writer::from_path(&self.path)
            .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;

        let mut header = vec!["Ticker".to_string(), "Company".to_string()];
        header.extend(dataset.columns.iter().cloned());
        writer
            .write_record(&header)
            .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;

        for row in &dataset.rows {
            let mut record = vec![row.ticker.clone(), row.company.clone()];
            for column in &dataset.columns {
                let cell = match row.metrics.get(column) {
                    Some(MetricValue::Number(n)) => format_number(*n),
                    Some(MetricValue::Text(s)) => s.clone(),
                    None => String::new(),
                };
                record.push(cell);
            }
            writer
                .write_record(&record)
                .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;
        }

        writer
            .flush()
            .map_err(|e| ScreenerError::DatasetIo(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

/// Shortest representation that round-trips through f64 parsing.
fn format_number(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{n:.1}")
    } else {
        format!("{n}")
    }
}
