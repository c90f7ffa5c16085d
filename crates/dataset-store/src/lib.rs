pub mod extract;
pub mod reconcile;
pub mod store;

pub use extract::extract_tickers_from_csv;
pub use reconcile::{create_dataset, update_dataset, ReconcileOptions};
pub use store::CsvDatasetStore;
