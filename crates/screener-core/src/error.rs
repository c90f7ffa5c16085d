use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScreenerError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Factor source error: {0}")]
    FactorSource(String),

    #[error("Dataset I/O error: {0}")]
    DatasetIo(String),
}
