use thiserror::Error;

#[derive(Error, Debug)]
pub enum CepGeoError {
    #[error("Record store error: {0}")]
    Store(String),

    #[error("Malformed record {identifier}: {reason}")]
    MalformedRecord { identifier: String, reason: String },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
