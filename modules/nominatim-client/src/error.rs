use thiserror::Error;

pub type Result<T> = std::result::Result<T, NominatimError>;

#[derive(Debug, Error)]
pub enum NominatimError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl NominatimError {
    /// Nominatim answers 429 (or 509 on older deployments) when the usage policy is exceeded.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, NominatimError::Api { status: 429 | 509, .. })
    }
}

impl From<reqwest::Error> for NominatimError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NominatimError::Timeout(err.to_string())
        } else {
            NominatimError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for NominatimError {
    fn from(err: serde_json::Error) -> Self {
        NominatimError::Parse(err.to_string())
    }
}
