use thiserror::Error;

pub type Result<T> = std::result::Result<T, WebDriverError>;

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("WebDriver error (status {status}, {error}): {message}")]
    Protocol {
        status: u16,
        error: String,
        message: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl WebDriverError {
    /// W3C error code for a selector that matched nothing.
    pub fn is_no_such_element(&self) -> bool {
        matches!(self, WebDriverError::Protocol { error, .. } if error == "no such element")
    }

    /// Element went away between lookup and use (page re-rendered).
    pub fn is_stale_element(&self) -> bool {
        matches!(self, WebDriverError::Protocol { error, .. } if error == "stale element reference")
    }
}

impl From<reqwest::Error> for WebDriverError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WebDriverError::Timeout(err.to_string())
        } else {
            WebDriverError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for WebDriverError {
    fn from(err: serde_json::Error) -> Self {
        WebDriverError::Parse(err.to_string())
    }
}
