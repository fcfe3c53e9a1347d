use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::error::CepGeoError;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub cep_dir: PathBuf,
    pub ledger_dir: PathBuf,
    pub data_dir: PathBuf,

    // Browser
    pub webdriver_url: String,

    // Geocoder
    pub nominatim_url: String,
    pub nominatim_user_agent: String,
    pub geocode_min_interval: Duration,

    // Keyed lookup
    pub keyed_lookup_url: String,
    pub keyed_lookup_token: Option<String>,

    // Scraped sites
    pub scraper_a_url: String,
    pub scraper_b_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cep_dir: PathBuf::from("cep"),
            ledger_dir: PathBuf::from("."),
            data_dir: PathBuf::from("data"),
            webdriver_url: "http://localhost:9515".to_string(),
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            nominatim_user_agent: "cep_worker_seq".to_string(),
            geocode_min_interval: Duration::from_millis(1100),
            keyed_lookup_url: "https://cep.awesomeapi.com.br/json".to_string(),
            keyed_lookup_token: None,
            scraper_a_url: "https://site.buscarcep.com.br/".to_string(),
            scraper_b_url: "https://www.ruacep.com.br/pesquisa/".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    /// A missing keyed-lookup token is not an error: it disables that source.
    pub fn from_env() -> Result<Self, CepGeoError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` but reads through `get`, so tests need not touch
    /// the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, CepGeoError> {
        let defaults = Self::default();
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let geocode_min_interval = match non_empty("GEOCODE_MIN_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(raw.parse::<u64>().map_err(|_| {
                CepGeoError::Config(format!("GEOCODE_MIN_INTERVAL_MS must be a number, got {raw:?}"))
            })?),
            None => defaults.geocode_min_interval,
        };

        let config = Self {
            cep_dir: non_empty("CEP_DIR").map(PathBuf::from).unwrap_or(defaults.cep_dir),
            ledger_dir: non_empty("LEDGER_DIR").map(PathBuf::from).unwrap_or(defaults.ledger_dir),
            data_dir: non_empty("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            webdriver_url: non_empty("WEBDRIVER_URL").unwrap_or(defaults.webdriver_url),
            nominatim_url: non_empty("NOMINATIM_URL").unwrap_or(defaults.nominatim_url),
            nominatim_user_agent: non_empty("NOMINATIM_USER_AGENT")
                .unwrap_or(defaults.nominatim_user_agent),
            geocode_min_interval,
            keyed_lookup_url: non_empty("KEYED_LOOKUP_URL").unwrap_or(defaults.keyed_lookup_url),
            keyed_lookup_token: non_empty("KEYED_LOOKUP_TOKEN"),
            scraper_a_url: non_empty("SCRAPER_A_URL").unwrap_or(defaults.scraper_a_url),
            scraper_b_url: non_empty("SCRAPER_B_URL").unwrap_or(defaults.scraper_b_url),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CepGeoError> {
        for (key, value) in [
            ("WEBDRIVER_URL", &self.webdriver_url),
            ("NOMINATIM_URL", &self.nominatim_url),
            ("KEYED_LOOKUP_URL", &self.keyed_lookup_url),
            ("SCRAPER_A_URL", &self.scraper_a_url),
            ("SCRAPER_B_URL", &self.scraper_b_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| CepGeoError::Config(format!("{key} is not a valid URL ({value}): {e}")))?;
        }
        Ok(())
    }

    /// Log the effective configuration without leaking the credential.
    pub fn log_redacted(&self) {
        info!(
            cep_dir = %self.cep_dir.display(),
            ledger_dir = %self.ledger_dir.display(),
            data_dir = %self.data_dir.display(),
            webdriver_url = self.webdriver_url.as_str(),
            nominatim_url = self.nominatim_url.as_str(),
            geocode_min_interval_ms = self.geocode_min_interval.as_millis() as u64,
            keyed_lookup_url = self.keyed_lookup_url.as_str(),
            keyed_lookup_token = if self.keyed_lookup_token.is_some() { "<set>" } else { "<unset>" },
            "Configuration loaded"
        );
    }
}
