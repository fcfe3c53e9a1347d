use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use cepgeo_common::{Coordinates, Outcome, Record};

use crate::traits::CoordinateSource;

pub const KEYED_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Postal-code lookup API authenticated by a token query parameter.
pub struct KeyedLookupSource {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(default)]
    lat: Option<Value>,
    #[serde(default)]
    lng: Option<Value>,
}

impl KeyedLookupSource {
    pub fn new(endpoint: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.trim().is_empty()),
            timeout: KEYED_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn lookup(&self, cep: &str, token: &str) -> Outcome {
        let url = format!("{}/{}", self.endpoint, cep);
        let resp = match self
            .http
            .get(&url)
            .query(&[("token", token)])
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Outcome::Transient("keyed lookup timed out".into()),
            Err(e) => return Outcome::Transient(format!("keyed lookup request failed: {e}")),
        };

        let status = resp.status();
        if !status.is_success() {
            return Outcome::Transient(format!("keyed lookup returned HTTP {}", status.as_u16()));
        }

        match resp.text().await {
            Ok(body) => match parse_lookup_body(&body) {
                Some(coords) => Outcome::Found(coords),
                None => Outcome::NotFound,
            },
            Err(e) => Outcome::Transient(format!("keyed lookup body unreadable: {e}")),
        }
    }
}

/// Pull `lat`/`lng` out of a lookup response. Either may be a string or a
/// number; both must be non-empty. Anything else, including a body that is
/// not JSON, yields `None`.
pub fn parse_lookup_body(body: &str) -> Option<Coordinates> {
    let parsed: LookupBody = serde_json::from_str(body).ok()?;
    let text = |v: Option<Value>| match v? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    let coords = Coordinates::new(text(parsed.lat)?, text(parsed.lng)?);
    coords.is_complete().then_some(coords)
}

#[async_trait]
impl CoordinateSource for KeyedLookupSource {
    fn name(&self) -> &str {
        "keyed_lookup"
    }

    async fn resolve(&self, cep: &str, _record: &Record) -> Outcome {
        let Some(token) = self.token.as_deref() else {
            debug!(cep, "No keyed lookup token configured, skipping");
            return Outcome::NotFound;
        };

        info!(cep, source = "keyed_lookup", "Looking up coordinates");
        let outcome = self.lookup(cep, token).await;
        if let Outcome::Transient(reason) = &outcome {
            warn!(cep, reason = reason.as_str(), "Keyed lookup failed");
        }
        outcome
    }
}
