use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use cepgeo_common::{Outcome, Record};

use crate::infra::rate_limit::RateLimiter;
use crate::traits::{AddressResolver, CoordinateSource};

/// Geocoder call timeout.
pub const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Free-text address geocoding behind a rate limiter.
pub struct GeocoderSource {
    resolver: Arc<dyn AddressResolver>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl GeocoderSource {
    pub fn new(resolver: Arc<dyn AddressResolver>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            resolver,
            limiter,
            timeout: GEOCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Address strings to try, most specific first:
/// "street, neighborhood, city, state, cep" then "street city cep".
/// Empty parts are dropped and a repeat of the previous variant is skipped.
pub fn address_variants(cep: &str, record: &Record) -> Vec<String> {
    let full = [
        record.street(),
        record.neighborhood(),
        record.city(),
        record.region(),
        cep,
    ];
    let short = [record.street(), record.city(), cep];

    let join = |parts: &[&str], sep: &str| {
        parts
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(sep)
    };

    let mut variants = vec![join(&full, ", ")];
    let second = join(&short, " ");
    if variants.last() != Some(&second) && !second.is_empty() {
        variants.push(second);
    }
    variants.retain(|v| !v.is_empty());
    variants
}

#[async_trait]
impl CoordinateSource for GeocoderSource {
    fn name(&self) -> &str {
        "geocoder"
    }

    async fn resolve(&self, cep: &str, record: &Record) -> Outcome {
        info!(cep, source = "geocoder", "Looking up coordinates");

        let mut last_error: Option<String> = None;
        for address in address_variants(cep, record) {
            self.limiter.acquire().await;
            match self.resolver.geocode(&address, self.timeout).await {
                Ok(Some(coords)) if coords.is_complete() => {
                    debug!(cep, address = address.as_str(), "Geocoder hit");
                    return Outcome::Found(coords);
                }
                Ok(_) => {
                    debug!(cep, address = address.as_str(), "Geocoder miss");
                }
                Err(e) => {
                    warn!(cep, address = address.as_str(), error = %e, "Geocoder call failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(reason) => Outcome::Transient(reason),
            None => Outcome::NotFound,
        }
    }
}
