pub mod geocoder;
pub mod keyed;
pub mod table_scraper;
pub mod text_scraper;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use cepgeo_common::Config;
use nominatim_client::NominatimClient;
use webdriver_client::{BrowserOptions, WebDriverClient};

use crate::batch::{ChainFactory, WorkerChain};
use crate::infra::rate_limit::RateLimiter;
use crate::infra::util::worker_user_agent;
use crate::resolver::FallbackResolver;
use crate::traits::{CoordinateSource, PageFetcher};

pub use geocoder::GeocoderSource;
pub use keyed::KeyedLookupSource;
pub use table_scraper::TableScraperSource;
pub use text_scraper::TextScraperSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum SourceKind {
    #[value(name = "geocoder")]
    Geocoder,
    #[value(name = "keyed")]
    KeyedLookup,
    #[value(name = "scraper-a")]
    TextScraper,
    #[value(name = "scraper-b")]
    TableScraper,
}

impl SourceKind {
    pub const DEFAULT_ORDER: [SourceKind; 4] = [
        SourceKind::Geocoder,
        SourceKind::KeyedLookup,
        SourceKind::TextScraper,
        SourceKind::TableScraper,
    ];

    pub fn needs_browser(self) -> bool {
        matches!(self, SourceKind::TextScraper | SourceKind::TableScraper)
    }
}

/// Instantiate `order` into a resolver. Browser-backed sources are left out
/// when there is no page fetcher.
pub fn build_chain(
    order: &[SourceKind],
    config: &Config,
    limiter: Arc<RateLimiter>,
    page: Option<Arc<dyn PageFetcher>>,
    nominatim_user_agent: &str,
) -> FallbackResolver {
    let mut sources: Vec<Box<dyn CoordinateSource>> = Vec::with_capacity(order.len());

    for kind in order {
        match (kind, &page) {
            (SourceKind::Geocoder, _) => {
                let client = NominatimClient::new(&config.nominatim_url, nominatim_user_agent);
                sources.push(Box::new(GeocoderSource::new(Arc::new(client), limiter.clone())));
            }
            (SourceKind::KeyedLookup, _) => {
                sources.push(Box::new(KeyedLookupSource::new(
                    &config.keyed_lookup_url,
                    config.keyed_lookup_token.clone(),
                )));
            }
            (SourceKind::TextScraper, Some(page)) => {
                sources.push(Box::new(TextScraperSource::new(page.clone(), &config.scraper_a_url)));
            }
            (SourceKind::TableScraper, Some(page)) => {
                sources.push(Box::new(TableScraperSource::new(page.clone(), &config.scraper_b_url)));
            }
            (kind, None) => {
                warn!(source = ?kind, "No browser session, leaving source out");
            }
        }
    }

    FallbackResolver::new(sources)
}

/// Wires real clients: Nominatim, the keyed API, and one WebDriver session
/// per worker when a scraper is enabled.
pub struct LiveChainFactory {
    config: Config,
    order: Vec<SourceKind>,
    browser: bool,
    /// Give each worker its own geocoder identity (parallel runs).
    distinct_identities: bool,
}

impl LiveChainFactory {
    pub fn new(config: Config, order: Vec<SourceKind>, browser: bool, distinct_identities: bool) -> Self {
        Self {
            config,
            order,
            browser,
            distinct_identities,
        }
    }

    fn wants_browser(&self) -> bool {
        self.browser && self.order.iter().any(|k| k.needs_browser())
    }
}

#[async_trait]
impl ChainFactory for LiveChainFactory {
    async fn build(&self, worker: usize, limiter: Arc<RateLimiter>) -> Result<WorkerChain> {
        let page: Option<Arc<dyn PageFetcher>> = if self.wants_browser() {
            let user_agent = worker_user_agent(worker);
            let options = BrowserOptions::default().with_user_agent(user_agent);
            let session = WebDriverClient::new(&self.config.webdriver_url)
                .new_session(&options)
                .await
                .with_context(|| {
                    format!("Failed to open browser session at {}", self.config.webdriver_url)
                })?;
            info!(worker, session = session.id(), "Browser session opened");
            let session: Arc<dyn PageFetcher> = Arc::new(session);
            Some(session)
        } else {
            None
        };

        let nominatim_user_agent = if self.distinct_identities {
            format!("{}_{}", self.config.nominatim_user_agent, worker)
        } else {
            self.config.nominatim_user_agent.clone()
        };

        let order: Vec<SourceKind> = if self.browser {
            self.order.clone()
        } else {
            self.order.iter().copied().filter(|k| !k.needs_browser()).collect()
        };

        let resolver = build_chain(&order, &self.config, limiter, page.clone(), &nominatim_user_agent);
        Ok(WorkerChain { resolver, page })
    }
}
