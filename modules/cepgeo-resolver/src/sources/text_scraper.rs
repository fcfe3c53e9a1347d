use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use cepgeo_common::{Coordinates, Outcome, Record};

use crate::infra::util::{poll_until, PollPolicy};
use crate::traits::{CoordinateSource, PageFetcher};

const NOT_FOUND_MARKER: &str = "Cep não encontrado!";

static LATITUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LATITUDE:</strong>\s*([\-\d\.]+)").expect("valid regex"));
static LONGITUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LONGITUDE:</strong>\s*([\-\d\.]+)").expect("valid regex"));

/// What one look at the rendered page told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageScan {
    NotFound,
    Coordinates(Coordinates),
    /// Neither the marker nor both coordinates yet.
    Pending,
}

pub fn scan_page(html: &str) -> PageScan {
    if html.contains(NOT_FOUND_MARKER) {
        return PageScan::NotFound;
    }
    let lat = LATITUDE_RE.captures(html).and_then(|c| c.get(1));
    let lon = LONGITUDE_RE.captures(html).and_then(|c| c.get(1));
    match (lat, lon) {
        (Some(lat), Some(lon)) => PageScan::Coordinates(Coordinates::new(lat.as_str(), lon.as_str())),
        _ => PageScan::Pending,
    }
}

/// Scraper for the address page that prints `LATITUDE:` / `LONGITUDE:`
/// labels as plain text once its scripts finish.
pub struct TextScraperSource {
    page: Arc<dyn PageFetcher>,
    base_url: String,
    settle: Duration,
    poll: PollPolicy,
}

impl TextScraperSource {
    pub const SETTLE: Duration = Duration::from_millis(700);
    pub const POLL: PollPolicy = PollPolicy::fixed(15, Duration::from_millis(300));

    pub fn new(page: Arc<dyn PageFetcher>, base_url: &str) -> Self {
        Self {
            page,
            base_url: base_url.to_string(),
            settle: Self::SETTLE,
            poll: Self::POLL,
        }
    }

    pub fn with_timing(mut self, settle: Duration, poll: PollPolicy) -> Self {
        self.settle = settle;
        self.poll = poll;
        self
    }

    pub fn url_for(&self, cep: &str) -> String {
        format!("{}?secao=endereco&cep={}", self.base_url, cep)
    }
}

#[async_trait]
impl CoordinateSource for TextScraperSource {
    fn name(&self) -> &str {
        "scraper_a"
    }

    async fn resolve(&self, cep: &str, _record: &Record) -> Outcome {
        info!(cep, source = "scraper_a", "Looking up coordinates");

        let url = self.url_for(cep);
        if let Err(e) = self.page.navigate(&url).await {
            warn!(cep, error = %e, "Navigation failed");
            return Outcome::Transient(format!("navigation failed: {e}"));
        }
        tokio::time::sleep(self.settle).await;

        // Trackers keep the page "loading" long after the data is in.
        if let Err(e) = self.page.stop_loading().await {
            debug!(cep, error = %e, "stop_loading failed, polling anyway");
        }

        let page = &self.page;
        let terminal = poll_until(self.poll, |_| async move {
            match page.rendered_html().await {
                Ok(html) => match scan_page(&html) {
                    PageScan::NotFound => Some(Outcome::NotFound),
                    PageScan::Coordinates(c) => Some(Outcome::Found(c)),
                    PageScan::Pending => None,
                },
                Err(e) => Some(Outcome::Transient(format!("page read failed: {e}"))),
            }
        })
        .await;

        match terminal {
            Some(outcome) => {
                debug!(cep, outcome = outcome.label(), "Scraper A finished");
                outcome
            }
            None => {
                debug!(cep, "Scraper A gave up waiting for coordinates");
                Outcome::NotFound
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPageFetcher;

    const FOUND_HTML: &str = r#"<div><p><strong>LATITUDE:</strong> -23.5505199</p>
        <p><strong>LONGITUDE:</strong> -46.6333094</p></div>"#;

    fn source(page: Arc<MockPageFetcher>) -> TextScraperSource {
        TextScraperSource::new(page, "https://site.example/")
            .with_timing(Duration::ZERO, PollPolicy::fixed(15, Duration::ZERO))
    }

    #[test]
    fn scan_finds_coordinates() {
        assert_eq!(
            scan_page(FOUND_HTML),
            PageScan::Coordinates(Coordinates::new("-23.5505199", "-46.6333094"))
        );
    }

    #[test]
    fn scan_prefers_not_found_marker() {
        let html = format!("<p>Cep não encontrado!</p>{FOUND_HTML}");
        assert_eq!(scan_page(&html), PageScan::NotFound);
    }

    #[test]
    fn scan_needs_both_halves() {
        assert_eq!(scan_page("<strong>LATITUDE:</strong> -23.5"), PageScan::Pending);
        assert_eq!(scan_page("<html></html>"), PageScan::Pending);
    }

    #[test]
    fn url_carries_identifier() {
        let page = Arc::new(MockPageFetcher::new());
        assert_eq!(
            source(page).url_for("01001000"),
            "https://site.example/?secao=endereco&cep=01001000"
        );
    }

    #[tokio::test]
    async fn coordinates_appearing_on_a_later_poll_are_found() {
        let page = Arc::new(MockPageFetcher::new().with_pages(["<html>loading</html>", "<html>still</html>", FOUND_HTML]));
        let out = source(page.clone()).resolve("01001000", &Record::default()).await;

        assert_eq!(out, Outcome::Found(Coordinates::new("-23.5505199", "-46.6333094")));
        assert_eq!(page.navigations(), vec!["https://site.example/?secao=endereco&cep=01001000"]);
        assert_eq!(page.html_reads(), 3);
    }

    #[tokio::test]
    async fn marker_is_not_found_immediately() {
        let page = Arc::new(MockPageFetcher::new().with_pages(["<b>Cep não encontrado!</b>"]));
        let out = source(page.clone()).resolve("99999999", &Record::default()).await;
        assert_eq!(out, Outcome::NotFound);
        assert_eq!(page.html_reads(), 1);
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_is_not_found() {
        let page = Arc::new(MockPageFetcher::new().with_pages(["<html></html>"]));
        let out = source(page.clone()).resolve("01001000", &Record::default()).await;
        assert_eq!(out, Outcome::NotFound);
        assert_eq!(page.html_reads(), 15);
    }

    #[tokio::test]
    async fn navigation_error_is_transient() {
        let page = Arc::new(MockPageFetcher::new().failing_navigation("net::ERR_NAME_NOT_RESOLVED"));
        let out = source(page).resolve("01001000", &Record::default()).await;
        assert!(matches!(out, Outcome::Transient(ref r) if r.contains("ERR_NAME_NOT_RESOLVED")));
    }

    #[tokio::test]
    async fn closed_session_is_transient() {
        let page = Arc::new(MockPageFetcher::new().with_pages([FOUND_HTML]));
        page.close().await.unwrap();
        let out = source(page).resolve("01001000", &Record::default()).await;
        assert!(matches!(out, Outcome::Transient(_)));
    }
}
