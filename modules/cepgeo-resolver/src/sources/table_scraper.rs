use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

use cepgeo_common::{Coordinates, Outcome, Record};

use crate::infra::util::{poll_until, PollPolicy};
use crate::traits::{CoordinateSource, PageFetcher, SUBMIT_KEY};

pub const RESULT_SELECTOR: &str = "div.gsc-webResult a.gs-title";
pub const SEARCH_INPUT_SELECTOR: &str = "input.gsc-input";

static TABLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.table-striped").expect("valid selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static HEADER: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th").expect("valid selector"));
static CELL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("td").expect("valid selector"));

/// Read latitude/longitude out of the first `table.table-striped`.
///
/// Rows are `<th>label</th><td>value</td>`. Labels match by case-insensitive
/// substring; the value is the first line of the trimmed cell text.
pub fn extract_table_coordinates(html: &str) -> Option<Coordinates> {
    let doc = Html::parse_document(html);
    let table = doc.select(&TABLE).next()?;

    let mut lat: Option<String> = None;
    let mut lon: Option<String> = None;
    for row in table.select(&ROW) {
        let (Some(th), Some(td)) = (row.select(&HEADER).next(), row.select(&CELL).next()) else {
            continue;
        };
        let label = th.text().collect::<String>().trim().to_lowercase();
        let value = td.text().collect::<String>();
        let value = value.trim().lines().next().unwrap_or("").trim().to_string();

        if label.contains("latitude") {
            lat = Some(value);
        } else if label.contains("longitude") {
            lon = Some(value);
        }
    }

    let coords = Coordinates::new(lat?, lon?);
    coords.is_complete().then_some(coords)
}

/// Scraper for the search-driven site: click the first search hit, then read
/// the detail page's striped table.
pub struct TableScraperSource {
    page: Arc<dyn PageFetcher>,
    search_url: String,
    settle: Duration,
    click_attempts: u32,
    click_timeout: Duration,
    table_poll: PollPolicy,
}

impl TableScraperSource {
    pub const SETTLE: Duration = Duration::from_millis(700);
    pub const CLICK_ATTEMPTS: u32 = 3;
    pub const CLICK_TIMEOUT: Duration = Duration::from_secs(2);
    pub const TABLE_POLL: PollPolicy = PollPolicy::fixed(15, Duration::from_millis(300));

    pub fn new(page: Arc<dyn PageFetcher>, search_url: &str) -> Self {
        Self {
            page,
            search_url: search_url.to_string(),
            settle: Self::SETTLE,
            click_attempts: Self::CLICK_ATTEMPTS,
            click_timeout: Self::CLICK_TIMEOUT,
            table_poll: Self::TABLE_POLL,
        }
    }

    pub fn with_timing(mut self, settle: Duration, click_timeout: Duration, table_poll: PollPolicy) -> Self {
        self.settle = settle;
        self.click_timeout = click_timeout;
        self.table_poll = table_poll;
        self
    }

    pub fn with_click_attempts(mut self, attempts: u32) -> Self {
        self.click_attempts = attempts.max(1);
        self
    }

    pub fn url_for(&self, cep: &str) -> String {
        format!("{}?q={}", self.search_url, cep)
    }

    /// Click the first search hit. `Ok(false)` when no hit showed up within
    /// the attempt budget; `Err` carries the last DOM error seen, if any.
    async fn open_first_result(&self, cep: &str) -> Result<bool, String> {
        let mut last_error: Option<String> = None;

        for attempt in 0..self.click_attempts {
            match self.page.find_clickable(RESULT_SELECTOR, self.click_timeout).await {
                Ok(Some(hit)) => {
                    return match self.page.click(&hit).await {
                        Ok(()) => Ok(true),
                        Err(e) => Err(format!("click failed: {e}")),
                    };
                }
                Ok(None) => debug!(cep, attempt, "No clickable search result yet"),
                Err(e) => {
                    debug!(cep, attempt, error = %e, "Search result lookup failed");
                    last_error = Some(e.to_string());
                }
            }

            if attempt + 1 < self.click_attempts {
                if let Err(e) = self.resubmit(cep).await {
                    debug!(cep, attempt, error = %e, "Could not resubmit search");
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Type the identifier back into the search box and press Enter.
    async fn resubmit(&self, cep: &str) -> anyhow::Result<()> {
        if let Some(input) = self.page.find_input(SEARCH_INPUT_SELECTOR).await? {
            self.page.type_text(&input, &format!("{cep}{SUBMIT_KEY}")).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinateSource for TableScraperSource {
    fn name(&self) -> &str {
        "scraper_b"
    }

    async fn resolve(&self, cep: &str, _record: &Record) -> Outcome {
        info!(cep, source = "scraper_b", "Looking up coordinates");

        if let Err(e) = self.page.navigate(&self.url_for(cep)).await {
            warn!(cep, error = %e, "Navigation failed");
            return Outcome::Transient(format!("navigation failed: {e}"));
        }
        tokio::time::sleep(self.settle).await;

        match self.open_first_result(cep).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(cep, "No search result to open");
                return Outcome::NotFound;
            }
            Err(e) => {
                warn!(cep, error = e.as_str(), "Search result page unusable");
                return Outcome::Transient(e);
            }
        }
        tokio::time::sleep(self.settle).await;

        let page = &self.page;
        let terminal = poll_until(self.table_poll, |_| async move {
            match page.rendered_html().await {
                Ok(html) => extract_table_coordinates(&html).map(Outcome::Found),
                Err(e) => Some(Outcome::Transient(format!("page read failed: {e}"))),
            }
        })
        .await;

        terminal.unwrap_or_else(|| {
            debug!(cep, "Detail table never showed coordinates");
            Outcome::NotFound
        })
    }
}
