// Trait abstractions for the resolution pipeline's external collaborators.
//
// PageFetcher: one browser session (navigate, read DOM, click, type).
// AddressResolver: free-text address geocoding.
// CoordinateSource: one lookup strategy in the fallback chain.
//
// Production code wires in webdriver_client::Session and NominatimClient;
// tests use the mocks in `testing`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use cepgeo_common::{Coordinates, Outcome, Record};

/// Key sequence that submits a focused input (W3C Enter).
pub const SUBMIT_KEY: &str = webdriver_client::ENTER_KEY;

/// Opaque handle to an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(pub String);

// ---------------------------------------------------------------------------
// PageFetcher
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    /// DOM as currently rendered, including script-inserted content.
    async fn rendered_html(&self) -> Result<String>;

    /// Stop loading ancillary resources on the current page.
    async fn stop_loading(&self) -> Result<()>;

    /// Wait up to `timeout` for a visible, enabled element.
    async fn find_clickable(&self, selector: &str, timeout: Duration)
        -> Result<Option<ElementHandle>>;

    async fn click(&self, element: &ElementHandle) -> Result<()>;

    async fn find_input(&self, selector: &str) -> Result<Option<ElementHandle>>;

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()>;

    /// End the session. Further calls fail.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl PageFetcher for webdriver_client::Session {
    async fn navigate(&self, url: &str) -> Result<()> {
        Ok(self.navigate(url).await?)
    }

    async fn rendered_html(&self) -> Result<String> {
        Ok(self.source().await?)
    }

    async fn stop_loading(&self) -> Result<()> {
        Ok(self.stop_loading().await?)
    }

    async fn find_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<ElementHandle>> {
        let found = self.wait_for_clickable(selector, timeout).await?;
        Ok(found.map(|e| ElementHandle(e.0)))
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        Ok(self.click(&webdriver_client::ElementRef(element.0.clone())).await?)
    }

    async fn find_input(&self, selector: &str) -> Result<Option<ElementHandle>> {
        let found = self.find_element(selector).await?;
        Ok(found.map(|e| ElementHandle(e.0)))
    }

    async fn type_text(&self, element: &ElementHandle, text: &str) -> Result<()> {
        let el = webdriver_client::ElementRef(element.0.clone());
        self.clear(&el).await?;
        Ok(self.send_keys(&el, text).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(self.delete().await?)
    }
}

// ---------------------------------------------------------------------------
// AddressResolver
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// `Ok(None)` means the address produced no hit. Errors are timeouts,
    /// quota rejections and transport failures.
    async fn geocode(&self, address: &str, timeout: Duration) -> Result<Option<Coordinates>>;
}

#[async_trait]
impl AddressResolver for nominatim_client::NominatimClient {
    async fn geocode(&self, address: &str, timeout: Duration) -> Result<Option<Coordinates>> {
        match self.geocode(address, timeout).await {
            Ok(hit) => Ok(hit.map(|loc| Coordinates::new(loc.latitude, loc.longitude))),
            Err(e) if e.is_quota_exceeded() => Err(anyhow::anyhow!("quota exceeded: {e}")),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinateSource
// ---------------------------------------------------------------------------

/// One lookup strategy. Implementations never return errors: every failure
/// of the underlying capability is reported as an `Outcome`.
#[async_trait]
pub trait CoordinateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, cep: &str, record: &Record) -> Outcome;
}
