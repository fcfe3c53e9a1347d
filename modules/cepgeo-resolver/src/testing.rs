// Test doubles for the resolution pipeline.
//
// Compiled for unit tests and for downstream integration tests through the
// `test-support` feature. Every mock records what it was asked so tests can
// assert on call order and arguments.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use cepgeo_common::{Coordinates, Outcome, Record};

use crate::batch::{ChainFactory, WorkerChain};
use crate::infra::rate_limit::RateLimiter;
use crate::resolver::FallbackResolver;
use crate::traits::{AddressResolver, CoordinateSource, ElementHandle, PageFetcher};

// ---------------------------------------------------------------------------
// ScriptedSource
// ---------------------------------------------------------------------------

/// Shared record of the identifiers a source was asked about.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, cep: &str) {
        self.0.lock().unwrap().push(cep.to_string());
    }

    pub fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn ceps(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Source that answers from a script: a per-identifier outcome, falling back
/// to a default.
pub struct ScriptedSource {
    name: String,
    default: Outcome,
    by_cep: HashMap<String, Outcome>,
    calls: CallLog,
}

impl ScriptedSource {
    pub fn new(name: &str, default: Outcome) -> Self {
        Self {
            name: name.to_string(),
            default,
            by_cep: HashMap::new(),
            calls: CallLog::default(),
        }
    }

    pub fn on(mut self, cep: &str, outcome: Outcome) -> Self {
        self.by_cep.insert(cep.to_string(), outcome);
        self
    }

    /// Share an existing call log, e.g. one log across several workers.
    pub fn with_calls(mut self, calls: CallLog) -> Self {
        self.calls = calls;
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl CoordinateSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, cep: &str, _record: &Record) -> Outcome {
        self.calls.push(cep);
        self.by_cep.get(cep).cloned().unwrap_or_else(|| self.default.clone())
    }
}

// ---------------------------------------------------------------------------
// MockAddressResolver
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockAddressResolver {
    hits: HashMap<String, Coordinates>,
    failures: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl MockAddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, address: &str, coords: Coordinates) -> Self {
        self.hits.insert(address.to_string(), coords);
        self
    }

    pub fn failing_on(mut self, address: &str, error: &str) -> Self {
        self.failures.insert(address.to_string(), error.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AddressResolver for MockAddressResolver {
    async fn geocode(&self, address: &str, _timeout: Duration) -> Result<Option<Coordinates>> {
        self.calls.lock().unwrap().push(address.to_string());
        if let Some(error) = self.failures.get(address) {
            return Err(anyhow!("{error}"));
        }
        Ok(self.hits.get(address).cloned())
    }
}

// ---------------------------------------------------------------------------
// MockPageFetcher
// ---------------------------------------------------------------------------

/// Scripted browser. `rendered_html` walks through the configured pages and
/// keeps returning the last one.
#[derive(Default)]
pub struct MockPageFetcher {
    pages: Vec<String>,
    html_reads: AtomicU32,
    /// selector -> number of lookups that miss before the element appears
    clickable: HashMap<String, u32>,
    clickable_lookups: Mutex<HashMap<String, u32>>,
    inputs: HashSet<String>,
    navigation_error: Option<String>,
    find_error: Option<String>,
    closed: AtomicBool,
    navigations: Mutex<Vec<String>>,
    clicks: Mutex<Vec<ElementHandle>>,
    typed: Mutex<Vec<String>>,
}

impl MockPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pages<'a>(mut self, pages: impl IntoIterator<Item = &'a str>) -> Self {
        self.pages = pages.into_iter().map(str::to_string).collect();
        self
    }

    /// `selector` becomes clickable after `misses` unsuccessful lookups.
    pub fn with_clickable(mut self, selector: &str, misses: u32) -> Self {
        self.clickable.insert(selector.to_string(), misses);
        self
    }

    pub fn with_input(mut self, selector: &str) -> Self {
        self.inputs.insert(selector.to_string());
        self
    }

    pub fn failing_navigation(mut self, error: &str) -> Self {
        self.navigation_error = Some(error.to_string());
        self
    }

    /// Element lookups fail with `error`.
    pub fn failing_finds(mut self, error: &str) -> Self {
        self.find_error = Some(error.to_string());
        self
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn html_reads(&self) -> u32 {
        self.html_reads.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> Vec<ElementHandle> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.typed.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("invalid session id: session closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PageFetcher for MockPageFetcher {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(error) = &self.navigation_error {
            return Err(anyhow!("{error}"));
        }
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn rendered_html(&self) -> Result<String> {
        self.ensure_open()?;
        let read = self.html_reads.fetch_add(1, Ordering::SeqCst) as usize;
        let page = self
            .pages
            .get(read)
            .or_else(|| self.pages.last())
            .cloned()
            .unwrap_or_else(|| "<html></html>".to_string());
        Ok(page)
    }

    async fn stop_loading(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn find_clickable(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<Option<ElementHandle>> {
        self.ensure_open()?;
        if let Some(error) = &self.find_error {
            return Err(anyhow!("{error}"));
        }
        let Some(misses) = self.clickable.get(selector) else {
            return Ok(None);
        };
        let mut lookups = self.clickable_lookups.lock().unwrap();
        let seen = lookups.entry(selector.to_string()).or_insert(0);
        *seen += 1;
        if *seen > *misses {
            Ok(Some(ElementHandle(format!("clickable:{selector}"))))
        } else {
            Ok(None)
        }
    }

    async fn click(&self, element: &ElementHandle) -> Result<()> {
        self.ensure_open()?;
        self.clicks.lock().unwrap().push(element.clone());
        Ok(())
    }

    async fn find_input(&self, selector: &str) -> Result<Option<ElementHandle>> {
        self.ensure_open()?;
        if let Some(error) = &self.find_error {
            return Err(anyhow!("{error}"));
        }
        Ok(self
            .inputs
            .contains(selector)
            .then(|| ElementHandle(format!("input:{selector}"))))
    }

    async fn type_text(&self, _element: &ElementHandle, text: &str) -> Result<()> {
        self.ensure_open()?;
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FnChainFactory
// ---------------------------------------------------------------------------

type BuildFn = dyn Fn(usize, Arc<RateLimiter>) -> Result<Vec<Box<dyn CoordinateSource>>> + Send + Sync;

/// Chain factory driven by a closure. Each worker can optionally get a mock
/// page so tests can check sessions are closed.
pub struct FnChainFactory {
    build: Box<BuildFn>,
    with_pages: bool,
    pages: Mutex<Vec<(usize, Arc<MockPageFetcher>)>>,
    limiters: Mutex<Vec<(usize, Arc<RateLimiter>)>>,
}

impl FnChainFactory {
    pub fn new<F>(build: F) -> Self
    where
        F: Fn(usize, Arc<RateLimiter>) -> Result<Vec<Box<dyn CoordinateSource>>> + Send + Sync + 'static,
    {
        Self {
            build: Box::new(build),
            with_pages: false,
            pages: Mutex::new(Vec::new()),
            limiters: Mutex::new(Vec::new()),
        }
    }

    pub fn with_pages(mut self) -> Self {
        self.with_pages = true;
        self
    }

    /// Pages handed out so far, by worker index.
    pub fn pages(&self) -> Vec<(usize, Arc<MockPageFetcher>)> {
        self.pages.lock().unwrap().clone()
    }

    /// Limiters handed out so far, by worker index.
    pub fn limiters(&self) -> Vec<(usize, Arc<RateLimiter>)> {
        self.limiters.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainFactory for FnChainFactory {
    async fn build(&self, worker: usize, limiter: Arc<RateLimiter>) -> Result<WorkerChain> {
        self.limiters.lock().unwrap().push((worker, limiter.clone()));
        let sources = (self.build)(worker, limiter)?;

        let page: Option<Arc<dyn PageFetcher>> = if self.with_pages {
            let mock = Arc::new(MockPageFetcher::new());
            self.pages.lock().unwrap().push((worker, mock.clone()));
            let page: Arc<dyn PageFetcher> = mock;
            Some(page)
        } else {
            None
        };

        Ok(WorkerChain {
            resolver: FallbackResolver::new(sources),
            page,
        })
    }
}
