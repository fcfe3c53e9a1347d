pub mod error;
pub mod types;

pub use error::{Result, WebDriverError};
pub use types::{BrowserOptions, ElementRef, ENTER_KEY};

use std::collections::HashMap;
use std::time::Duration;

use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use types::{FindElement, NewSession, WireError, WireResponse, ELEMENT_KEY};

/// Interval between element lookups while waiting for a clickable element.
const CLICKABLE_POLL: Duration = Duration::from_millis(100);

/// Page loads longer than this fail the navigate call.
const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Entry point: one client per WebDriver server, many sessions per client.
pub struct WebDriverClient {
    client: reqwest::Client,
    base_url: String,
}

impl WebDriverClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Launch a new browser session with the given options.
    pub async fn new_session(&self, options: &BrowserOptions) -> Result<Session> {
        let endpoint = format!("{}/session", self.base_url);
        let created: NewSession = send(
            self.client
                .post(&endpoint)
                .json(&options.capabilities()),
        )
        .await?;

        info!(session_id = created.session_id.as_str(), "WebDriver session started");

        let session = Session {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            id: created.session_id,
        };
        session.set_page_load_timeout(PAGE_LOAD_TIMEOUT).await?;
        Ok(session)
    }
}

/// A live browser session. Not shared between workers.
pub struct Session {
    client: reqwest::Client,
    base_url: String,
    id: String,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.base_url, self.id, path)
    }

    async fn set_page_load_timeout(&self, timeout: Duration) -> Result<()> {
        let _: Value = send(
            self.client
                .post(self.url("/timeouts"))
                .json(&json!({ "pageLoad": timeout.as_millis() as u64 })),
        )
        .await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        debug!(session_id = self.id.as_str(), url, "Navigating");
        let _: Value = send(self.client.post(self.url("/url")).json(&json!({ "url": url }))).await?;
        Ok(())
    }

    /// Current DOM serialized as HTML.
    pub async fn source(&self) -> Result<String> {
        send(self.client.get(self.url("/source"))).await
    }

    pub async fn execute(&self, script: &str) -> Result<Value> {
        send(
            self.client
                .post(self.url("/execute/sync"))
                .json(&json!({ "script": script, "args": [] })),
        )
        .await
    }

    /// Halt any in-flight resource loading.
    pub async fn stop_loading(&self) -> Result<()> {
        self.execute("window.stop();").await?;
        Ok(())
    }

    /// First element matching a CSS selector, or `None` when nothing matches.
    pub async fn find_element(&self, selector: &str) -> Result<Option<ElementRef>> {
        let result: Result<HashMap<String, String>> = send(
            self.client.post(self.url("/element")).json(&FindElement {
                using: "css selector",
                value: selector,
            }),
        )
        .await;

        match result {
            Ok(map) => map
                .get(ELEMENT_KEY)
                .map(|id| Some(ElementRef(id.clone())))
                .ok_or_else(|| WebDriverError::Parse("element reference missing".to_string())),
            Err(e) if e.is_no_such_element() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn element_flag(&self, element: &ElementRef, flag: &str) -> Result<bool> {
        send(
            self.client
                .get(self.url(&format!("/element/{}/{flag}", element.0))),
        )
        .await
    }

    /// Wait until an element matching `selector` is displayed and enabled.
    /// Returns `None` if the timeout elapses first.
    pub async fn wait_for_clickable(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Option<ElementRef>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.find_element(selector).await {
                Ok(Some(element)) => {
                    let displayed = self.element_flag(&element, "displayed").await;
                    let enabled = self.element_flag(&element, "enabled").await;
                    match (displayed, enabled) {
                        (Ok(true), Ok(true)) => return Ok(Some(element)),
                        (Err(e), _) | (_, Err(e)) if !e.is_stale_element() => return Err(e),
                        _ => {}
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_stale_element() => {}
                Err(e) => return Err(e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CLICKABLE_POLL).await;
        }
    }

    pub async fn click(&self, element: &ElementRef) -> Result<()> {
        let _: Value = send(
            self.client
                .post(self.url(&format!("/element/{}/click", element.0)))
                .json(&json!({})),
        )
        .await?;
        Ok(())
    }

    pub async fn send_keys(&self, element: &ElementRef, text: &str) -> Result<()> {
        let _: Value = send(
            self.client
                .post(self.url(&format!("/element/{}/value", element.0)))
                .json(&json!({ "text": text })),
        )
        .await?;
        Ok(())
    }

    pub async fn clear(&self, element: &ElementRef) -> Result<()> {
        let _: Value = send(
            self.client
                .post(self.url(&format!("/element/{}/clear", element.0)))
                .json(&json!({})),
        )
        .await?;
        Ok(())
    }

    /// End the session and close the browser.
    pub async fn delete(&self) -> Result<()> {
        let endpoint = format!("{}/session/{}", self.base_url, self.id);
        match send::<Value>(self.client.delete(&endpoint)).await {
            Ok(_) => {
                info!(session_id = self.id.as_str(), "WebDriver session closed");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = self.id.as_str(), error = %e, "Failed to close WebDriver session");
                Err(e)
            }
        }
    }
}

/// Send a request and unwrap the W3C `{"value": ...}` envelope.
async fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let resp = request.send().await?;
    let status = resp.status();
    let body = resp.text().await?;

    if !status.is_success() {
        return Err(protocol_error(status.as_u16(), &body));
    }

    let wire: WireResponse<T> = serde_json::from_str(&body)?;
    Ok(wire.value)
}

fn protocol_error(status: u16, body: &str) -> WebDriverError {
    match serde_json::from_str::<WireResponse<WireError>>(body) {
        Ok(wire) => WebDriverError::Protocol {
            status,
            error: wire.value.error,
            message: wire.value.message,
        },
        Err(_) => WebDriverError::Protocol {
            status,
            error: "unknown error".to_string(),
            message: body.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Requests = Arc<Mutex<Vec<String>>>;

    /// Read one request (head plus any content-length body) and return its
    /// request line.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_string();
            let body_len = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + body_len {
                break;
            }
        }
        String::from_utf8_lossy(&buf).lines().next().unwrap_or("").to_string()
    }

    /// Fake WebDriver server. `route` maps a request line to (status, body).
    async fn serve<F>(route: F) -> (String, Requests)
    where
        F: Fn(&str) -> (u16, String) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Requests::default();
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let line = read_request(&mut socket).await;
                let (status, body) = route(&line);
                seen.lock().unwrap().push(line);
                let response = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), requests)
    }

    fn session(base_url: &str) -> Session {
        Session {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            id: "s1".to_string(),
        }
    }

    fn no_such_element() -> (u16, String) {
        (
            404,
            r#"{"value":{"error":"no such element","message":"Unable to locate element"}}"#.to_string(),
        )
    }

    fn element(id: &str) -> (u16, String) {
        (200, format!(r#"{{"value":{{"{ELEMENT_KEY}":"{id}"}}}}"#))
    }

    #[tokio::test]
    async fn find_element_unwraps_value_envelope() {
        let (base, requests) = serve(|_| element("abc")).await;

        let found = session(&base).find_element("a.gs-title").await.unwrap();

        assert_eq!(found, Some(ElementRef("abc".to_string())));
        assert_eq!(
            requests.lock().unwrap().as_slice(),
            ["POST /session/s1/element HTTP/1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn find_element_without_match_is_none() {
        let (base, _requests) = serve(|_| no_such_element()).await;
        let found = session(&base).find_element("table.table-striped").await.unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn other_protocol_errors_propagate() {
        let (base, _requests) = serve(|_| {
            (
                500,
                r#"{"value":{"error":"unknown error","message":"chrome not reachable"}}"#.to_string(),
            )
        })
        .await;

        let err = session(&base).find_element("a").await.unwrap_err();

        match err {
            WebDriverError::Protocol { status, error, message } => {
                assert_eq!(status, 500);
                assert_eq!(error, "unknown error");
                assert_eq!(message, "chrome not reachable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn source_returns_page_html() {
        let (base, requests) =
            serve(|_| (200, r#"{"value":"<html><b>LATITUDE:</b></html>"}"#.to_string())).await;

        let html = session(&base).source().await.unwrap();

        assert_eq!(html, "<html><b>LATITUDE:</b></html>");
        assert_eq!(
            requests.lock().unwrap().as_slice(),
            ["GET /session/s1/source HTTP/1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn wait_for_clickable_gives_up_at_deadline() {
        let (base, requests) = serve(|_| no_such_element()).await;

        let started = std::time::Instant::now();
        let found = session(&base)
            .wait_for_clickable("a.gs-title", Duration::from_millis(250))
            .await
            .unwrap();

        assert_eq!(found, None);
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(requests.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn wait_for_clickable_returns_displayed_enabled_element() {
        let (base, _requests) = serve(|line| {
            if line.contains("/displayed ") || line.contains("/enabled ") {
                (200, r#"{"value":true}"#.to_string())
            } else {
                element("hit")
            }
        })
        .await;

        let found = session(&base)
            .wait_for_clickable("a.gs-title", Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(found, Some(ElementRef("hit".to_string())));
    }

    #[test]
    fn protocol_error_reads_w3c_body() {
        let body = r#"{"value":{"error":"no such element","message":"Unable to locate","stacktrace":""}}"#;
        let err = protocol_error(404, body);
        assert!(err.is_no_such_element());
    }

    #[test]
    fn protocol_error_keeps_raw_body_when_not_json() {
        let err = protocol_error(502, "Bad Gateway");
        match err {
            WebDriverError::Protocol { status, error, message } => {
                assert_eq!(status, 502);
                assert_eq!(error, "unknown error");
                assert_eq!(message, "Bad Gateway");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn stale_element_is_recognized() {
        let body = r#"{"value":{"error":"stale element reference","message":"gone"}}"#;
        let err = protocol_error(404, body);
        assert!(err.is_stale_element());
        assert!(!err.is_no_such_element());
    }
}
