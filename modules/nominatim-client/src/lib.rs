pub mod error;
pub mod types;

pub use error::{NominatimError, Result};
pub use types::{Location, Place};

use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";

/// Nominatim search client. Callers are responsible for honoring the
/// public instance's one-request-per-second policy.
pub struct NominatimClient {
    client: reqwest::Client,
    base_url: String,
    user_agent: String,
}

impl NominatimClient {
    pub fn new(base_url: &str, user_agent: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user_agent: user_agent.to_string(),
        }
    }

    /// Geocode a free-form address. Returns the best match, or `None` when
    /// the query has no results.
    pub async fn geocode(&self, query: &str, timeout: Duration) -> Result<Option<Location>> {
        let url = format!("{}/search", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NominatimError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        let places: Vec<Place> = serde_json::from_str(&body)?;
        tracing::debug!(query, hits = places.len(), "Nominatim search complete");
        Ok(places.into_iter().next().map(Location::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one request with a canned response. The handle yields the raw
    /// request head.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}/"), handle)
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn geocode_returns_first_hit() {
        let (base, request) = serve_once(
            "200 OK",
            r#"[{"lat":"-23.5503","lon":"-46.6339","display_name":"Praça da Sé"}]"#,
        )
        .await;
        let client = NominatimClient::new(&base, "cep_worker_0");

        let location = client.geocode("Praça da Sé São Paulo", TIMEOUT).await.unwrap();

        assert_eq!(
            location,
            Some(Location {
                latitude: "-23.5503".into(),
                longitude: "-46.6339".into(),
                address: Some("Praça da Sé".into()),
            })
        );
        let head = request.await.unwrap();
        assert!(head.starts_with("GET /search?"), "{head}");
        assert!(head.contains("format=json"), "{head}");
        assert!(head.contains("limit=1"), "{head}");
        assert!(head.to_lowercase().contains("user-agent: cep_worker_0"), "{head}");
    }

    #[tokio::test]
    async fn geocode_empty_result_is_none() {
        let (base, _request) = serve_once("200 OK", "[]").await;
        let client = NominatimClient::new(&base, "ua");
        assert_eq!(client.geocode("nowhere", TIMEOUT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn geocode_rate_limited_is_quota_error() {
        let (base, _request) = serve_once("429 Too Many Requests", r#"{"error":"slow down"}"#).await;
        let client = NominatimClient::new(&base, "ua");

        let err = client.geocode("Rua A", TIMEOUT).await.unwrap_err();

        assert!(matches!(err, NominatimError::Api { status: 429, .. }), "{err}");
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn geocode_garbage_body_is_parse_error() {
        let (base, _request) = serve_once("200 OK", "<html>maintenance</html>").await;
        let client = NominatimClient::new(&base, "ua");
        let err = client.geocode("Rua A", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, NominatimError::Parse(_)), "{err}");
    }

    #[test]
    fn base_url_is_trimmed() {
        let c = NominatimClient::new("https://nominatim.example/", "ua");
        assert_eq!(c.base_url, "https://nominatim.example");
    }

    #[test]
    fn quota_statuses_are_recognized() {
        let e = NominatimError::Api { status: 429, message: String::new() };
        assert!(e.is_quota_exceeded());
        let e = NominatimError::Api { status: 500, message: String::new() };
        assert!(!e.is_quota_exceeded());
    }
}
