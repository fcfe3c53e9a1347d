use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Key W3C WebDriver uses to carry a web element reference.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

/// WebDriver key code for Enter.
pub const ENTER_KEY: &str = "\u{E007}";

/// Launch options for a Chrome session.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub user_agent: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: None,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserOptions {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Chrome command-line switches for this session.
    pub fn chrome_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.headless {
            args.push("--headless".to_string());
        }
        args.extend(
            [
                "--no-sandbox",
                "--disable-dev-shm-usage",
                "--disable-gpu",
                "--disable-software-rasterizer",
                "--disable-logging",
                "--disable-extensions",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        if let Some(ref ua) = self.user_agent {
            args.push(format!("--user-agent={ua}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// New-session request body.
    pub fn capabilities(&self) -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": self.chrome_args() }
                }
            }
        })
    }
}

/// Opaque reference to an element inside one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementRef(pub String);

/// Every WebDriver response wraps its payload in `value`.
#[derive(Debug, Deserialize)]
pub(crate) struct WireResponse<T> {
    pub value: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    pub error: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewSession {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FindElement<'a> {
    pub using: &'static str,
    pub value: &'a str,
}
