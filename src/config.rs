use serde::Serialize;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;
pub const DEFAULT_SESSION_IDLE_TTL_SECS: i64 = 24 * 60 * 60;
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Direct completion mode settings, present when `OPENAI_API_KEY` is set.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl CompletionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_OPENAI_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Remote session/chat backend, present when `BACKEND_URL` is set.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Forward the latest message to a session backend.
    Proxy,
    /// Stream straight from the completion API.
    Direct,
}

impl ChatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatMode::Proxy => "proxy",
            ChatMode::Direct => "direct",
        }
    }
}

/// A configured backend always wins; without one, an API key selects direct
/// mode, and with neither the in-memory backend answers in proxy mode.
pub fn resolve_mode(
    backend: Option<&BackendConfig>,
    completion: Option<&CompletionConfig>,
) -> ChatMode {
    match (backend, completion) {
        (None, Some(_)) => ChatMode::Direct,
        _ => ChatMode::Proxy,
    }
}

pub(crate) fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
