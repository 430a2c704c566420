//! Session/chat backends the proxy mode talks to.
//!
//! `RemoteBackend` speaks HTTP to the secure backend; `MemoryBackend` keeps
//! sessions in process and is used when no backend URL is configured.

use crate::config::{BackendConfig, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_IDLE_TTL_SECS};
use crate::upstream::join_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

pub const SESSION_PHASE: &str = "welcome_data_collection";
pub const FALLBACK_REPLY: &str =
    "I'm experiencing some technical difficulties. Please try again.";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("session not found")]
    SessionNotFound,
    #[error("backend request failed: {0}")]
    Network(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("backend response malformed: {0}")]
    Malformed(String),
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_session(&self, user_info: Value) -> Result<String, BackendError>;

    /// Returns the backend's complete reply for `message`.
    async fn send_message(&self, session_id: &str, message: &str) -> Result<String, BackendError>;

    /// `Ok(None)` when the backend does not know the session.
    async fn session_status(&self, session_id: &str) -> Result<Option<Value>, BackendError>;

    /// Records user feedback for an existing session. `feedback` is the
    /// frontend's object, `session_id` included.
    async fn submit_feedback(&self, session_id: &str, feedback: Value) -> Result<(), BackendError>;

    fn is_healthy(&self) -> bool;
}

/// Ids this service mints or forwards: ASCII alphanumerics, `_` and `-`.
pub fn is_valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn new_session_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("sess_{}", &hex[..12])
}

pub struct RemoteBackend {
    http: reqwest::Client,
    config: BackendConfig,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct CreateSessionReply {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    response: String,
}

impl RemoteBackend {
    pub fn new(http: reqwest::Client, config: BackendConfig, timeout_ms: u64) -> Self {
        Self {
            http,
            config,
            timeout_ms,
        }
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    /// `{base}/sessions/{id}` with the id pushed as a single encoded segment.
    fn session_url(&self, session_id: &str) -> Result<Url, BackendError> {
        let mut url = Url::parse(&self.url("/sessions"))
            .map_err(|err| BackendError::InvalidUrl(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.config.base_url.clone()))?
            .pop_if_empty()
            .push(session_id);
        Ok(url)
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

async fn error_for_status(resp: reqwest::Response) -> BackendError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    BackendError::Status { status, body }
}

#[async_trait]
impl ChatBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create_session(&self, user_info: Value) -> Result<String, BackendError> {
        let resp = self
            .http
            .post(self.url("/sessions"))
            .timeout(self.timeout())
            .json(&user_info)
            .send()
            .await
            .map_err(|err| BackendError::Network(err.to_string()))?;
        if resp.status() != StatusCode::OK {
            return Err(error_for_status(resp).await);
        }
        let reply: CreateSessionReply = resp
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        tracing::debug!(session_id = %reply.session_id, "backend session created");
        Ok(reply.session_id)
    }

    async fn send_message(&self, session_id: &str, message: &str) -> Result<String, BackendError> {
        let resp = self
            .http
            .post(self.url("/chat"))
            .timeout(self.timeout())
            .json(&json!({ "session_id": session_id, "message": message }))
            .send()
            .await
            .map_err(|err| BackendError::Network(err.to_string()))?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(BackendError::SessionNotFound),
            _ => return Err(error_for_status(resp).await),
        }
        let reply: ChatReply = resp
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        Ok(reply.response)
    }

    async fn session_status(&self, session_id: &str) -> Result<Option<Value>, BackendError> {
        let resp = self
            .http
            .get(self.session_url(session_id)?)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|err| BackendError::Network(err.to_string()))?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(error_for_status(resp).await),
        }
        let value: Value = resp
            .json()
            .await
            .map_err(|err| BackendError::Malformed(err.to_string()))?;
        Ok(Some(value))
    }

    async fn submit_feedback(&self, session_id: &str, feedback: Value) -> Result<(), BackendError> {
        let resp = self
            .http
            .post(self.url("/feedback"))
            .timeout(self.timeout())
            .json(&feedback)
            .send()
            .await
            .map_err(|err| BackendError::Network(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(BackendError::SessionNotFound),
            _ => return Err(error_for_status(resp).await),
        }
        tracing::debug!(session_id, "feedback forwarded to backend");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    user_info: Value,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    message_count: u64,
    feedback: Vec<Value>,
    seq: u64,
}

/// In-process stand-in for the secure backend. Every reply is
/// [`FALLBACK_REPLY`].
///
/// Sessions idle for longer than `idle_ttl` are dropped when a new one is
/// created; past `max_sessions` the least recently active is evicted.
pub struct MemoryBackend {
    sessions: DashMap<String, SessionRecord>,
    next_seq: AtomicU64,
    max_sessions: usize,
    idle_ttl: chrono::Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::with_limits(
            DEFAULT_MAX_SESSIONS,
            chrono::Duration::seconds(DEFAULT_SESSION_IDLE_TTL_SECS),
        )
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_sessions: usize, idle_ttl: chrono::Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            max_sessions: max_sessions.max(1),
            idle_ttl,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn evict(&self, now: DateTime<Utc>) {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| now.signed_duration_since(record.last_activity) < self.idle_ttl);
        while self.sessions.len() >= self.max_sessions {
            let oldest = self
                .sessions
                .iter()
                .min_by_key(|entry| (entry.value().last_activity, entry.value().seq))
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.sessions.remove(&key);
                }
                None => break,
            }
        }
        let evicted = before.saturating_sub(self.sessions.len());
        if evicted > 0 {
            tracing::debug!(evicted, "evicted in-memory sessions");
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_session(&self, user_info: Value) -> Result<String, BackendError> {
        let session_id = new_session_id();
        let now = Utc::now();
        self.evict(now);
        self.sessions.insert(
            session_id.clone(),
            SessionRecord {
                user_info,
                created_at: now,
                last_activity: now,
                message_count: 0,
                feedback: Vec::new(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(session_id)
    }

    async fn send_message(&self, session_id: &str, _message: &str) -> Result<String, BackendError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or(BackendError::SessionNotFound)?;
        record.message_count += 1;
        record.last_activity = Utc::now();
        Ok(FALLBACK_REPLY.to_string())
    }

    async fn session_status(&self, session_id: &str) -> Result<Option<Value>, BackendError> {
        Ok(self.sessions.get(session_id).map(|record| {
            json!({
                "session_id": session_id,
                "phase": SESSION_PHASE,
                "completion_rate": 0.0,
                "user_info": record.user_info,
                "created_at": record.created_at.to_rfc3339(),
                "last_activity": record.last_activity.to_rfc3339(),
                "message_count": record.message_count,
                "feedback_count": record.feedback.len(),
            })
        }))
    }

    async fn submit_feedback(&self, session_id: &str, feedback: Value) -> Result<(), BackendError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or(BackendError::SessionNotFound)?;
        record.feedback.push(feedback);
        record.last_activity = Utc::now();
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
