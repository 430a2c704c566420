use crate::config::CompletionConfig;
use crate::error::ChatError;
use crate::tools::ToolRegistry;
use crate::transcoder::{ChatCompletionChunk, Transcoder};
use axum::http::StatusCode;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A completion request that failed before any stream line was produced.
/// `status` is `None` when no response arrived.
#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(status: Option<StatusCode>, message: String) -> Self {
        Self {
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl From<UpstreamCallError> for ChatError {
    fn from(err: UpstreamCallError) -> Self {
        ChatError::UpstreamStream(err.message)
    }
}

/// Streaming chat-completions client for direct mode.
#[derive(Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    config: CompletionConfig,
    timeout_ms: u64,
    tools: Arc<ToolRegistry>,
}

impl CompletionClient {
    pub fn new(
        http: reqwest::Client,
        config: CompletionConfig,
        timeout_ms: u64,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            http,
            config,
            timeout_ms,
            tools,
        }
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.clone()
    }

    pub fn request_body(&self, messages: Vec<Value>) -> Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !self.tools.is_empty() {
            body["tools"] = Value::Array(self.tools.completion_tools());
        }
        body
    }

    /// Opens the completion stream; fails before any byte reaches the client
    /// when the provider rejects the request.
    ///
    /// The timeout bounds the wait for response headers only, so a long
    /// answer keeps streaming past it.
    pub async fn open_stream(
        &self,
        messages: Vec<Value>,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let body = self.request_body(messages);
        let url = join_url(&self.config.base_url, "/chat/completions");
        let send = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send();
        let resp = tokio::time::timeout(Duration::from_millis(self.timeout_ms), send)
            .await
            .map_err(|_| {
                UpstreamCallError::new(
                    None,
                    format!("no response from upstream within {} ms", self.timeout_ms),
                )
            })?
            .map_err(|err| UpstreamCallError::new(None, err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let code = extract_error_code(&text);
            return Err(UpstreamCallError::new(
                Some(status),
                format!("upstream status {}: {}", status, text),
            )
            .with_code(code));
        }
        Ok(resp)
    }
}

/// Reads the SSE body, feeds each chunk through `transcoder` and forwards
/// encoded lines as they are produced. A client that hangs up ends the pump
/// quietly.
pub async fn pump_stream(
    upstream_resp: reqwest::Response,
    mut transcoder: Transcoder,
    tx: mpsc::Sender<Bytes>,
) -> Result<(), ChatError> {
    let mut stream = upstream_resp.bytes_stream().eventsource();
    while let Some(ev) = stream.next().await {
        let ev = ev.map_err(|err| ChatError::UpstreamStream(err.to_string()))?;
        if ev.data.trim() == "[DONE]" {
            break;
        }
        let chunk: ChatCompletionChunk = serde_json::from_str(&ev.data)
            .map_err(|err| ChatError::UpstreamStream(format!("malformed chunk: {err}")))?;
        for event in transcoder.push_chunk(&chunk)? {
            if tx.send(Bytes::from(event.encode())).await.is_err() {
                tracing::debug!("client disconnected mid-stream");
                return Ok(());
            }
        }
    }
    if let Some(event) = transcoder.finish_without_usage() {
        tracing::debug!("upstream ended without usage, finishing with zero counts");
        let _ = tx.send(Bytes::from(event.encode())).await;
    }
    Ok(())
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}
