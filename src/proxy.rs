use crate::backend::{BackendError, ChatBackend};
use crate::error::ChatError;
use crate::transcoder::{ChunkUsage, FinishReason, StreamEvent};
use serde_json::json;
use std::sync::Arc;

/// Forwards one user message per request to a session backend.
#[derive(Clone)]
pub struct SessionProxy {
    backend: Arc<dyn ChatBackend>,
}

impl SessionProxy {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Returns `session_id` unchanged when given, otherwise mints one.
    pub async fn ensure_session(&self, session_id: Option<&str>) -> Result<String, ChatError> {
        if let Some(id) = session_id.filter(|id| !id.trim().is_empty()) {
            return Ok(id.to_string());
        }
        let id = self
            .backend
            .create_session(json!({}))
            .await
            .map_err(|err| {
                tracing::warn!(backend = self.backend.name(), error = %err, "session creation failed");
                ChatError::from(err)
            })?;
        Ok(id)
    }

    /// Sends `text` and returns the complete reply. A missing session is
    /// replaced once and the message resent; nothing else is retried.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<String, ChatError> {
        match self.backend.send_message(session_id, text).await {
            Ok(reply) => Ok(reply),
            Err(BackendError::SessionNotFound) => {
                tracing::info!(session_id, "backend lost the session, recreating once");
                metrics::counter!("chatbridge_session_retries_total").increment(1);
                let fresh = self.ensure_session(None).await?;
                self.backend
                    .send_message(&fresh, text)
                    .await
                    .map_err(|err| {
                        tracing::warn!(session_id = %fresh, error = %err, "retry after session recreation failed");
                        ChatError::from(err)
                    })
            }
            Err(err) => {
                tracing::warn!(session_id, error = %err, "backend chat call failed");
                Err(err.into())
            }
        }
    }

    /// The backend reports no usage, so the finish event carries zeros.
    pub fn reply_events(reply: String) -> [StreamEvent; 2] {
        [
            StreamEvent::TextDelta(Some(reply)),
            StreamEvent::Finish {
                reason: FinishReason::Stop,
                usage: ChunkUsage::default(),
            },
        ]
    }
}
