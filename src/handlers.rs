use crate::app::{AppState, ChatEngine};
use crate::backend::{BackendError, is_valid_session_id};
use crate::error::{AppError, AppResult, ChatError};
use crate::messages::{ClientMessage, latest_user_text, normalize};
use crate::proxy::SessionProxy;
use crate::transcoder::{StreamEvent, Transcoder};
use crate::upstream::{CompletionClient, pump_stream};
use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const DATA_STREAM_HEADER: HeaderName = HeaderName::from_static("x-vercel-ai-data-stream");
const DATA_PROTOCOL: &str = "data";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    DATA_PROTOCOL.to_string()
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ClientMessage>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    Query(query): Query<ChatQuery>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<Response> {
    if query.protocol != DATA_PROTOCOL {
        return Err(AppError::bad_request(
            "unsupported_protocol",
            format!("unsupported protocol: {}", query.protocol),
        ));
    }
    let Json(req) =
        payload.map_err(|err| AppError::bad_request("invalid_request", err.body_text()))?;

    metrics::counter!("chatbridge_chat_requests_total", "mode" => state.chat.mode().as_str())
        .increment(1);

    match &state.chat {
        ChatEngine::Proxy(proxy) => proxy_chat(proxy, req).await,
        ChatEngine::Direct(client) => direct_chat(client, req).await,
    }
}

async fn proxy_chat(proxy: &SessionProxy, req: ChatRequest) -> AppResult<Response> {
    let text = latest_user_text(&req.messages, req.message.as_deref().unwrap_or(""))?;
    let session_id = proxy.ensure_session(req.session_id.as_deref()).await?;
    let reply = proxy.send_message(&session_id, &text).await?;
    let body: String = SessionProxy::reply_events(reply)
        .iter()
        .map(StreamEvent::encode)
        .collect();
    Ok(data_stream_response(Body::from(body)))
}

async fn direct_chat(client: &CompletionClient, req: ChatRequest) -> AppResult<Response> {
    let messages = normalize(&req.messages)?;
    let upstream_resp = client.open_stream(messages).await.map_err(|err| {
        tracing::warn!(
            status = ?err.status,
            code = ?err.code,
            error = %err.message,
            "completion request rejected"
        );
        AppError::from(ChatError::from(err))
    })?;

    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let transcoder = Transcoder::new(client.tools());
    tokio::spawn(async move {
        if let Err(err) = pump_stream(upstream_resp, transcoder, tx.clone()).await {
            tracing::warn!(code = err.code(), error = %err, "chat stream aborted");
            let line = StreamEvent::Error(err.to_string()).encode();
            let _ = tx.send(Bytes::from(line)).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>);
    Ok(data_stream_response(Body::from_stream(stream)))
}

fn data_stream_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (DATA_STREAM_HEADER, "v1"),
        ],
        body,
    )
        .into_response()
}

pub async fn create_session(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let user_info = parse_user_info(&body)?;
    let session_id = state
        .backend
        .create_session(user_info)
        .await
        .map_err(|err| {
            tracing::warn!(backend = state.backend.name(), error = %err, "session creation failed");
            AppError::from(ChatError::from(err))
        })?;
    tracing::info!(session_id = %session_id, "session created");
    Ok(Json(json!({ "session_id": session_id })).into_response())
}

fn parse_user_info(body: &[u8]) -> AppResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request("invalid_request", err.to_string()))?;
    if !value.is_object() {
        return Err(AppError::bad_request(
            "invalid_request",
            "user info must be a JSON object",
        ));
    }
    Ok(value)
}

fn session_not_found() -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "session_not_found",
        "Session not found",
    )
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Response> {
    if !is_valid_session_id(&session_id) {
        return Err(session_not_found());
    }
    let status = state
        .backend
        .session_status(&session_id)
        .await
        .map_err(|err| AppError::from(ChatError::from(err)))?;
    match status {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(session_not_found()),
    }
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> AppResult<Response> {
    let Json(feedback) =
        payload.map_err(|err| AppError::bad_request("invalid_request", err.body_text()))?;
    let session_id = feedback
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| is_valid_session_id(id))
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::bad_request("invalid_request", "feedback requires a valid session_id")
        })?;
    match state.backend.submit_feedback(&session_id, feedback).await {
        Ok(()) => {}
        Err(BackendError::SessionNotFound) => return Err(session_not_found()),
        Err(err) => {
            tracing::warn!(session_id = %session_id, error = %err, "feedback submission failed");
            return Err(ChatError::from(err).into());
        }
    }
    metrics::counter!("chatbridge_feedback_total").increment(1);
    tracing::info!(session_id = %session_id, "feedback recorded");
    Ok(Json(json!({
        "status": "success",
        "message": "Feedback submitted successfully",
    }))
    .into_response())
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "session_manager": state.backend.is_healthy(),
            "chatbot_service": state.chat.is_healthy(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_session_body_means_no_user_info() {
        assert_eq!(parse_user_info(b"").unwrap(), json!({}));
        assert_eq!(parse_user_info(b" \n").unwrap(), json!({}));
        assert_eq!(
            parse_user_info(br#"{"name":"Ada"}"#).unwrap()["name"],
            "Ada"
        );
    }

    #[test]
    fn non_object_user_info_is_rejected() {
        let err = parse_user_info(b"[1,2]").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        let err = parse_user_info(b"{oops").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
