use crate::backend::{ChatBackend, MemoryBackend, RemoteBackend};
use crate::config::{
    BackendConfig, ChatMode, CompletionConfig, DEFAULT_LISTEN, DEFAULT_METRICS_PATH,
    DEFAULT_REQUEST_TIMEOUT_MS, env_non_empty, resolve_mode,
};
use crate::error::{AppError, AppResult};
use crate::proxy::SessionProxy;
use crate::tools::ToolRegistry;
use crate::upstream::CompletionClient;
use axum::Router;
use axum::http::{HeaderName, Method, header};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub metrics: PrometheusHandle,
    pub backend: Arc<dyn ChatBackend>,
    pub chat: ChatEngine,
}

/// The chat path chosen at startup.
#[derive(Clone)]
pub enum ChatEngine {
    Proxy(SessionProxy),
    Direct(CompletionClient),
}

impl ChatEngine {
    pub fn mode(&self) -> ChatMode {
        match self {
            ChatEngine::Proxy(_) => ChatMode::Proxy,
            ChatEngine::Direct(_) => ChatMode::Direct,
        }
    }

    pub fn is_healthy(&self) -> bool {
        match self {
            ChatEngine::Proxy(proxy) => proxy.backend().is_healthy(),
            ChatEngine::Direct(_) => true,
        }
    }
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub request_timeout_ms: u64,
    pub backend: Option<BackendConfig>,
    pub completion: Option<CompletionConfig>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("CHATBRIDGE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let metrics_path = env_non_empty("CHATBRIDGE_METRICS_PATH")
            .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string());
        let request_timeout_ms = env_non_empty("CHATBRIDGE_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let backend = env_non_empty("BACKEND_URL").map(BackendConfig::new);
        let completion = env_non_empty("OPENAI_API_KEY").map(|key| {
            let mut cfg = CompletionConfig::new(key);
            if let Some(base_url) = env_non_empty("OPENAI_BASE_URL") {
                cfg = cfg.with_base_url(base_url);
            }
            if let Some(model) = env_non_empty("OPENAI_MODEL") {
                cfg = cfg.with_model(model);
            }
            cfg
        });
        Self {
            listen,
            metrics_path,
            request_timeout_ms,
            backend,
            completion,
        }
    }

    pub fn mode(&self) -> ChatMode {
        resolve_mode(self.backend.as_ref(), self.completion.as_ref())
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("chatbridge/0.1")
        .connect_timeout(std::time::Duration::from_millis(runtime.request_timeout_ms))
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;
    let tools = Arc::new(ToolRegistry::builtin());

    let backend: Arc<dyn ChatBackend> = match &runtime.backend {
        Some(cfg) => Arc::new(RemoteBackend::new(
            http.clone(),
            cfg.clone(),
            runtime.request_timeout_ms,
        )),
        None => Arc::new(MemoryBackend::new()),
    };

    let chat = match (runtime.mode(), &runtime.completion) {
        (ChatMode::Direct, Some(cfg)) => ChatEngine::Direct(CompletionClient::new(
            http.clone(),
            cfg.clone(),
            runtime.request_timeout_ms,
            tools,
        )),
        _ => ChatEngine::Proxy(SessionProxy::new(backend.clone())),
    };

    tracing::info!(
        mode = chat.mode().as_str(),
        backend = backend.name(),
        "chat engine ready"
    );

    Ok(AppState {
        runtime: Arc::new(runtime),
        metrics,
        backend,
        chat,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(&metrics_path, get(crate::handlers::metrics))
        .nest("/api", build_api_router())
        .with_state(state)
        .layer(cors_layer())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}

fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(crate::handlers::chat))
        .route("/sessions", post(crate::handlers::create_session))
        .route("/sessions/{session_id}", get(crate::handlers::get_session))
        .route("/feedback", post(crate::handlers::submit_feedback))
        .route("/health", get(crate::handlers::health))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}
