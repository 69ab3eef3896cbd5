//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{GenerationOverrides, HearthConfig};
use crate::engine::{EngineResource, EngineState, EngineStatus, SessionScheduler};
use crate::error::{EngineError, SchedulerError};
use crate::prompt::ChatTemplate;
use crate::stream::{ConnectionRegistry, Dispatcher};
use crate::system::SystemSnapshot;

/// Shared application state
pub struct AppState {
    pub engine: Arc<EngineResource>,
    pub scheduler: Arc<SessionScheduler>,
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<HearthConfig>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(scheduler: Arc<SessionScheduler>, config: HearthConfig) -> Self {
        let registry = ConnectionRegistry::new(
            Arc::clone(&scheduler),
            config.server.token_delay(),
            config.server.outbox_capacity,
        );
        let dispatcher = Dispatcher::new(
            registry,
            config.generation.clone(),
            config.model.max_context_length,
            config.model.chat_template,
        );
        Self {
            engine: Arc::clone(scheduler.engine()),
            scheduler,
            dispatcher: Arc::new(dispatcher),
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }
}

/// Health check endpoint
///
/// 503 until a pipeline is bound; non-inference endpoints keep working regardless.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let status = state.engine.status();
    let snapshot = SystemSnapshot::capture(&state.config.model.models_dir).await;

    let body = HealthResponse {
        status: if status.model_loaded() {
            "healthy"
        } else {
            "unhealthy"
        },
        initialized: status.state != EngineState::Uninitialized,
        model_loaded: status.model_loaded(),
        state: status.state,
        device: status.device.map(|d| d.to_string()),
        degraded: status.state == EngineState::Degraded,
        simulation: status.simulation,
        memory_usage: snapshot.memory.as_ref().map(|m| m.used_percent()),
        process_memory_bytes: snapshot.process_rss_bytes,
    };

    let code = if status.model_loaded() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body)).into_response()
}

/// Application status endpoint
pub async fn api_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.engine.status();
    let config = &state.config;
    Json(StatusResponse {
        application: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        ready: engine.model_loaded(),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        active_clients: state.registry().len(),
        pending_sessions: state.scheduler.pending(),
        engine,
        config: ConfigSummary {
            host: config.server.host.clone(),
            port: config.server.port,
            devices: config.hardware.devices.iter().map(|d| d.to_string()).collect(),
            max_context_length: config.model.max_context_length,
            token_delay_ms: config.server.token_delay_ms,
        },
    })
}

/// Loaded model description
pub async fn model_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.engine.status();
    let config = &state.config;
    Json(ModelInfoResponse {
        name: config.model.name.clone(),
        repo_id: config.model.repo_id.clone(),
        backend: status.backend,
        state: status.state,
        device: status.device.map(|d| d.to_string()),
        simulation: status.simulation,
        max_context_length: config.model.max_context_length,
        chat_template: config.model.chat_template,
        defaults: GenerationDefaults {
            max_tokens: config.generation.max_tokens,
            temperature: config.generation.temperature,
            top_p: config.generation.top_p,
            top_k: config.generation.top_k,
            repetition_penalty: config.generation.repeat_penalty,
        },
    })
}

/// Single-response chat endpoint
///
/// Runs the same pipeline as streaming and returns the accumulated text.
pub async fn chat(State(state): State<Arc<AppState>>, Json(request): Json<ChatRequest>) -> Response {
    if request.message.trim().is_empty() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request_error", "Empty message");
    }
    let params = match state
        .config
        .generation
        .with_overrides(&request.settings, state.config.model.max_context_length)
    {
        Ok(params) => params,
        Err(e) => {
            return error_response(StatusCode::UNPROCESSABLE_ENTITY, "invalid_request_error", e.to_string())
        }
    };

    let prompt = state.config.model.chat_template.render(&request.message);
    let queue = state.config.server.queue_batch_requests;

    match state.scheduler.generate_collect(prompt, params, queue).await {
        Ok(outcome) => {
            if let Some(message) = &outcome.error {
                tracing::warn!(error = %message, "batch generation ended with an error");
            }
            let response = ChatResponse {
                response_text: outcome.full_text,
                inference_time_seconds: outcome.elapsed.as_secs_f64(),
                tokens_generated: outcome.tokens_emitted,
                error: outcome.error.is_some(),
                error_message: outcome.error,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            let code = match e {
                SchedulerError::NotReady(_) | SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
                SchedulerError::Busy | SchedulerError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            };
            error_response(code, "server_busy", e.to_string())
        }
    }
}

/// Tear down and reinitialize the engine
pub async fn reload(State(state): State<Arc<AppState>>) -> Response {
    let drain = state.config.scheduler.reload_drain();
    match state.scheduler.reload(drain).await {
        Ok(engine_state) => {
            let status = state.engine.status();
            (
                StatusCode::OK,
                Json(ReloadResponse {
                    success: true,
                    state: engine_state,
                    device: status.device.map(|d| d.to_string()),
                }),
            )
                .into_response()
        }
        Err(e @ EngineError::ReloadRefused(_)) => {
            error_response(StatusCode::CONFLICT, "reload_refused", e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
    }
}

fn error_response(code: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: ErrorDetail {
                message: message.into(),
                r#type: kind.to_string(),
            },
        }),
    )
        .into_response()
}

// Request/Response types

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(flatten)]
    pub settings: GenerationOverrides,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub response_text: String,
    pub inference_time_seconds: f64,
    pub tokens_generated: usize,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub initialized: bool,
    pub model_loaded: bool,
    pub state: EngineState,
    pub device: Option<String>,
    pub degraded: bool,
    pub simulation: bool,
    /// Host memory in use, percent
    pub memory_usage: Option<f64>,
    pub process_memory_bytes: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub application: &'static str,
    pub version: &'static str,
    pub ready: bool,
    pub uptime_seconds: i64,
    pub active_clients: usize,
    pub pending_sessions: usize,
    pub engine: EngineStatus,
    pub config: ConfigSummary,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub host: String,
    pub port: u16,
    pub devices: Vec<String>,
    pub max_context_length: usize,
    pub token_delay_ms: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfoResponse {
    pub name: String,
    pub repo_id: String,
    pub backend: &'static str,
    pub state: EngineState,
    pub device: Option<String>,
    pub simulation: bool,
    pub max_context_length: usize,
    pub chat_template: ChatTemplate,
    pub defaults: GenerationDefaults,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationDefaults {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub state: EngineState,
    pub device: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
}
