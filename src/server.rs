// src/server.rs
use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::error::{HarnessError, Result};
use crate::extraction::Backend;
use crate::segments::strip_disclaimer;
use crate::tasks::{task_records, TaskRecord};

/// Backends plus the shared few-shot block, fixed for the server's lifetime.
#[derive(Clone)]
pub struct Engine {
    backends: BTreeMap<String, Backend>,
    default_model: String,
    context_block: Arc<str>,
}

impl Engine {
    /// The first backend becomes the default model.
    pub fn new(backends: Vec<Backend>, context_block: impl Into<Arc<str>>) -> Result<Self> {
        let default_model = backends
            .first()
            .map(|b| b.name.clone())
            .ok_or_else(|| HarnessError::Configuration("no backend is available to serve".into()))?;
        let backends = backends.into_iter().map(|b| (b.name.clone(), b)).collect();
        Ok(Self { backends, default_model, context_block: context_block.into() })
    }

    pub fn models(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    pub meeting_id: String,
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub meeting_id: String,
    pub model_used: String,
    pub processing_time: f64,
    pub parse_succeeded: bool,
    pub tasks: Vec<TaskRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResp {
    pub status: &'static str,
    pub default_model: String,
    pub models: Vec<String>,
}

fn reject(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { error: message.into() }))
}

pub async fn extract(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<ExtractRequest>,
) -> std::result::Result<Json<ExtractResponse>, (StatusCode, Json<ErrorBody>)> {
    if req.text.trim().is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "text must not be empty"));
    }
    let model = req.model.as_deref().unwrap_or(&engine.default_model);
    let backend = engine
        .backends
        .get(model)
        .ok_or_else(|| reject(StatusCode::BAD_REQUEST, format!("model {model} is not configured")))?;

    let transcript = strip_disclaimer(&req.text);
    let prediction = backend
        .predict(&req.meeting_id, &transcript, &engine.context_block, req.language.as_deref())
        .await;
    let record = prediction.record;
    let tasks = task_records(&req.meeting_id, &transcript, &record.predicted_tasks, backend.kind);
    info!(
        meeting_id = %req.meeting_id,
        model = %backend.name,
        tasks = tasks.len(),
        parse_succeeded = record.parse_succeeded,
        "Extracted tasks"
    );

    Ok(Json(ExtractResponse {
        meeting_id: req.meeting_id,
        model_used: backend.name.clone(),
        processing_time: record.latency_seconds,
        parse_succeeded: record.parse_succeeded,
        tasks,
        error: prediction.error,
    }))
}

pub async fn health(State(engine): State<Arc<Engine>>) -> Json<HealthResp> {
    Json(HealthResp { status: "ok", default_model: engine.default_model.clone(), models: engine.models() })
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/extract", post(extract))
        .route("/health", get(health))
        .with_state(Arc::new(engine))
}

pub async fn run_server(engine: Engine, addr: &str, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Serving task extraction");
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
