//! GitHub push webhook that redeploys the web panel
//!
//! `POST /deploy` pulls the repository and restarts the web server container
//! when a push to the deploy branch touches the tracked file.
//! `GET /status` reports liveness.

pub mod executor;
pub mod signature;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use executor::DeployExecutor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    #[error("git pull failed: {0}")]
    Pull(String),
    #[error("restart failed: {0}")]
    Restart(String),
    #[error("Invalid signature")]
    Signature,
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    pub secret: String,
    pub repo_path: PathBuf,
    /// Container restarted after a pull
    pub service: String,
    /// Only pushes to this ref deploy
    pub branch_ref: String,
    /// Only pushes that add or modify this path deploy
    pub tracked_file: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            secret: "bomboclat".to_string(),
            repo_path: PathBuf::from("/app"),
            service: "nginx".to_string(),
            branch_ref: "refs/heads/main".to_string(),
            tracked_file: "index.html".to_string(),
        }
    }
}

pub struct AppState {
    pub config: DeployConfig,
    pub executor: Arc<dyn DeployExecutor>,
    /// One deployment at a time
    deploy_lock: Mutex<()>,
}

impl AppState {
    pub fn new(config: DeployConfig, executor: Arc<dyn DeployExecutor>) -> Self {
        Self {
            config,
            executor,
            deploy_lock: Mutex::new(()),
        }
    }
}

// ============================================
// Payloads
// ============================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PushCommit {
    pub added: Vec<String>,
    pub modified: Vec<String>,
}

impl PushEvent {
    pub fn touches(&self, path: &str) -> bool {
        self.commits.iter().any(|commit| {
            commit.added.iter().any(|p| p == path) || commit.modified.iter().any(|p| p == path)
        })
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "gitOutput", skip_serializing_if = "Option::is_none")]
    pub git_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl DeployResponse {
    fn ignored(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            action: Some("none".to_string()),
            ..Self::default()
        }
    }

    fn failed(message: &str, error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            error,
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================
// Routes
// ============================================

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/deploy", post(deploy_handler))
        .route("/status", get(status_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn status_handler() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        service: "GitHub Webhook Deployment",
        timestamp: now_rfc3339(),
    })
}

async fn deploy_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.config;

    if let Some(header) = headers.get(signature::SIGNATURE_HEADER) {
        let header = header.to_str().unwrap_or_default();
        if let Err(e) = signature::verify(&config.secret, &body, header) {
            log::warn!("[deploy] rejected webhook: {}", e);
            return reply(StatusCode::UNAUTHORIZED, DeployResponse::failed("Invalid signature", None));
        }
    }

    let event: PushEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            log::warn!("[deploy] malformed payload: {}", e);
            return reply(
                StatusCode::BAD_REQUEST,
                DeployResponse::failed("Invalid JSON payload", Some(e.to_string())),
            );
        }
    };

    if event.git_ref.as_deref() != Some(config.branch_ref.as_str()) {
        return reply(
            StatusCode::OK,
            DeployResponse::ignored("Ignored: Not a push to the main branch"),
        );
    }

    if !event.touches(&config.tracked_file) {
        let message = format!("Ignored: No changes to {}", config.tracked_file);
        return reply(StatusCode::OK, DeployResponse::ignored(&message));
    }

    let _guard = state.deploy_lock.lock().await;
    log::info!("[deploy] deploying updates from {}", config.repo_path.display());

    let git_output = match state.executor.pull(&config.repo_path).await {
        Ok(output) => output,
        Err(e) => {
            log::error!("[deploy] {}", e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                DeployResponse::failed("Git pull failed", Some(e.to_string())),
            );
        }
    };
    log::info!("[deploy] git pull: {}", git_output.trim());

    match state.executor.restart(&config.service).await {
        Ok(output) => log::info!("[deploy] restarted {}: {}", config.service, output.trim()),
        Err(e) => {
            log::error!("[deploy] {}", e);
            return reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                DeployResponse::failed("Nginx restart failed", Some(e.to_string())),
            );
        }
    }

    reply(
        StatusCode::OK,
        DeployResponse {
            success: true,
            message: "Deployment completed successfully".to_string(),
            git_output: Some(git_output),
            timestamp: Some(now_rfc3339()),
            ..DeployResponse::default()
        },
    )
}

fn reply(status: StatusCode, body: DeployResponse) -> Response {
    (status, Json(body)).into_response()
}
