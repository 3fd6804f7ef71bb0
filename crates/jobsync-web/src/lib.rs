//! Axum + Askama dashboard: trigger a sync run and watch its progress.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use jobsync_sync::{RunSummary, SyncConfig, SyncPipeline};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

pub const DEFAULT_WEB_PORT: u16 = 8080;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStatus {
    pub is_running: bool,
    pub logs: Vec<String>,
    pub last_summary: Option<RunSummary>,
}

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<SyncPipeline>,
    status: Arc<Mutex<RunStatus>>,
}

impl AppState {
    pub fn new(pipeline: SyncPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            status: Arc::new(Mutex::new(RunStatus::default())),
        }
    }

    pub async fn status(&self) -> RunStatus {
        self.status.lock().await.clone()
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    is_running: bool,
    sheet_url: String,
    tabs: Vec<String>,
    last_summary: String,
    logs: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/run", post(run_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("JOBSYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.status().await;
    let config = state.pipeline.config();
    render_html(IndexTemplate {
        is_running: status.is_running,
        sheet_url: config.sheet_url.clone().unwrap_or_else(|| "#".to_string()),
        tabs: state
            .pipeline
            .tabs()
            .iter()
            .map(|t| format!("{} (tab {})", t.display_name, t.tag))
            .collect(),
        last_summary: status
            .last_summary
            .map(|s| s.to_string())
            .unwrap_or_else(|| "No run yet.".to_string()),
        logs: status.logs,
    })
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    {
        let mut status = state.status.lock().await;
        if status.is_running {
            return (
                StatusCode::CONFLICT,
                Json(json!({ "status": "error", "message": "a sync run is already in progress" })),
            )
                .into_response();
        }
        status.is_running = true;
        status.logs = vec![format!("[START] {} sync started", Utc::now().to_rfc3339())];
    }

    tokio::spawn(run_in_background(state));
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "success", "message": "sync started" })),
    )
        .into_response()
}

async fn run_in_background(state: Arc<AppState>) {
    let pipeline = state.pipeline.clone();
    let joined = tokio::spawn(async move { pipeline.run_once().await }).await;

    let mut status = state.status.lock().await;
    match joined {
        Ok(Ok(summary)) => {
            status.logs.push(format!(
                "[SUCCESS] {}: {} new, {} updated, {} unchanged",
                summary.status_label(),
                summary.new_jobs,
                summary.updated_jobs,
                summary.unchanged_jobs
            ));
            status.last_summary = Some(summary);
        }
        Ok(Err(err)) => {
            error!(error = %err, "sync run failed");
            status.logs.push(format!("[ERROR] {err}"));
        }
        Err(err) => {
            error!(error = %err, "sync task aborted");
            status.logs.push(format!("[ERROR] sync task aborted: {err}"));
        }
    }
    status.is_running = false;
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<RunStatus> {
    Json(state.status().await)
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Html(format!("Server error: {err}")),
        )
            .into_response(),
    }
}
