//! HTTP control API for test harnesses.
//!
//! Every engine call is blocking, so handlers hand it to the blocking pool
//! and wait for the result.

pub mod error;

pub use error::ApiError;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use nb_core::{Action, Blocker, Decision, Target};
use nb_metrics::MetricsCollector;
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Clone)]
pub struct AppState {
    blocker: Arc<Blocker>,
    metrics: Arc<MetricsCollector>,
}

impl AppState {
    pub fn new(blocker: Arc<Blocker>, metrics: Arc<MetricsCollector>) -> Self {
        Self { blocker, metrics }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/metrics", get(metrics))
        .route("/api/v1/rules", get(rules))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/:action/tcp/:port", post(apply_port))
        .route("/api/v1/:action/from", post(apply_source))
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SourceQuery {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    intf: String,
}

async fn ping() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            format!("# Error rendering metrics: {}", e),
        ),
    }
}

async fn rules(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let blocker = state.blocker.clone();
    let list = tokio::task::spawn_blocking(move || blocker.rules()).await??;
    state
        .metrics
        .update_active_rules(&Decision::from_lines(&list));
    Ok(Json(json!({ "rules": list })))
}

async fn decisions(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let blocker = state.blocker.clone();
    let decisions = tokio::task::spawn_blocking(move || blocker.decisions()).await??;
    state.metrics.update_active_rules(&decisions);
    Ok(Json(json!({ "decisions": decisions })))
}

async fn apply_port(
    State(state): State<AppState>,
    Path((action, port)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let action: Action = action.parse()?;
    let port: u16 = port
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid TCP port '{}'", port)))?;
    let target = Target::tcp_port(port)?;
    apply(state, target, action).await
}

async fn apply_source(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Query(query): Query<SourceQuery>,
) -> Result<Json<Value>, ApiError> {
    let action: Action = action.parse()?;
    let target = Target::source(&query.ip, &query.intf)?;
    apply(state, target, action).await
}

async fn apply(state: AppState, target: Target, action: Action) -> Result<Json<Value>, ApiError> {
    let blocker = state.blocker.clone();
    let request = target.clone();
    let result = tokio::task::spawn_blocking(move || blocker.apply(&request, action)).await?;

    match result {
        Ok(()) => {
            state.metrics.record_apply_success(&target, action);
            Ok(Json(json!({ "status": "ok" })))
        }
        Err(err) => {
            tracing::error!(%target, %action, error = %err, "request failed");
            state
                .metrics
                .record_apply_failure(&target, action, err.target_state());
            Err(err.into())
        }
    }
}
