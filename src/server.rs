use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use log::info;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::progress::SharedProgress;
use crate::types::ProbeOutcome;

/// Read-only view of a probe run for the status API.
#[derive(Clone)]
pub struct AppState {
    progress: SharedProgress,
    inner: Arc<RwLock<ServerState>>,
}

#[derive(Debug, Default)]
struct ServerState {
    phase: Phase,
    results: Option<Vec<ProbeOutcome>>,
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub attempted: u64,
    pub accepted: u64,
    pub total: u64,
    pub state: Phase,
}

impl AppState {
    pub fn new(progress: SharedProgress) -> Self {
        Self { progress, inner: Arc::new(RwLock::new(ServerState::default())) }
    }

    pub async fn mark_running(&self) {
        let mut s = self.inner.write().await;
        s.phase = Phase::Running;
        s.results = None;
    }

    pub async fn finish(&self, results: Vec<ProbeOutcome>) {
        let mut s = self.inner.write().await;
        s.phase = Phase::Done;
        s.results = Some(results);
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .with_state(state);
    Router::new().nest("/api", api)
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("status API on http://{}/api/status", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let phase = app.inner.read().await.phase;
    let snap = app.progress.snapshot();
    let out = Status {
        attempted: snap.attempted,
        accepted: snap.accepted,
        total: snap.total,
        state: phase,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    match s.results.as_ref() {
        Some(res) => (StatusCode::OK, Json(res.clone())).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn status_reflects_live_counters() {
        let progress = SharedProgress::new();
        progress.reset(4);
        progress.record_attempt();
        let state = AppState::new(progress.clone());
        state.mark_running().await;

        let (code, body) = get_json(router(state), "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["attempted"], 1);
        assert_eq!(body["accepted"], 0);
        assert_eq!(body["total"], 4);
        assert_eq!(body["state"], "running");
    }

    #[tokio::test]
    async fn results_only_after_finish() {
        let state = AppState::new(SharedProgress::new());
        let (code, _) = get_json(router(state.clone()), "/api/results").await;
        assert_eq!(code, StatusCode::NO_CONTENT);

        state.finish(Vec::new()).await;
        let (code, body) = get_json(router(state), "/api/results").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));
    }
}
