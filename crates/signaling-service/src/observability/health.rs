//! Liveness and readiness probes.
//!
//! - `GET /health` answers 200 while the process runs.
//! - `GET /ready` answers 200 only after startup finished, while no media
//!   worker has died and before draining begins. Otherwise 503 with the
//!   reason in the body.
//!
//! `/metrics` and the `/sessions` admin routes are merged onto the same
//! listener by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why the instance is or is not taking joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Starting,
    WorkerFailed,
    Draining,
}

/// Probe state shared between the binary and the health listener.
#[derive(Debug)]
pub struct HealthState {
    started: AtomicBool,
    draining: AtomicBool,
    /// Cancelled by the worker death watch.
    fatal: CancellationToken,
}

impl HealthState {
    #[must_use]
    pub fn new(fatal: CancellationToken) -> Self {
        Self {
            started: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            fatal,
        }
    }

    /// Storage, workers and listeners are up.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Shutdown began; load balancers should stop routing joins here.
    pub fn begin_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if self.draining.load(Ordering::SeqCst) {
            Readiness::Draining
        } else if self.fatal.is_cancelled() {
            Readiness::WorkerFailed
        } else if self.started.load(Ordering::SeqCst) {
            Readiness::Ready
        } else {
            Readiness::Starting
        }
    }
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    status: Readiness,
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ReadinessBody>) {
    let status = state.readiness();
    let code = if status == Readiness::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(ReadinessBody { status }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn probe(state: &Arc<HealthState>, uri: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = health_router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("Failed to execute request");
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_is_unconditional() {
        let state = Arc::new(HealthState::new(CancellationToken::new()));
        state.begin_draining();
        assert_eq!(probe(&state, "/health").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_lifecycle() {
        let state = Arc::new(HealthState::new(CancellationToken::new()));

        let (code, body) = probe(&state, "/ready").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"starting"}"#);

        state.mark_started();
        let (code, body) = probe(&state, "/ready").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, r#"{"status":"ready"}"#);

        state.begin_draining();
        let (code, body) = probe(&state, "/ready").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"draining"}"#);
    }

    #[tokio::test]
    async fn test_dead_worker_fails_readiness() {
        let fatal = CancellationToken::new();
        let state = Arc::new(HealthState::new(fatal.clone()));
        state.mark_started();

        fatal.cancel();
        let (code, body) = probe(&state, "/ready").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"status":"worker_failed"}"#);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new(CancellationToken::new()));
        assert_eq!(probe(&state, "/unknown").await.0, StatusCode::NOT_FOUND);
    }
}
