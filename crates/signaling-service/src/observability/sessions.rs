//! Operator session statistics.
//!
//! - `GET /sessions` - registry status plus a snapshot of every live session
//! - `GET /sessions/{room_id}` - one session, 404 when not live
//!
//! Snapshots carry ids, status and timing only. Names, chat and vitals
//! never leave the session actor through here.

use crate::actors::{RegistryStatus, SessionRegistryHandle, SessionState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsOverview {
    pub status: RegistryStatus,
    pub sessions: Vec<SessionState>,
}

pub fn sessions_router(registry: SessionRegistryHandle) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:room_id", get(get_session))
        .with_state(registry)
}

async fn list_sessions(State(registry): State<SessionRegistryHandle>) -> Response {
    let (status, handles) = match (registry.get_status().await, registry.list().await) {
        (Ok(status), Ok(handles)) => (status, handles),
        (Err(e), _) | (_, Err(e)) => {
            warn!(target: "sig.actor.registry", error = %e, "Session listing failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let mut sessions = Vec::with_capacity(handles.len());
    for handle in handles {
        // A session may end between listing and asking
        if let Ok(state) = handle.get_state().await {
            sessions.push(state);
        }
    }
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    Json(SessionsOverview { status, sessions }).into_response()
}

async fn get_session(
    State(registry): State<SessionRegistryHandle>,
    Path(room_id): Path<String>,
) -> Response {
    let handle = match registry.get(room_id).await {
        Ok(Some(handle)) => handle,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(target: "sig.actor.registry", error = %e, "Session lookup failed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    match handle.get_state().await {
        Ok(state) => Json(state).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::testing::{session_settings, test_services};
    use crate::session::model::SessionAuthorization;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn authorization() -> SessionAuthorization {
        SessionAuthorization {
            appointment_id: "appt-1".to_string(),
            patient_id: "patient-1".to_string(),
            doctor_id: "doctor-1".to_string(),
        }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Option<Value>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).ok())
    }

    #[tokio::test]
    async fn test_lists_live_sessions() {
        let services = test_services(session_settings(), 1).await;
        let registry = SessionRegistryHandle::new(
            "sig-test".to_string(),
            services.services.clone(),
            10,
            CancellationToken::new(),
        );
        registry
            .get_or_create("room-1".to_string(), authorization())
            .await
            .unwrap();

        let (status, body) = get_json(sessions_router(registry.clone()), "/sessions").await;

        assert_eq!(status, StatusCode::OK);
        let body = body.unwrap();
        assert_eq!(body["status"]["sessionCount"], 1);
        assert_eq!(body["sessions"][0]["roomId"], "room-1");
        assert_eq!(body["sessions"][0]["appointmentId"], "appt-1");
    }

    #[tokio::test]
    async fn test_single_session_and_missing_room() {
        let services = test_services(session_settings(), 1).await;
        let registry = SessionRegistryHandle::new(
            "sig-test".to_string(),
            services.services.clone(),
            10,
            CancellationToken::new(),
        );
        registry
            .get_or_create("room-1".to_string(), authorization())
            .await
            .unwrap();

        let (status, body) = get_json(sessions_router(registry.clone()), "/sessions/room-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.unwrap()["status"], "waiting");

        let (status, _) = get_json(sessions_router(registry), "/sessions/room-9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
