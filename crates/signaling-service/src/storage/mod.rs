//! Storage collaborators.
//!
//! The signaling layer reads appointment authorization and writes chat,
//! vitals, session status and audit records. Each concern is its own
//! trait so tests can fake them independently; [`redis_store::RedisStore`]
//! implements all three against one Redis deployment.

pub mod lua_scripts;
pub mod redis_store;

use crate::audit::AuditEvent;
use crate::session::model::SessionAuthorization;
use crate::session::records::{ChatMessage, VitalSignsRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::SessionStatus;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage command failed: {0}")]
    Command(String),

    /// A stored record could not be decoded.
    #[error("invalid stored record: {0}")]
    Corrupt(String),

    /// Status write refused (e.g. the session already ended).
    #[error("status transition rejected: {0}")]
    Rejected(String),
}

/// Session timing persisted alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimestamps {
    pub actual_start: Option<DateTime<Utc>>,
    pub actual_end: Option<DateTime<Utc>>,
}

/// Resolves a room id to the appointment it belongs to.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// `Ok(None)` when no appointment exists for `room_id`.
    async fn resolve_session_authorization(
        &self,
        room_id: &str,
    ) -> Result<Option<SessionAuthorization>, StorageError>;
}

/// Durable session data written while a session runs.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError>;

    async fn save_vitals(&self, record: &VitalSignsRecord) -> Result<(), StorageError>;

    async fn update_session_status(
        &self,
        room_id: &str,
        status: SessionStatus,
        timestamps: &SessionTimestamps,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<(), StorageError>;
}
