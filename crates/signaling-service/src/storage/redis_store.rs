//! Redis-backed session storage.
//!
//! # Key Patterns
//!
//! - `telehealth:session:{room}` - Appointment record (HASH: `patient_id`,
//!   `doctor_id`, `appointment_id`, `status`, `actual_start`, `actual_end`)
//! - `telehealth:session:{room}:chat` - Chat history (LIST of JSON)
//! - `telehealth:session:{room}:vitals` - Vitals shared in a session (LIST of JSON)
//! - `telehealth:patient:{patient}:vitals` - Patient vitals history (LIST of JSON)
//! - `telehealth:audit:events` - Audit trail (LIST of JSON)
//!
//! The appointment hash is written by the scheduling side; this service only
//! reads authorization from it and updates status fields.
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
//! every operation clones it instead of locking.

use super::lua_scripts;
use super::{AuditSink, SessionDirectory, SessionStore, SessionTimestamps, StorageError};
use crate::audit::AuditEvent;
use crate::observability::metrics::record_storage_operation;
use crate::session::model::SessionAuthorization;
use crate::session::records::{ChatMessage, VitalSignsRecord};
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::SessionStatus;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

const AUDIT_KEY: &str = "telehealth:audit:events";

fn session_key(room_id: &str) -> String {
    format!("telehealth:session:{room_id}")
}

fn chat_key(room_id: &str) -> String {
    format!("telehealth:session:{room_id}:chat")
}

fn session_vitals_key(room_id: &str) -> String {
    format!("telehealth:session:{room_id}:vitals")
}

fn patient_vitals_key(patient_id: &str) -> String {
    format!("telehealth:patient:{patient_id}:vitals")
}

/// Implements [`SessionDirectory`], [`SessionStore`] and [`AuditSink`].
///
/// Cheaply cloneable; clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    update_status_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Opens a multiplexed connection.
    ///
    /// # Errors
    ///
    /// `StorageError::Unavailable` if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &SecretString) -> Result<Self, StorageError> {
        let client = Client::open(redis_url.expose_secret()).map_err(|e| {
            // Never log the URL, it can carry a password
            error!(target: "sig.storage", error = %e, "Failed to open Redis client");
            StorageError::Unavailable(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "sig.storage", error = %e, "Failed to connect to Redis");
                StorageError::Unavailable(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            update_status_script: Script::new(lua_scripts::UPDATE_SESSION_STATUS),
        })
    }

    /// Round-trip check used by the readiness probe at startup.
    pub async fn ping(&self) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Unavailable(format!("PING failed: {e}")))?;
        Ok(())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value)
        .map_err(|e| StorageError::Command(format!("serialization failed: {e}")))
}

fn finish<T>(
    operation: &str,
    started: Instant,
    result: Result<T, StorageError>,
) -> Result<T, StorageError> {
    record_storage_operation(operation, result.is_ok(), started.elapsed());
    result
}

#[async_trait]
impl SessionDirectory for RedisStore {
    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn resolve_session_authorization(
        &self,
        room_id: &str,
    ) -> Result<Option<SessionAuthorization>, StorageError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result = async {
            let fields: HashMap<String, String> =
                conn.hgetall(session_key(room_id)).await.map_err(|e| {
                    warn!(target: "sig.storage", error = %e, "Failed to read session record");
                    StorageError::Command(format!("Failed to read session record: {e}"))
                })?;
            authorization_from_fields(&fields)
        }
        .await;

        finish("resolve_session_authorization", started, result)
    }
}

/// `Ok(None)` for a missing record, `Corrupt` for a record without its ids.
fn authorization_from_fields(
    fields: &HashMap<String, String>,
) -> Result<Option<SessionAuthorization>, StorageError> {
    if fields.is_empty() {
        return Ok(None);
    }

    let field = |name: &str| {
        fields
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| StorageError::Corrupt(format!("session record missing {name}")))
    };

    Ok(Some(SessionAuthorization {
        appointment_id: field("appointment_id")?,
        patient_id: field("patient_id")?,
        doctor_id: field("doctor_id")?,
    }))
}

#[async_trait]
impl SessionStore for RedisStore {
    #[instrument(skip_all, fields(room_id = %message.session_id, message_id = %message.id))]
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result = async {
            let json = encode(message)?;
            let _: i64 = conn
                .rpush(chat_key(&message.session_id), json)
                .await
                .map_err(|e| {
                    warn!(target: "sig.storage", error = %e, "Failed to save chat message");
                    StorageError::Command(format!("Failed to save chat message: {e}"))
                })?;
            Ok(())
        }
        .await;

        finish("save_chat_message", started, result)
    }

    #[instrument(skip_all, fields(room_id = %record.session_id))]
    async fn save_vitals(&self, record: &VitalSignsRecord) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result = async {
            let json = encode(record)?;
            // Both histories or neither
            let _: () = redis::pipe()
                .atomic()
                .rpush(patient_vitals_key(&record.patient_id), &json)
                .ignore()
                .rpush(session_vitals_key(&record.session_id), &json)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(target: "sig.storage", error = %e, "Failed to save vitals");
                    StorageError::Command(format!("Failed to save vitals: {e}"))
                })?;
            Ok(())
        }
        .await;

        finish("save_vitals", started, result)
    }

    #[instrument(skip_all, fields(room_id = %room_id, status = %status))]
    async fn update_session_status(
        &self,
        room_id: &str,
        status: SessionStatus,
        timestamps: &SessionTimestamps,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let actual_start = timestamps
            .actual_start
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let actual_end = timestamps
            .actual_end
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();

        let result = async {
            let code: i64 = self
                .update_status_script
                .key(session_key(room_id))
                .arg(status.storage_value())
                .arg(actual_start)
                .arg(actual_end)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    warn!(target: "sig.storage", error = %e, "Failed to update session status");
                    StorageError::Command(format!("Failed to update session status: {e}"))
                })?;
            status_result(code)
        }
        .await;

        if result.is_ok() {
            debug!(
                target: "sig.storage",
                room_id = %room_id,
                status = %status,
                "Session status updated"
            );
        }
        finish("update_session_status", started, result)
    }
}

fn status_result(code: i64) -> Result<(), StorageError> {
    match code {
        1 => Ok(()),
        0 => Err(StorageError::Rejected("session already ended".to_string())),
        -1 => Err(StorageError::Command("session record missing".to_string())),
        other => Err(StorageError::Command(format!(
            "unexpected status script result: {other}"
        ))),
    }
}

#[async_trait]
impl AuditSink for RedisStore {
    #[instrument(skip_all, fields(audit_id = %event.id, action = ?event.action))]
    async fn record(&self, event: &AuditEvent) -> Result<(), StorageError> {
        let started = Instant::now();
        let mut conn = self.connection.clone();

        let result = async {
            let json = encode(event)?;
            let _: i64 = conn.rpush(AUDIT_KEY, json).await.map_err(|e| {
                warn!(target: "sig.storage", error = %e, "Failed to append audit event");
                StorageError::Command(format!("Failed to append audit event: {e}"))
            })?;
            Ok(())
        }
        .await;

        finish("record_audit_event", started, result)
    }
}
