//! In-memory storage collaborators.
//!
//! [`MockStore`] implements `SessionDirectory`, `SessionStore` and
//! `AuditSink` the way the Redis store does, keeping everything in memory
//! so tests can inspect what was written.
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::{MockStore, TestAppointment};
//!
//! let appointment = TestAppointment::new("room-1");
//! let store = MockStore::new().with_appointment(&appointment);
//!
//! store.fail_chat_writes(true);
//! // ...drive a chat message, expect an error event...
//! assert!(store.chat_messages().is_empty());
//! ```

use crate::fixtures::TestAppointment;
use async_trait::async_trait;
use common::types::SessionStatus;
use signaling_service::audit::{AuditAction, AuditEvent};
use signaling_service::session::{ChatMessage, SessionAuthorization, VitalSignsRecord};
use signaling_service::storage::{
    AuditSink, SessionDirectory, SessionStore, SessionTimestamps, StorageError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One persisted status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub room_id: String,
    pub status: SessionStatus,
    pub timestamps: SessionTimestamps,
}

#[derive(Debug, Default)]
pub struct MockStore {
    appointments: Mutex<HashMap<String, SessionAuthorization>>,
    chats: Mutex<Vec<ChatMessage>>,
    vitals: Mutex<Vec<VitalSignsRecord>>,
    statuses: Mutex<Vec<StatusWrite>>,
    audit: Mutex<Vec<AuditEvent>>,
    fail_directory: AtomicBool,
    fail_chat: AtomicBool,
    fail_vitals: AtomicBool,
}

impl MockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an appointment so its room can be joined.
    #[must_use]
    pub fn with_appointment(self, appointment: &TestAppointment) -> Self {
        self.add_appointment(appointment);
        self
    }

    pub fn add_appointment(&self, appointment: &TestAppointment) {
        self.appointments
            .lock()
            .unwrap()
            .insert(appointment.room_id.clone(), appointment.authorization());
    }

    /// Makes directory lookups fail as if storage were down.
    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::SeqCst);
    }

    pub fn fail_chat_writes(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    pub fn fail_vitals_writes(&self, fail: bool) {
        self.fail_vitals.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        self.chats.lock().unwrap().clone()
    }

    #[must_use]
    pub fn vitals(&self) -> Vec<VitalSignsRecord> {
        self.vitals.lock().unwrap().clone()
    }

    #[must_use]
    pub fn status_writes(&self) -> Vec<StatusWrite> {
        self.statuses.lock().unwrap().clone()
    }

    /// Last status written for a room.
    #[must_use]
    pub fn last_status(&self, room_id: &str) -> Option<SessionStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|w| w.room_id == room_id)
            .map(|w| w.status)
    }

    #[must_use]
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit.lock().unwrap().clone()
    }

    #[must_use]
    pub fn audit_actions(&self) -> Vec<(AuditAction, bool)> {
        self.audit
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.action, e.success))
            .collect()
    }
}

#[async_trait]
impl SessionDirectory for MockStore {
    async fn resolve_session_authorization(
        &self,
        room_id: &str,
    ) -> Result<Option<SessionAuthorization>, StorageError> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mock directory down".to_string()));
        }
        Ok(self.appointments.lock().unwrap().get(room_id).cloned())
    }
}

#[async_trait]
impl SessionStore for MockStore {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mock chat store down".to_string()));
        }
        self.chats.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn save_vitals(&self, record: &VitalSignsRecord) -> Result<(), StorageError> {
        if self.fail_vitals.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mock vitals store down".to_string()));
        }
        self.vitals.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn update_session_status(
        &self,
        room_id: &str,
        status: SessionStatus,
        timestamps: &SessionTimestamps,
    ) -> Result<(), StorageError> {
        let mut statuses = self.statuses.lock().unwrap();
        // Same rule as the Redis script: an ended session stays ended
        let ended = statuses
            .iter()
            .any(|w| w.room_id == room_id && w.status == SessionStatus::Ended);
        if ended {
            return Err(StorageError::Rejected(format!("{room_id} already ended")));
        }
        statuses.push(StatusWrite {
            room_id: room_id.to_string(),
            status,
            timestamps: timestamps.clone(),
        });
        Ok(())
    }
}

#[async_trait]
impl AuditSink for MockStore {
    async fn record(&self, event: &AuditEvent) -> Result<(), StorageError> {
        self.audit.lock().unwrap().push(event.clone());
        Ok(())
    }
}
