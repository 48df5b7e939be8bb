//! Per-session side channel: chat, vitals and status persistence.
//!
//! Every session runs one lane task. Jobs are persisted strictly in
//! submission order. After a chat or vitals write, the outcome goes back to
//! the session actor as a [`SideChannelCommit`]; the actor broadcasts on
//! success, so broadcasts happen in persistence order and nothing is
//! delivered that was not stored.
//!
//! Status updates are fire-and-forget: failures are logged, never
//! reported to clients.

use crate::actors::messages::SessionMessage;
use crate::audit::{AuditAction, AuditEmitter, AuditEvent};
use crate::errors::SignalingError;
use crate::session::records::{ChatMessage, VitalSignsRecord};
use crate::storage::{SessionStore, SessionTimestamps, StorageError};
use common::types::SessionStatus;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queued jobs per session before submissions are refused.
const SIDE_CHANNEL_BUFFER: usize = 256;

/// Who sent a side-channel record and who should receive it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sender_connection: String,
    /// Connections in the session when the record was accepted.
    pub recipients: Vec<String>,
}

#[derive(Debug)]
enum SideChannelJob {
    Chat {
        message: ChatMessage,
        delivery: Delivery,
    },
    Vitals {
        record: VitalSignsRecord,
        delivery: Delivery,
    },
    Status {
        status: SessionStatus,
        timestamps: SessionTimestamps,
    },
}

/// Persistence outcome handed back to the session actor.
#[derive(Debug)]
pub enum SideChannelCommit {
    Chat {
        message: ChatMessage,
        delivery: Delivery,
        result: Result<(), StorageError>,
    },
    Vitals {
        record: VitalSignsRecord,
        delivery: Delivery,
        result: Result<(), StorageError>,
    },
}

/// Submission side of a session's lane.
#[derive(Debug)]
pub struct SideChannelRouter {
    sender: mpsc::Sender<SideChannelJob>,
}

impl SideChannelRouter {
    /// Starts the lane for `room_id`.
    ///
    /// `patient_id` is the audit resource id. Commits go to `commits`; the
    /// lane keeps only a weak reference so it never keeps a finished
    /// session alive.
    pub fn spawn(
        room_id: String,
        patient_id: String,
        store: Arc<dyn SessionStore>,
        audit: AuditEmitter,
        commits: mpsc::WeakSender<SessionMessage>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SIDE_CHANNEL_BUFFER);
        let lane = Lane {
            room_id,
            patient_id,
            store,
            audit,
            commits,
            receiver,
        };
        (Self { sender }, tokio::spawn(lane.run()))
    }

    /// # Errors
    ///
    /// `Internal` if the lane is backed up or gone.
    pub fn submit_chat(
        &self,
        message: ChatMessage,
        delivery: Delivery,
    ) -> Result<(), SignalingError> {
        self.submit(SideChannelJob::Chat { message, delivery })
    }

    /// # Errors
    ///
    /// `Internal` if the lane is backed up or gone.
    pub fn submit_vitals(
        &self,
        record: VitalSignsRecord,
        delivery: Delivery,
    ) -> Result<(), SignalingError> {
        self.submit(SideChannelJob::Vitals { record, delivery })
    }

    /// Queue a status write. Failures are only logged.
    pub fn persist_status(&self, status: SessionStatus, timestamps: SessionTimestamps) {
        if let Err(e) = self.submit(SideChannelJob::Status { status, timestamps }) {
            warn!(
                target: "sig.storage",
                status = %status,
                error = %e,
                "Session status update not queued"
            );
        }
    }

    fn submit(&self, job: SideChannelJob) -> Result<(), SignalingError> {
        self.sender
            .try_send(job)
            .map_err(|e| SignalingError::Internal(format!("side channel unavailable: {e}")))
    }
}

struct Lane {
    room_id: String,
    patient_id: String,
    store: Arc<dyn SessionStore>,
    audit: AuditEmitter,
    commits: mpsc::WeakSender<SessionMessage>,
    receiver: mpsc::Receiver<SideChannelJob>,
}

impl Lane {
    /// Runs until the router is dropped and the queue is empty.
    async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            match job {
                SideChannelJob::Chat { message, delivery } => {
                    let result = self.store.save_chat_message(&message).await;
                    self.audit_write(
                        AuditAction::ChatMessage,
                        &message.sender_id,
                        result.is_ok(),
                        json!({
                            "sessionId": self.room_id,
                            "messageId": message.id,
                            "messageType": message.message_type,
                        }),
                    );
                    self.commit(SideChannelCommit::Chat {
                        message,
                        delivery,
                        result,
                    })
                    .await;
                }
                SideChannelJob::Vitals { record, delivery } => {
                    let result = self.store.save_vitals(&record).await;
                    self.audit_write(
                        AuditAction::ShareVitals,
                        &record.patient_id,
                        result.is_ok(),
                        json!({ "sessionId": self.room_id }),
                    );
                    self.commit(SideChannelCommit::Vitals {
                        record,
                        delivery,
                        result,
                    })
                    .await;
                }
                SideChannelJob::Status { status, timestamps } => {
                    if let Err(e) = self
                        .store
                        .update_session_status(&self.room_id, status, &timestamps)
                        .await
                    {
                        warn!(
                            target: "sig.storage",
                            room_id = %self.room_id,
                            status = %status,
                            error = %e,
                            "Failed to persist session status"
                        );
                    }
                }
            }
        }

        debug!(target: "sig.storage", room_id = %self.room_id, "Side channel lane stopped");
    }

    fn audit_write(
        &self,
        action: AuditAction,
        actor_id: &str,
        success: bool,
        details: serde_json::Value,
    ) {
        self.audit.emit(AuditEvent::new(
            actor_id,
            action,
            &self.patient_id,
            success,
            details,
        ));
    }

    async fn commit(&self, commit: SideChannelCommit) {
        let Some(sender) = self.commits.upgrade() else {
            return;
        };
        if sender
            .send(SessionMessage::SideChannelCommitted(commit))
            .await
            .is_err()
        {
            debug!(
                target: "sig.storage",
                room_id = %self.room_id,
                "Session gone before side channel commit"
            );
        }
    }
}
