//! Audit trail for PHI-touching session activity.
//!
//! Callers hand records to [`AuditEmitter::emit`], which never blocks and
//! never fails the triggering action. A background worker delivers them to
//! the [`AuditSink`] in order, retrying with exponential backoff. Records
//! that still fail are logged and counted, then dropped.
//!
//! Records carry ids and the action, never chat text or vitals.

use crate::observability::metrics::record_audit_event;
use crate::storage::AuditSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const AUDIT_RESOURCE_TYPE: &str = "telemedicine_session";

/// Actor id for actions the service takes on its own.
pub const SYSTEM_ACTOR: &str = "system";

/// Upper bound on a single retry delay.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    JoinSession,
    LeaveSession,
    ChatMessage,
    ShareVitals,
    EndSession,
    StartRecording,
    StopRecording,
}

impl AuditAction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            AuditAction::JoinSession => "JOIN_SESSION",
            AuditAction::LeaveSession => "LEAVE_SESSION",
            AuditAction::ChatMessage => "CHAT_MESSAGE",
            AuditAction::ShareVitals => "SHARE_VITALS",
            AuditAction::EndSession => "END_SESSION",
            AuditAction::StartRecording => "START_RECORDING",
            AuditAction::StopRecording => "STOP_RECORDING",
        }
    }
}

/// One audit record.
///
/// `resource_id` is the patient whose data was touched; the session id
/// goes in `details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub actor_id: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: String,
    pub success: bool,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        actor_id: &str,
        action: AuditAction,
        resource_id: &str,
        success: bool,
        details: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            action,
            resource_type: AUDIT_RESOURCE_TYPE.to_string(),
            resource_id: resource_id.to_string(),
            success,
            details,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditSettings {
    pub queue_capacity: usize,
    /// Delivery attempts per record, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each retry.
    pub retry_base: Duration,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_attempts: 5,
            retry_base: Duration::from_millis(200),
        }
    }
}

/// Non-blocking front of the audit worker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditEmitter {
    sender: mpsc::Sender<AuditEvent>,
}

impl AuditEmitter {
    /// Starts the delivery worker.
    ///
    /// The worker exits when `cancel` fires (after one last delivery attempt
    /// for anything queued) or when every emitter clone is dropped.
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        settings: AuditSettings,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let worker = AuditWorker {
            sink,
            settings,
            receiver,
            cancel,
        };
        (Self { sender }, tokio::spawn(worker.run()))
    }

    /// Queue a record. Drops it (with a warning) if the queue is full.
    pub fn emit(&self, event: AuditEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    target: "sig.audit",
                    audit_id = %event.id,
                    action = event.action.as_str(),
                    "Audit queue full, record dropped"
                );
                record_audit_event("dropped");
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    target: "sig.audit",
                    audit_id = %event.id,
                    action = event.action.as_str(),
                    "Audit worker stopped, record dropped"
                );
                record_audit_event("dropped");
            }
        }
    }
}

struct AuditWorker {
    sink: Arc<dyn AuditSink>,
    settings: AuditSettings,
    receiver: mpsc::Receiver<AuditEvent>,
    cancel: CancellationToken,
}

impl AuditWorker {
    async fn run(mut self) {
        debug!(target: "sig.audit", "Audit worker started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.drain().await;
                    break;
                }
                event = self.receiver.recv() => {
                    match event {
                        Some(event) => self.deliver(&event).await,
                        None => break,
                    }
                }
            }
        }

        info!(target: "sig.audit", "Audit worker stopped");
    }

    /// One attempt per remaining record.
    async fn drain(&mut self) {
        let mut flushed = 0usize;
        while let Ok(event) = self.receiver.try_recv() {
            match self.sink.record(&event).await {
                Ok(()) => record_audit_event("delivered"),
                Err(e) => {
                    error!(
                        target: "sig.audit",
                        audit_id = %event.id,
                        action = event.action.as_str(),
                        error = %e,
                        "Audit record lost at shutdown"
                    );
                    record_audit_event("failed");
                }
            }
            flushed += 1;
        }
        if flushed > 0 {
            info!(target: "sig.audit", flushed, "Flushed queued audit records");
        }
    }

    async fn deliver(&self, event: &AuditEvent) {
        let mut attempt = 1;
        let mut delay = self.settings.retry_base;

        loop {
            let err = match self.sink.record(event).await {
                Ok(()) => {
                    record_audit_event("delivered");
                    return;
                }
                Err(e) => e,
            };

            if attempt >= self.settings.max_attempts {
                error!(
                    target: "sig.audit",
                    audit_id = %event.id,
                    action = event.action.as_str(),
                    attempts = attempt,
                    error = %err,
                    "Audit record delivery failed after max attempts"
                );
                record_audit_event("failed");
                return;
            }

            warn!(
                target: "sig.audit",
                audit_id = %event.id,
                attempt,
                delay_ms = delay.as_millis(),
                error = %err,
                "Audit record delivery failed, retrying"
            );
            record_audit_event("retried");

            tokio::select! {
                () = self.cancel.cancelled() => {
                    // Shutdown interrupts the backoff
                    error!(
                        target: "sig.audit",
                        audit_id = %event.id,
                        action = event.action.as_str(),
                        "Audit record abandoned at shutdown"
                    );
                    record_audit_event("failed");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            delay = (delay * 2).min(BACKOFF_MAX);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then records.
    #[derive(Default)]
    struct FlakySink {
        failures: AtomicU32,
        calls: AtomicU32,
        attempts_at: Mutex<Vec<Instant>>,
        recorded: Mutex<Vec<AuditEvent>>,
    }

    impl FlakySink {
        fn failing(n: u32) -> Arc<Self> {
            let sink = Self::default();
            sink.failures.store(n, Ordering::SeqCst);
            Arc::new(sink)
        }

        fn recorded(&self) -> Vec<AuditEvent> {
            self.recorded.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AuditSink for FlakySink {
        async fn record(&self, event: &AuditEvent) -> Result<(), StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.attempts_at.lock().unwrap().push(Instant::now());
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StorageError::Unavailable("audit store down".to_string()));
            }
            self.recorded.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn settings() -> AuditSettings {
        AuditSettings {
            queue_capacity: 8,
            max_attempts: 3,
            retry_base: Duration::from_millis(100),
        }
    }

    fn event(action: AuditAction) -> AuditEvent {
        AuditEvent::new("doctor-1", action, "patient-1", true, json!({"sessionId": "room-1"}))
    }

    #[test]
    fn test_audit_event_shape() {
        let value = serde_json::to_value(event(AuditAction::JoinSession)).unwrap();
        assert_eq!(value["action"], "JOIN_SESSION");
        assert_eq!(value["resourceType"], "telemedicine_session");
        assert_eq!(value["resourceId"], "patient-1");
        assert_eq!(value["details"]["sessionId"], "room-1");
        assert_eq!(AuditAction::StopRecording.as_str(), "STOP_RECORDING");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order() {
        let sink = FlakySink::failing(0);
        let cancel = CancellationToken::new();
        let (emitter, task) = AuditEmitter::spawn(sink.clone(), settings(), cancel.clone());

        emitter.emit(event(AuditAction::JoinSession));
        emitter.emit(event(AuditAction::ChatMessage));
        emitter.emit(event(AuditAction::EndSession));
        drop(emitter);
        task.await.unwrap();

        let actions: Vec<AuditAction> = sink.recorded().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::JoinSession,
                AuditAction::ChatMessage,
                AuditAction::EndSession
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff() {
        let sink = FlakySink::failing(2);
        let (emitter, task) =
            AuditEmitter::spawn(sink.clone(), settings(), CancellationToken::new());

        emitter.emit(event(AuditAction::ShareVitals));
        drop(emitter);
        task.await.unwrap();

        assert_eq!(sink.recorded().len(), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

        let at = sink.attempts_at.lock().unwrap().clone();
        let gaps: Vec<Duration> = at.iter().zip(at.iter().skip(1)).map(|(a, b)| *b - *a).collect();
        assert_eq!(
            gaps,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let sink = FlakySink::failing(10);
        let (emitter, task) =
            AuditEmitter::spawn(sink.clone(), settings(), CancellationToken::new());

        emitter.emit(event(AuditAction::JoinSession));
        emitter.emit(event(AuditAction::LeaveSession));
        drop(emitter);
        task.await.unwrap();

        // 3 attempts each, nothing recorded, worker moved on to the second
        assert_eq!(sink.calls.load(Ordering::SeqCst), 6);
        assert!(sink.recorded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_without_blocking() {
        let sink = FlakySink::failing(0);
        let cancel = CancellationToken::new();
        let settings = AuditSettings {
            queue_capacity: 2,
            ..settings()
        };
        let (emitter, task) = AuditEmitter::spawn(sink.clone(), settings, cancel.clone());

        // Worker has not run yet; only two fit
        for _ in 0..5 {
            emitter.emit(event(AuditAction::ChatMessage));
        }
        drop(emitter);
        task.await.unwrap();

        assert_eq!(sink.recorded().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_queue() {
        let sink = FlakySink::failing(0);
        let cancel = CancellationToken::new();
        let (emitter, task) = AuditEmitter::spawn(sink.clone(), settings(), cancel.clone());

        cancel.cancel();
        emitter.emit(event(AuditAction::EndSession));
        emitter.emit(event(AuditAction::EndSession));
        task.await.unwrap();

        assert_eq!(sink.recorded().len(), 2);
    }
}
