//! In-memory collaborators for actor unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::metrics::ActorMetrics;
use super::{SessionServices, SessionSettings};
use crate::audit::{AuditEmitter, AuditEvent, AuditSettings};
use crate::media::loopback::LoopbackEngine;
use crate::media::types::WebRtcTransportOptions;
use crate::media::worker_pool::{WorkerPool, WorkerPoolSettings};
use crate::session::records::{ChatMessage, VitalSignsRecord};
use crate::signaling::protocol::ServerEvent;
use crate::storage::{AuditSink, SessionStore, SessionTimestamps, StorageError};
use async_trait::async_trait;
use common::types::SessionStatus;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub chats: Mutex<Vec<ChatMessage>>,
    pub vitals: Mutex<Vec<VitalSignsRecord>>,
    pub statuses: Mutex<Vec<SessionStatus>>,
    pub fail_chat: AtomicBool,
}

impl MemoryStore {
    pub fn fail_chat_writes(&self) {
        self.fail_chat.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save_chat_message(&self, message: &ChatMessage) -> Result<(), StorageError> {
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("down".to_string()));
        }
        self.chats.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn save_vitals(&self, record: &VitalSignsRecord) -> Result<(), StorageError> {
        self.vitals.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn update_session_status(
        &self,
        _room_id: &str,
        status: SessionStatus,
        _timestamps: &SessionTimestamps,
    ) -> Result<(), StorageError> {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemorySink {
    pub events: Mutex<Vec<AuditEvent>>,
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn record(&self, event: &AuditEvent) -> Result<(), StorageError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub(crate) fn session_settings() -> SessionSettings {
    SessionSettings {
        negotiation_grace_period: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(5),
        max_session_duration: None,
        max_participants: 4,
        transport_options: WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            min_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            max_sctp_message_size: 262_144,
        },
    }
}

pub(crate) struct TestServices {
    pub engine: Arc<LoopbackEngine>,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<MemorySink>,
    pub metrics: Arc<ActorMetrics>,
    pub services: SessionServices,
}

pub(crate) async fn test_services(settings: SessionSettings, num_workers: usize) -> TestServices {
    let engine = Arc::new(LoopbackEngine::new());
    let pool = Arc::new(
        WorkerPool::start(
            engine.as_ref(),
            &WorkerPoolSettings {
                num_workers,
                rtc_min_port: 10000,
                rtc_ports_per_worker: 100,
            },
        )
        .await
        .unwrap(),
    );
    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(MemorySink::default());
    let (audit, _audit_task) = AuditEmitter::spawn(
        Arc::clone(&sink) as Arc<dyn AuditSink>,
        AuditSettings::default(),
        CancellationToken::new(),
    );
    let metrics = ActorMetrics::new();
    let services = SessionServices {
        pool,
        store: Arc::clone(&store) as Arc<dyn SessionStore>,
        audit,
        settings,
        metrics: Arc::clone(&metrics),
    };

    TestServices {
        engine,
        store,
        sink,
        metrics,
        services,
    }
}

/// A connection actor whose socket side is the returned receiver.
pub(crate) fn client(connection_id: &str) -> (ConnectionActorHandle, mpsc::Receiver<ServerEvent>) {
    let (tx, rx) = mpsc::channel(64);
    let (handle, _task) = ConnectionActor::spawn(
        connection_id.to_string(),
        tx,
        CancellationToken::new(),
        ActorMetrics::new(),
    );
    (handle, rx)
}

pub(crate) async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("connection closed")
}
