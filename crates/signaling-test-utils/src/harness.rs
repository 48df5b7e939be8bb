//! Gateway harness: a full signaling stack without sockets.
//!
//! [`TestHarness`] wires the in-process media engine, a worker pool, the
//! session registry and a [`MockStore`] together. Each [`TestClient`] is a
//! `SignalingGateway` over a real `ConnectionActor` whose outbound side is
//! a channel the test reads.

use crate::mock_store::MockStore;
use serde_json::Value;
use signaling_service::actors::{
    ActorMetrics, ConnectionActor, SessionRegistryHandle, SessionServices, SessionSettings,
};
use signaling_service::audit::{AuditEmitter, AuditSettings};
use signaling_service::media::loopback::LoopbackEngine;
use signaling_service::media::types::WebRtcTransportOptions;
use signaling_service::media::worker_pool::{WorkerPool, WorkerPoolSettings};
use signaling_service::signaling::protocol::{ErrorPayload, ServerEvent};
use signaling_service::signaling::{GatewayContext, GatewayPhase, SignalingGateway};
use signaling_service::storage::{AuditSink, SessionDirectory, SessionStore};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a client waits for the next event before failing the test.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Session settings with a 30s grace period and no duration limit.
#[must_use]
pub fn default_session_settings() -> SessionSettings {
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

pub struct TestHarness {
    pub engine: Arc<LoopbackEngine>,
    pub pool: Arc<WorkerPool>,
    pub store: Arc<MockStore>,
    pub registry: SessionRegistryHandle,
    pub context: Arc<GatewayContext>,
    /// Cancelled when a media worker dies.
    pub fatal: CancellationToken,
    pub metrics: Arc<ActorMetrics>,
}

impl TestHarness {
    /// One worker, default settings, room for 10 sessions.
    pub async fn start(store: MockStore) -> Self {
        Self::with_settings(store, default_session_settings(), 1, 10).await
    }

    pub async fn with_settings(
        store: MockStore,
        settings: SessionSettings,
        num_workers: usize,
        max_sessions: usize,
    ) -> Self {
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
            .expect("worker pool should start"),
        );

        let fatal = CancellationToken::new();
        pool.spawn_death_watch(fatal.clone());

        let store = Arc::new(store);
        let (audit, _audit_task) = AuditEmitter::spawn(
            Arc::clone(&store) as Arc<dyn AuditSink>,
            AuditSettings::default(),
            CancellationToken::new(),
        );

        let metrics = ActorMetrics::new();
        let registry = SessionRegistryHandle::new(
            "sig-test".to_string(),
            SessionServices {
                pool: Arc::clone(&pool),
                store: Arc::clone(&store) as Arc<dyn SessionStore>,
                audit: audit.clone(),
                settings,
                metrics: Arc::clone(&metrics),
            },
            max_sessions,
            fatal.clone(),
        );

        let context = Arc::new(GatewayContext {
            registry: registry.clone(),
            directory: Arc::clone(&store) as Arc<dyn SessionDirectory>,
            audit,
            metrics: Arc::clone(&metrics),
        });

        Self {
            engine,
            pool,
            store,
            registry,
            context,
            fatal,
            metrics,
        }
    }

    /// Opens a client connection.
    #[must_use]
    pub fn connect(&self, connection_id: &str) -> TestClient {
        let (tx, events) = mpsc::channel(256);
        let (connection, _task) = ConnectionActor::spawn(
            connection_id.to_string(),
            tx,
            CancellationToken::new(),
            Arc::clone(&self.metrics),
        );
        TestClient {
            gateway: SignalingGateway::new(connection, Arc::clone(&self.context)),
            events,
        }
    }

    /// Waits until the registry no longer holds `room_id`.
    pub async fn wait_for_session_removed(&self, room_id: &str) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            loop {
                let live = self
                    .registry
                    .get(room_id.to_string())
                    .await
                    .expect("registry should answer");
                if live.is_none() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not removed from the registry");
    }

    /// Waits until the audit sink holds at least `count` records.
    pub async fn wait_for_audit_records(&self, count: usize) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while self.store.audit_events().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("audit records were not delivered");
    }
}

pub struct TestClient {
    gateway: SignalingGateway,
    events: mpsc::Receiver<ServerEvent>,
}

impl TestClient {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.gateway.connection_id()
    }

    #[must_use]
    pub fn phase(&self) -> GatewayPhase {
        self.gateway.phase()
    }

    /// Sends one frame as the client would.
    pub async fn send(&mut self, frame: Value) {
        self.gateway.handle_text(&frame.to_string()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.gateway.handle_text(text).await;
    }

    /// Closes the socket.
    pub async fn disconnect(&mut self) {
        self.gateway.disconnect().await;
    }

    pub async fn next_event(&mut self) -> ServerEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("connection closed")
    }

    /// Next event, which must be named `name`.
    pub async fn expect(&mut self, name: &str) -> ServerEvent {
        let event = self.next_event().await;
        assert_eq!(
            event.name(),
            name,
            "{} expected {name}, got {event:?}",
            self.connection_id()
        );
        event
    }

    /// Next event, which must be an error with `code`.
    pub async fn expect_error(&mut self, code: i32) -> ErrorPayload {
        match self.next_event().await {
            ServerEvent::Error(payload) => {
                assert_eq!(payload.code, code, "unexpected error: {}", payload.message);
                payload
            }
            other => panic!("{} expected error {code}, got {other:?}", self.connection_id()),
        }
    }

    /// Asserts nothing is queued once pending work has run.
    pub async fn assert_no_event(&mut self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        if let Ok(event) = self.events.try_recv() {
            panic!("{} expected no event, got {event:?}", self.connection_id());
        }
    }

    /// Creates and connects a transport; returns its id.
    pub async fn open_transport(&mut self, room_id: &str, direction: &str) -> String {
        self.send(crate::fixtures::frames::create_transport(room_id, direction))
            .await;
        let ServerEvent::TransportCreated(created) = self.expect("transport-created").await else {
            unreachable!()
        };
        self.send(crate::fixtures::frames::connect_transport(room_id, &created.id))
            .await;
        self.expect("transport-connected").await;
        created.id
    }

    /// Produces on a connected transport; returns the producer id.
    pub async fn produce(
        &mut self,
        room_id: &str,
        transport_id: &str,
        kind: &str,
        rtp_parameters: Value,
    ) -> String {
        self.send(crate::fixtures::frames::produce(
            room_id,
            transport_id,
            kind,
            rtp_parameters,
        ))
        .await;
        let ServerEvent::Produced(produced) = self.expect("produced").await else {
            unreachable!()
        };
        produced.producer_id
    }
}
