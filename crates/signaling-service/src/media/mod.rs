//! Media engine abstraction.
//!
//! The signaling layer never moves media itself. It drives an SFU engine
//! through the traits below: workers host routers, routers host WebRTC
//! transports, transports carry producers (client to server) and consumers
//! (server to client).
//!
//! ```text
//! MediaEngine
//! └── MediaWorker (one per CPU, owned by WorkerPool)
//!     └── MediaRouter (one per session)
//!         └── MediaTransport (send / recv per participant)
//!             ├── MediaProducer
//!             └── MediaConsumer
//! ```
//!
//! Closing is synchronous and idempotent on every handle. Anything that
//! talks to the engine process is async.

pub mod codecs;
pub mod loopback;
pub mod types;
pub mod worker_pool;

use async_trait::async_trait;
use common::types::MediaKind;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;
use types::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpCodecCapability,
    RtpParameters, SctpParameters, WebRtcTransportOptions, WorkerSettings,
};

/// Errors reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The worker process is gone. Not recoverable in-process.
    #[error("worker died: {0}")]
    WorkerDied(String),

    #[error("router closed")]
    RouterClosed,

    #[error("transport closed")]
    TransportClosed,

    #[error("producer not found: {0}")]
    ProducerNotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("incompatible capabilities: {0}")]
    Incompatible(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("engine request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError>;
}

#[async_trait]
pub trait MediaWorker: Send + Sync + Debug {
    fn id(&self) -> &str;

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError>;

    /// Resolves when the worker process dies, with the reported reason.
    async fn died(&self) -> String;

    fn close(&self);
}

#[async_trait]
pub trait MediaRouter: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn has_producer(&self, producer_id: &str) -> bool;

    /// Whether a client with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait MediaTransport: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    fn sctp_parameters(&self) -> Option<SctpParameters>;

    /// Completes the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, EngineError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError>;

    /// Resolves once DTLS reaches `closed` or `failed`.
    async fn dtls_closed(&self);

    fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn paused(&self) -> bool;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync + Debug {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    /// Consumer type reported to the client ("simple" for single-stream).
    fn consumer_type(&self) -> &str;

    fn paused(&self) -> bool;

    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    fn close(&self);
}
