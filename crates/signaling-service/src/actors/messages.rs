//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use super::connection::ConnectionActorHandle;
use super::session::SessionActorHandle;
use crate::errors::SignalingError;
use crate::media::types::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::media::worker_pool::RouterLease;
use crate::media::{EngineError, MediaConsumer, MediaProducer, MediaTransport};
use crate::session::model::SessionAuthorization;
use crate::session::participants::ParticipantInfo;
use crate::session::records::VitalSigns;
use crate::side_channel::SideChannelCommit;
use crate::signaling::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use common::types::{ChatMessageType, MediaKind, ParticipantRole, SessionStatus, TransportDirection};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Forward an event to the client.
    Deliver(ServerEvent),

    /// Flush queued events and stop.
    Close { reason: String },
}

/// Messages sent to `SessionRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the live session for a room, creating it if needed.
    GetOrCreate {
        room_id: String,
        authorization: SessionAuthorization,
        respond_to: oneshot::Sender<Result<SessionActorHandle, SignalingError>>,
    },

    /// Look up a live session without creating one.
    Get {
        room_id: String,
        respond_to: oneshot::Sender<Option<SessionActorHandle>>,
    },

    /// Handles of every live session.
    List {
        respond_to: oneshot::Sender<Vec<SessionActorHandle>>,
    },

    /// Get current registry status (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting sessions and end every live one.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// Router creation for a pending room finished.
    RouterAcquired {
        room_id: String,
        authorization: SessionAuthorization,
        result: Result<RouterLease, EngineError>,
    },

    /// A session actor finished and released its router.
    SessionFinalized { room_id: String, instance_id: u64 },
}

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// A connection wants to join this session.
    Join {
        request: JoinRequest,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<JoinAccepted, SignalingError>>,
    },

    /// A joined connection issued a signaling request.
    ///
    /// The reply only says whether the request was accepted. Results go to
    /// the client through its connection mailbox.
    Request {
        connection_id: String,
        request: SessionRequest,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },

    /// A joined connection's socket closed.
    ConnectionClosed { connection_id: String },

    /// Snapshot for the admin endpoints.
    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },

    /// A media engine call started by this session finished.
    Completed(EngineCompletion),

    /// The side channel finished persisting a chat or vitals record.
    SideChannelCommitted(SideChannelCommit),

    /// The engine reported DTLS closure on a transport.
    TransportClosed {
        connection_id: String,
        transport_id: String,
    },
}

/// Identity claimed by a joining connection.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub participant_id: String,
    pub name: String,
    pub role: ParticipantRole,
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAccepted {
    pub room_id: String,
    pub participant_id: String,
    pub status: SessionStatus,
}

/// Signaling requests from a joined participant.
#[derive(Debug, Clone)]
pub enum SessionRequest {
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    PauseProducer {
        producer_id: String,
    },
    ResumeProducer {
        producer_id: String,
    },
    CloseTransport {
        transport_id: String,
    },
    Chat {
        message: String,
        message_type: ChatMessageType,
    },
    ShareVitals {
        vitals: VitalSigns,
    },
    ToggleMedia {
        kind: MediaKind,
        enabled: bool,
    },
    StartRecording,
    StopRecording,
    EndSession,
}

impl SessionRequest {
    /// Label used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            SessionRequest::CreateTransport { .. } => "create-transport",
            SessionRequest::ConnectTransport { .. } => "connect-transport",
            SessionRequest::Produce { .. } => "produce",
            SessionRequest::Consume { .. } => "consume",
            SessionRequest::ResumeConsumer { .. } => "resume-consumer",
            SessionRequest::PauseProducer { .. } => "pause-producer",
            SessionRequest::ResumeProducer { .. } => "resume-producer",
            SessionRequest::CloseTransport { .. } => "close-transport",
            SessionRequest::Chat { .. } => "chat-message",
            SessionRequest::ShareVitals { .. } => "share-vitals",
            SessionRequest::ToggleMedia { .. } => "toggle-media",
            SessionRequest::StartRecording => "start-recording",
            SessionRequest::StopRecording => "stop-recording",
            SessionRequest::EndSession => "end-session",
        }
    }
}

/// Result of an engine call, delivered back to the session that started it.
#[derive(Debug)]
pub enum EngineCompletion {
    TransportCreated {
        connection_id: String,
        direction: TransportDirection,
        result: Result<Arc<dyn MediaTransport>, EngineError>,
    },
    TransportConnected {
        connection_id: String,
        transport_id: String,
        result: Result<(), EngineError>,
    },
    Produced {
        connection_id: String,
        transport_id: String,
        result: Result<Arc<dyn MediaProducer>, EngineError>,
    },
    Consumed {
        connection_id: String,
        transport_id: String,
        result: Result<Arc<dyn MediaConsumer>, EngineError>,
    },
    ConsumerResumed {
        connection_id: String,
        consumer_id: String,
        result: Result<(), EngineError>,
    },
    ProducerPauseChanged {
        connection_id: String,
        producer_id: String,
        paused: bool,
        result: Result<(), EngineError>,
    },
}

impl EngineCompletion {
    #[must_use]
    pub fn is_success(&self) -> bool {
        match self {
            EngineCompletion::TransportCreated { result, .. } => result.is_ok(),
            EngineCompletion::Produced { result, .. } => result.is_ok(),
            EngineCompletion::Consumed { result, .. } => result.is_ok(),
            EngineCompletion::TransportConnected { result, .. }
            | EngineCompletion::ConsumerResumed { result, .. }
            | EngineCompletion::ProducerPauseChanged { result, .. } => result.is_ok(),
        }
    }

    /// Closes any resource the call created. Used when nobody is left to
    /// take ownership of it.
    pub fn discard(self) {
        match self {
            EngineCompletion::TransportCreated {
                result: Ok(transport),
                ..
            } => transport.close(),
            EngineCompletion::Produced {
                result: Ok(producer),
                ..
            } => producer.close(),
            EngineCompletion::Consumed {
                result: Ok(consumer),
                ..
            } => consumer.close(),
            _ => {}
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// A participant sent `end-session`.
    Requested { by: String },
    LastParticipantLeft,
    DurationExceeded,
    /// Nobody joined again within the grace period.
    Abandoned,
    Shutdown,
}

impl EndReason {
    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EndReason::Requested { .. } => "requested",
            EndReason::LastParticipantLeft => "last_participant_left",
            EndReason::DurationExceeded => "max_duration",
            EndReason::Abandoned => "abandoned",
            EndReason::Shutdown => "shutdown",
        }
    }
}

/// Session snapshot for operators. Carries no names or PHI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub room_id: String,
    pub appointment_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Milliseconds since creation.
    pub elapsed_ms: u64,
    pub router_id: Option<String>,
    pub worker_id: Option<String>,
    pub participants: Vec<ParticipantInfo>,
}

/// Registry status (for health checks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub session_count: usize,
    pub pending_creations: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
