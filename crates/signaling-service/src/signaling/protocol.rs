//! Signaling wire protocol.
//!
//! Every frame is a JSON text message shaped
//! `{"event": "<kebab-case name>", "data": {...}}` with camelCase payload
//! fields. Client and server use the same event name for chat
//! (`chat-message`); everything else is directional.

use crate::errors::SignalingError;
use crate::media::types::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters, SctpParameters,
};
use crate::session::records::{ChatMessage, VitalSigns, VitalSignsRecord};
use chrono::{DateTime, Utc};
use common::types::{ChatMessageType, MediaKind, ParticipantRole, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Client -> server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionPayload {
    pub session_id: String,
    pub participant_id: String,
    pub role: ParticipantRole,
    pub name: String,
    #[serde(default)]
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportPayload {
    pub session_id: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportPayload {
    pub session_id: String,
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducePayload {
    pub session_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumePayload {
    pub session_id: String,
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub session_id: String,
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub session_id: String,
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRef {
    pub session_id: String,
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub session_id: String,
    pub message: String,
    #[serde(rename = "type", default)]
    pub message_type: ChatMessageType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareVitalsPayload {
    pub session_id: String,
    pub vitals: VitalSigns,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleMediaPayload {
    pub session_id: String,
    #[serde(rename = "type")]
    pub media_type: MediaKind,
    pub enabled: bool,
}

/// Payload of events that only name the session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinSession(JoinSessionPayload),
    CreateTransport(CreateTransportPayload),
    ConnectTransport(ConnectTransportPayload),
    Produce(ProducePayload),
    Consume(ConsumePayload),
    ResumeConsumer(ConsumerRef),
    PauseProducer(ProducerRef),
    ResumeProducer(ProducerRef),
    CloseTransport(TransportRef),
    ChatMessage(ChatMessagePayload),
    ShareVitals(ShareVitalsPayload),
    ToggleMedia(ToggleMediaPayload),
    StartRecording(SessionRef),
    StopRecording(SessionRef),
    EndSession(SessionRef),
}

impl ClientEvent {
    /// Parses one text frame.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` for malformed JSON, unknown events or missing fields.
    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::InvalidMessage(e.to_string()))
    }

    /// Wire name, also used as the `event` metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinSession(_) => "join-session",
            ClientEvent::CreateTransport(_) => "create-transport",
            ClientEvent::ConnectTransport(_) => "connect-transport",
            ClientEvent::Produce(_) => "produce",
            ClientEvent::Consume(_) => "consume",
            ClientEvent::ResumeConsumer(_) => "resume-consumer",
            ClientEvent::PauseProducer(_) => "pause-producer",
            ClientEvent::ResumeProducer(_) => "resume-producer",
            ClientEvent::CloseTransport(_) => "close-transport",
            ClientEvent::ChatMessage(_) => "chat-message",
            ClientEvent::ShareVitals(_) => "share-vitals",
            ClientEvent::ToggleMedia(_) => "toggle-media",
            ClientEvent::StartRecording(_) => "start-recording",
            ClientEvent::StopRecording(_) => "stop-recording",
            ClientEvent::EndSession(_) => "end-session",
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            ClientEvent::JoinSession(p) => &p.session_id,
            ClientEvent::CreateTransport(p) => &p.session_id,
            ClientEvent::ConnectTransport(p) => &p.session_id,
            ClientEvent::Produce(p) => &p.session_id,
            ClientEvent::Consume(p) => &p.session_id,
            ClientEvent::ResumeConsumer(p) => &p.session_id,
            ClientEvent::PauseProducer(p) | ClientEvent::ResumeProducer(p) => &p.session_id,
            ClientEvent::CloseTransport(p) => &p.session_id,
            ClientEvent::ChatMessage(p) => &p.session_id,
            ClientEvent::ShareVitals(p) => &p.session_id,
            ClientEvent::ToggleMedia(p) => &p.session_id,
            ClientEvent::StartRecording(p)
            | ClientEvent::StopRecording(p)
            | ClientEvent::EndSession(p) => &p.session_id,
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoinedPayload {
    pub participant_id: String,
    pub role: ParticipantRole,
    pub name: String,
    pub device_info: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedPayload {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
    pub sctp_parameters: Option<SctpParameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportIdPayload {
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerIdPayload {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducerPayload {
    pub producer_id: String,
    pub participant_id: String,
    pub participant_name: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumedPayload {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: String,
    pub producer_paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerIdPayload {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosedPayload {
    pub consumer_id: String,
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStateChangedPayload {
    pub producer_id: String,
    pub participant_id: String,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalsSharedPayload {
    pub patient_id: String,
    pub patient_name: String,
    pub vitals: VitalSigns,
    pub timestamp: DateTime<Utc>,
}

impl From<VitalSignsRecord> for VitalsSharedPayload {
    fn from(record: VitalSignsRecord) -> Self {
        Self {
            patient_id: record.patient_id,
            patient_name: record.patient_name,
            vitals: record.vitals,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChangedPayload {
    pub participant_id: String,
    #[serde(rename = "type")]
    pub media_type: MediaKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatePayload {
    pub session_id: String,
    pub recording: bool,
    pub changed_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndedPayload {
    pub session_id: String,
    pub end_time: DateTime<Utc>,
    /// Milliseconds.
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDisconnectedPayload {
    pub participant_id: String,
    pub participant_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: i32,
}

impl From<&SignalingError> for ErrorPayload {
    fn from(err: &SignalingError) -> Self {
        Self {
            message: err.client_message(),
            code: err.error_code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    RouterCapabilities(RtpCapabilities),
    ParticipantJoined(ParticipantJoinedPayload),
    TransportCreated(TransportCreatedPayload),
    TransportConnected(TransportIdPayload),
    TransportClosed(TransportIdPayload),
    Produced(ProducerIdPayload),
    NewProducer(NewProducerPayload),
    Consumed(ConsumedPayload),
    ConsumerResumed(ConsumerIdPayload),
    ConsumerClosed(ConsumerClosedPayload),
    ProducerPaused(ProducerIdPayload),
    ProducerResumed(ProducerIdPayload),
    ProducerStateChanged(ProducerStateChangedPayload),
    ChatMessage(ChatMessage),
    VitalsShared(VitalsSharedPayload),
    ParticipantMediaChanged(MediaChangedPayload),
    RecordingStateChanged(RecordingStatePayload),
    SessionEnded(SessionEndedPayload),
    ParticipantDisconnected(ParticipantDisconnectedPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    #[must_use]
    pub fn error(err: &SignalingError) -> Self {
        ServerEvent::Error(err.into())
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::RouterCapabilities(_) => "router-capabilities",
            ServerEvent::ParticipantJoined(_) => "participant-joined",
            ServerEvent::TransportCreated(_) => "transport-created",
            ServerEvent::TransportConnected(_) => "transport-connected",
            ServerEvent::TransportClosed(_) => "transport-closed",
            ServerEvent::Produced(_) => "produced",
            ServerEvent::NewProducer(_) => "new-producer",
            ServerEvent::Consumed(_) => "consumed",
            ServerEvent::ConsumerResumed(_) => "consumer-resumed",
            ServerEvent::ConsumerClosed(_) => "consumer-closed",
            ServerEvent::ProducerPaused(_) => "producer-paused",
            ServerEvent::ProducerResumed(_) => "producer-resumed",
            ServerEvent::ProducerStateChanged(_) => "producer-state-changed",
            ServerEvent::ChatMessage(_) => "chat-message",
            ServerEvent::VitalsShared(_) => "vitals-shared",
            ServerEvent::ParticipantMediaChanged(_) => "participant-media-changed",
            ServerEvent::RecordingStateChanged(_) => "recording-state-changed",
            ServerEvent::SessionEnded(_) => "session-ended",
            ServerEvent::ParticipantDisconnected(_) => "participant-disconnected",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Serializes to a text frame.
    ///
    /// # Errors
    ///
    /// `Internal` if a payload cannot be encoded.
    pub fn to_text(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self)
            .map_err(|e| SignalingError::Internal(format!("event serialization failed: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_session() {
        let event = ClientEvent::parse(
            r#"{"event":"join-session","data":{"sessionId":"room-1","participantId":"doctor-1","role":"doctor","name":"Dr. Osei","deviceInfo":{"browser":"firefox"}}}"#,
        )
        .unwrap();

        assert_eq!(event.name(), "join-session");
        assert_eq!(event.session_id(), "room-1");
        let ClientEvent::JoinSession(join) = event else {
            panic!("expected join-session");
        };
        assert_eq!(join.role, ParticipantRole::Doctor);
        assert_eq!(join.device_info, Some(json!({"browser": "firefox"})));
    }

    #[test]
    fn test_chat_type_defaults_to_text() {
        let event = ClientEvent::parse(
            r#"{"event":"chat-message","data":{"sessionId":"room-1","message":"hello"}}"#,
        )
        .unwrap();
        let ClientEvent::ChatMessage(chat) = event else {
            panic!("expected chat-message");
        };
        assert_eq!(chat.message_type, ChatMessageType::Text);
    }

    #[test]
    fn test_toggle_media_uses_type_field() {
        let event = ClientEvent::parse(
            r#"{"event":"toggle-media","data":{"sessionId":"room-1","type":"video","enabled":false}}"#,
        )
        .unwrap();
        let ClientEvent::ToggleMedia(toggle) = event else {
            panic!("expected toggle-media");
        };
        assert_eq!(toggle.media_type, MediaKind::Video);
        assert!(!toggle.enabled);
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        for frame in [
            "not json",
            r#"{"event":"teleport","data":{"sessionId":"room-1"}}"#,
            r#"{"event":"join-session","data":{"sessionId":"room-1"}}"#,
            r#"{"event":"join-session","data":{"sessionId":"room-1","participantId":"x","role":"nurse","name":"n"}}"#,
        ] {
            let err = ClientEvent::parse(frame).unwrap_err();
            assert_eq!(err.error_code(), 1, "frame: {frame}");
        }
    }

    #[test]
    fn test_server_event_envelope() {
        let event = ServerEvent::TransportConnected(TransportIdPayload {
            transport_id: "t-1".to_string(),
        });
        let value: Value = serde_json::from_str(&event.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"event": "transport-connected", "data": {"transportId": "t-1"}})
        );
    }

    #[test]
    fn test_consumed_payload_shape() {
        let event = ServerEvent::Consumed(ConsumedPayload {
            consumer_id: "c-1".to_string(),
            producer_id: "p-1".to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: RtpParameters::default(),
            consumer_type: "simple".to_string(),
            producer_paused: false,
        });
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event"], "consumed");
        assert_eq!(value["data"]["type"], "simple");
        assert_eq!(value["data"]["producerPaused"], false);
        assert_eq!(value["data"]["kind"], "audio");
    }

    #[test]
    fn test_error_event_carries_code() {
        let err =
            SignalingError::PermissionDenied("Only patients can share vital signs".to_string());
        let value = serde_json::to_value(ServerEvent::error(&err)).unwrap();

        assert_eq!(value["event"], "error");
        assert_eq!(value["data"]["message"], "Only patients can share vital signs");
        assert_eq!(value["data"]["code"], 3);
    }

    #[test]
    fn test_router_capabilities_payload_is_the_capabilities() {
        let event = ServerEvent::RouterCapabilities(RtpCapabilities::default());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"]["codecs"], json!([]));
        assert_eq!(event.name(), "router-capabilities");
    }
}
