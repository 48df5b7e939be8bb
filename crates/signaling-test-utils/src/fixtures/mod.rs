//! Pre-configured test data for signaling tests.
//!
//! Provides:
//! - Appointments (room, doctor, patient)
//! - Client frames as they arrive on the wire
//! - WebRTC parameters the in-process engine accepts

use serde_json::{json, Value};
use signaling_service::session::SessionAuthorization;
use uuid::Uuid;

/// A consultation room with its two authorized participants.
#[derive(Debug, Clone)]
pub struct TestAppointment {
    pub room_id: String,
    pub appointment_id: String,
    pub doctor_id: String,
    pub patient_id: String,
}

impl TestAppointment {
    #[must_use]
    pub fn new(room_id: impl Into<String>) -> Self {
        let room_id = room_id.into();
        Self {
            appointment_id: format!("appt-{room_id}"),
            doctor_id: format!("doctor-{room_id}"),
            patient_id: format!("patient-{room_id}"),
            room_id,
        }
    }

    /// Create an appointment with a random room id.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("room-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn authorization(&self) -> SessionAuthorization {
        SessionAuthorization {
            appointment_id: self.appointment_id.clone(),
            patient_id: self.patient_id.clone(),
            doctor_id: self.doctor_id.clone(),
        }
    }

    #[must_use]
    pub fn join_doctor(&self) -> Value {
        frames::join(&self.room_id, &self.doctor_id, "doctor", "Dr. Test")
    }

    #[must_use]
    pub fn join_patient(&self) -> Value {
        frames::join(&self.room_id, &self.patient_id, "patient", "Test Patient")
    }
}

/// DTLS parameters a client would send on `connect-transport`.
#[must_use]
pub fn client_dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF:01:23:45" }]
    })
}

/// Opus send parameters.
#[must_use]
pub fn opus_rtp_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2
        }],
        "headerExtensions": [],
        "encodings": [{ "ssrc": 1111 }]
    })
}

/// VP8 send parameters.
#[must_use]
pub fn vp8_rtp_parameters() -> Value {
    json!({
        "mid": "1",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 96,
            "clockRate": 90000
        }],
        "headerExtensions": [],
        "encodings": [{ "ssrc": 2222 }]
    })
}

/// Receive capabilities covering every codec the routers offer.
#[must_use]
pub fn full_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 },
            { "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }
        ],
        "headerExtensions": []
    })
}

/// Receive capabilities without any video codec.
#[must_use]
pub fn audio_only_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 }
        ],
        "headerExtensions": []
    })
}

/// Client frames, shaped `{"event": ..., "data": {...}}`.
pub mod frames {
    use serde_json::{json, Value};

    #[must_use]
    pub fn join(room_id: &str, participant_id: &str, role: &str, name: &str) -> Value {
        json!({
            "event": "join-session",
            "data": {
                "sessionId": room_id,
                "participantId": participant_id,
                "role": role,
                "name": name,
                "deviceInfo": { "browser": "test" }
            }
        })
    }

    #[must_use]
    pub fn create_transport(room_id: &str, direction: &str) -> Value {
        json!({
            "event": "create-transport",
            "data": { "sessionId": room_id, "direction": direction }
        })
    }

    #[must_use]
    pub fn connect_transport(room_id: &str, transport_id: &str) -> Value {
        json!({
            "event": "connect-transport",
            "data": {
                "sessionId": room_id,
                "transportId": transport_id,
                "dtlsParameters": super::client_dtls_parameters()
            }
        })
    }

    #[must_use]
    pub fn produce(room_id: &str, transport_id: &str, kind: &str, rtp_parameters: Value) -> Value {
        json!({
            "event": "produce",
            "data": {
                "sessionId": room_id,
                "transportId": transport_id,
                "kind": kind,
                "rtpParameters": rtp_parameters
            }
        })
    }

    #[must_use]
    pub fn consume(
        room_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Value {
        json!({
            "event": "consume",
            "data": {
                "sessionId": room_id,
                "transportId": transport_id,
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities
            }
        })
    }

    #[must_use]
    pub fn resume_consumer(room_id: &str, consumer_id: &str) -> Value {
        json!({
            "event": "resume-consumer",
            "data": { "sessionId": room_id, "consumerId": consumer_id }
        })
    }

    #[must_use]
    pub fn pause_producer(room_id: &str, producer_id: &str) -> Value {
        json!({
            "event": "pause-producer",
            "data": { "sessionId": room_id, "producerId": producer_id }
        })
    }

    #[must_use]
    pub fn resume_producer(room_id: &str, producer_id: &str) -> Value {
        json!({
            "event": "resume-producer",
            "data": { "sessionId": room_id, "producerId": producer_id }
        })
    }

    #[must_use]
    pub fn close_transport(room_id: &str, transport_id: &str) -> Value {
        json!({
            "event": "close-transport",
            "data": { "sessionId": room_id, "transportId": transport_id }
        })
    }

    #[must_use]
    pub fn chat(room_id: &str, message: &str) -> Value {
        json!({
            "event": "chat-message",
            "data": { "sessionId": room_id, "message": message }
        })
    }

    #[must_use]
    pub fn share_vitals(room_id: &str, vitals: Value) -> Value {
        json!({
            "event": "share-vitals",
            "data": { "sessionId": room_id, "vitals": vitals }
        })
    }

    #[must_use]
    pub fn toggle_media(room_id: &str, kind: &str, enabled: bool) -> Value {
        json!({
            "event": "toggle-media",
            "data": { "sessionId": room_id, "type": kind, "enabled": enabled }
        })
    }

    #[must_use]
    pub fn end_session(room_id: &str) -> Value {
        json!({ "event": "end-session", "data": { "sessionId": room_id } })
    }

    #[must_use]
    pub fn start_recording(room_id: &str) -> Value {
        json!({ "event": "start-recording", "data": { "sessionId": room_id } })
    }
}
