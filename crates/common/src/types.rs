//! Wire-level enums for telehealth sessions.
//!
//! Every enum serializes as the lowercase string the signaling clients send
//! and expect, so these types can be used directly inside event payloads.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a participant claims when joining a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Doctor,
    Patient,
    Observer,
}

impl ParticipantRole {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Doctor => "doctor",
            ParticipantRole::Patient => "patient",
            ParticipantRole::Observer => "observer",
        }
    }
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media carried by a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// Returns true when a codec MIME type (e.g. `audio/opus`) belongs to this kind.
    #[must_use]
    pub fn matches_mime_type(&self, mime_type: &str) -> bool {
        mime_type
            .split('/')
            .next()
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(self.as_str()))
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// Category of a chat message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMessageType {
    #[default]
    Text,
    System,
    Vitals,
    Prescription,
}

/// Lifecycle status of a session.
///
/// `Waiting -> Connected` is automatic (second participant joins).
/// `Recording` and `Ended` are entered only on explicit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Connected,
    Recording,
    Ended,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "connected",
            SessionStatus::Recording => "recording",
            SessionStatus::Ended => "ended",
        }
    }

    /// Value written to the appointment record by the storage layer.
    ///
    /// Appointment records call a connected session "active".
    #[must_use]
    pub const fn storage_value(&self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Connected => "active",
            SessionStatus::Recording => "recording",
            SessionStatus::Ended => "ended",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ParticipantRole::Doctor).unwrap(),
            "\"doctor\""
        );
        let role: ParticipantRole = serde_json::from_str("\"observer\"").unwrap();
        assert_eq!(role, ParticipantRole::Observer);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let result: Result<ParticipantRole, _> = serde_json::from_str("\"nurse\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_media_kind_matches_mime_type() {
        assert!(MediaKind::Audio.matches_mime_type("audio/opus"));
        assert!(MediaKind::Video.matches_mime_type("video/VP8"));
        assert!(MediaKind::Video.matches_mime_type("VIDEO/H264"));
        assert!(!MediaKind::Audio.matches_mime_type("video/VP8"));
        assert!(!MediaKind::Audio.matches_mime_type(""));
    }

    #[test]
    fn test_chat_type_defaults_to_text() {
        assert_eq!(ChatMessageType::default(), ChatMessageType::Text);
    }

    #[test]
    fn test_session_status_storage_value() {
        assert_eq!(SessionStatus::Connected.storage_value(), "active");
        assert_eq!(SessionStatus::Ended.storage_value(), "ended");
        assert_eq!(SessionStatus::Connected.to_string(), "connected");
        assert!(SessionStatus::Ended.is_terminal());
        assert!(!SessionStatus::Recording.is_terminal());
    }
}
