//! Signaling service error types.
//!
//! Error types map to signaling error codes for client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::EngineError;
use crate::storage::StorageError;
use thiserror::Error;

/// Signaling service error type.
///
/// Maps to signaling error codes:
/// - `InvalidMessage`: `INVALID_MESSAGE` (1)
/// - `Unauthorized`: `UNAUTHORIZED` (2)
/// - `PermissionDenied`: `FORBIDDEN` (3)
/// - `*NotFound`, `SessionEnded`: `NOT_FOUND` (4)
/// - `Conflict`, `InvalidState`: `CONFLICT` (5)
/// - Engine, Storage, Internal, Config, `WorkerFatal`: `INTERNAL_ERROR` (6)
/// - `*CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
/// - `CapabilityMismatch`: `INCOMPATIBLE` (8)
///
/// `Clone` so one failed session creation can be reported to every waiter.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    /// Client event could not be parsed or had invalid fields.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Requester is not a participant of the appointment.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Requester's role does not allow the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The session finished between lookup and use.
    #[error("Session has ended")]
    SessionEnded,

    /// Conflict error (e.g., connection already joined).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Client RTP capabilities cannot receive the requested producer.
    #[error("Capability mismatch: {0}")]
    CapabilityMismatch(String),

    /// Recoverable media engine failure.
    #[error("Media engine error: {0}")]
    Engine(EngineError),

    /// A media worker died. The process must restart.
    #[error("Media worker failed: {0}")]
    WorkerFatal(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Session is at its participant cap.
    #[error("Session at capacity: {0}")]
    SessionCapacityExceeded(String),

    /// Instance is at its session cap.
    #[error("Service at capacity")]
    CapacityExceeded,

    /// Instance is shutting down.
    #[error("Service is draining")]
    Draining,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalingError {
    /// Returns the signaling error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            SignalingError::InvalidMessage(_) => 1,
            SignalingError::Unauthorized(_) => 2,
            SignalingError::PermissionDenied(_) => 3,
            SignalingError::SessionNotFound(_)
            | SignalingError::ParticipantNotFound(_)
            | SignalingError::TransportNotFound(_)
            | SignalingError::ProducerNotFound(_)
            | SignalingError::ConsumerNotFound(_)
            | SignalingError::SessionEnded => 4,
            SignalingError::Conflict(_) | SignalingError::InvalidState(_) => 5,
            SignalingError::Engine(_)
            | SignalingError::WorkerFatal(_)
            | SignalingError::Storage(_)
            | SignalingError::Config(_)
            | SignalingError::Internal(_) => 6,
            SignalingError::SessionCapacityExceeded(_)
            | SignalingError::CapacityExceeded
            | SignalingError::Draining => 7,
            SignalingError::CapabilityMismatch(_) => 8,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Storage(_)
            | SignalingError::Config(_)
            | SignalingError::Internal(_)
            | SignalingError::WorkerFatal(_) => "An internal error occurred".to_string(),
            SignalingError::Engine(_) => "Media negotiation failed".to_string(),
            SignalingError::SessionNotFound(_) | SignalingError::SessionEnded => {
                "Session not found".to_string()
            }
            SignalingError::ParticipantNotFound(_) => "Participant not found".to_string(),
            SignalingError::TransportNotFound(_) => "Transport not found".to_string(),
            SignalingError::ProducerNotFound(_) => "Producer not found".to_string(),
            SignalingError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SignalingError::SessionCapacityExceeded(_) => "Session is full".to_string(),
            SignalingError::CapacityExceeded => {
                "Server is at capacity, please try again".to_string()
            }
            SignalingError::Draining => "Server is shutting down, please reconnect".to_string(),
            SignalingError::CapabilityMismatch(_) => "Cannot consume".to_string(),
            SignalingError::InvalidMessage(msg)
            | SignalingError::Unauthorized(msg)
            | SignalingError::PermissionDenied(msg)
            | SignalingError::Conflict(msg)
            | SignalingError::InvalidState(msg) => msg.clone(),
        }
    }

    /// Short label for the `error_type` metric dimension.
    #[must_use]
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::InvalidMessage(_) => "invalid_message",
            SignalingError::Unauthorized(_) => "unauthorized",
            SignalingError::PermissionDenied(_) => "permission_denied",
            SignalingError::SessionNotFound(_) | SignalingError::SessionEnded => {
                "session_not_found"
            }
            SignalingError::ParticipantNotFound(_)
            | SignalingError::TransportNotFound(_)
            | SignalingError::ProducerNotFound(_)
            | SignalingError::ConsumerNotFound(_) => "not_found",
            SignalingError::Conflict(_) => "conflict",
            SignalingError::InvalidState(_) => "invalid_state",
            SignalingError::CapabilityMismatch(_) => "capability_mismatch",
            SignalingError::Engine(_) => "engine",
            SignalingError::WorkerFatal(_) => "worker_fatal",
            SignalingError::Storage(_) => "storage",
            SignalingError::SessionCapacityExceeded(_)
            | SignalingError::CapacityExceeded
            | SignalingError::Draining => "capacity",
            SignalingError::Config(_) | SignalingError::Internal(_) => "internal",
        }
    }
}

impl From<EngineError> for SignalingError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDied(reason) => SignalingError::WorkerFatal(reason),
            other => SignalingError::Engine(other),
        }
    }
}

impl From<StorageError> for SignalingError {
    fn from(err: StorageError) -> Self {
        SignalingError::Storage(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            SignalingError::InvalidMessage("bad json".to_string()).error_code(),
            1
        );
        assert_eq!(
            SignalingError::Unauthorized("not on appointment".to_string()).error_code(),
            2
        );
        assert_eq!(
            SignalingError::PermissionDenied("patients only".to_string()).error_code(),
            3
        );

        // Not found -> 4
        assert_eq!(
            SignalingError::SessionNotFound("room-1".to_string()).error_code(),
            4
        );
        assert_eq!(
            SignalingError::TransportNotFound("t-1".to_string()).error_code(),
            4
        );
        assert_eq!(SignalingError::SessionEnded.error_code(), 4);

        assert_eq!(
            SignalingError::Conflict("already joined".to_string()).error_code(),
            5
        );
        assert_eq!(
            SignalingError::InvalidState("not connected".to_string()).error_code(),
            5
        );

        // Internal -> 6
        assert_eq!(
            SignalingError::Engine(EngineError::TransportClosed).error_code(),
            6
        );
        assert_eq!(
            SignalingError::Storage("timeout".to_string()).error_code(),
            6
        );
        assert_eq!(
            SignalingError::WorkerFatal("killed".to_string()).error_code(),
            6
        );

        // Capacity -> 7
        assert_eq!(SignalingError::CapacityExceeded.error_code(), 7);
        assert_eq!(SignalingError::Draining.error_code(), 7);
        assert_eq!(
            SignalingError::SessionCapacityExceeded("max 4".to_string()).error_code(),
            7
        );

        assert_eq!(
            SignalingError::CapabilityMismatch("no vp8".to_string()).error_code(),
            8
        );
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let storage_err =
            SignalingError::Storage("connection refused at 10.0.0.12:6379".to_string());
        assert!(!storage_err.client_message().contains("10.0.0"));
        assert_eq!(storage_err.client_message(), "An internal error occurred");

        let engine_err =
            SignalingError::Engine(EngineError::Request("worker pipe broken".to_string()));
        assert!(!engine_err.client_message().contains("pipe"));
    }

    #[test]
    fn test_worker_death_converts_to_fatal() {
        let err: SignalingError = EngineError::WorkerDied("SIGKILL".to_string()).into();
        assert!(matches!(err, SignalingError::WorkerFatal(ref r) if r == "SIGKILL"));

        let err: SignalingError = EngineError::RouterClosed.into();
        assert!(matches!(err, SignalingError::Engine(EngineError::RouterClosed)));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: SignalingError = StorageError::Unavailable("down".to_string()).into();
        assert!(matches!(err, SignalingError::Storage(_)));
        assert_eq!(err.error_type_label(), "storage");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", SignalingError::SessionNotFound("room-9".to_string())),
            "Session not found: room-9"
        );
        assert_eq!(
            format!("{}", SignalingError::Engine(EngineError::RouterClosed)),
            "Media engine error: router closed"
        );
    }
}
