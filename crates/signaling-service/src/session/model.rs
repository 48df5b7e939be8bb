//! Session lifecycle state.
//!
//! ```text
//! waiting --(2nd participant)--> connected <--(start/stop)--> recording
//!    \                              |                            |
//!     `--------------------------> ended <-----------------------'
//! ```
//!
//! Only `waiting -> connected` happens automatically. Everything else is
//! an explicit request, and `ended` is terminal.

use crate::errors::SignalingError;
use crate::storage::SessionTimestamps;
use chrono::{DateTime, Utc};
use common::types::SessionStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Who may join a room, as recorded on the appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuthorization {
    pub appointment_id: String,
    pub patient_id: String,
    pub doctor_id: String,
}

#[derive(Debug)]
pub struct Session {
    room_id: String,
    authorization: SessionAuthorization,
    status: SessionStatus,
    created_at: DateTime<Utc>,
    started: Instant,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    ended: Option<Instant>,
}

impl Session {
    #[must_use]
    pub fn new(room_id: String, authorization: SessionAuthorization) -> Self {
        Self {
            room_id,
            authorization,
            status: SessionStatus::Waiting,
            created_at: Utc::now(),
            started: Instant::now(),
            connected_at: None,
            ended_at: None,
            ended: None,
        }
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn authorization(&self) -> &SessionAuthorization {
        &self.authorization
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.status.is_terminal()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    #[must_use]
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Time since creation, frozen once the session ends.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.ended
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started)
    }

    /// Flips `waiting -> connected` once two participants are present.
    ///
    /// Returns true only on the call that performed the transition.
    pub fn transition_if_ready(&mut self, participant_count: usize) -> bool {
        if self.status != SessionStatus::Waiting || participant_count < 2 {
            return false;
        }
        self.status = SessionStatus::Connected;
        self.connected_at = Some(Utc::now());
        true
    }

    pub fn start_recording(&mut self) -> Result<(), SignalingError> {
        match self.status {
            SessionStatus::Connected => {
                self.status = SessionStatus::Recording;
                Ok(())
            }
            SessionStatus::Recording => Err(SignalingError::InvalidState(
                "Recording is already in progress".to_string(),
            )),
            SessionStatus::Waiting => Err(SignalingError::InvalidState(
                "Recording needs both participants connected".to_string(),
            )),
            SessionStatus::Ended => Err(SignalingError::SessionEnded),
        }
    }

    pub fn stop_recording(&mut self) -> Result<(), SignalingError> {
        match self.status {
            SessionStatus::Recording => {
                self.status = SessionStatus::Connected;
                Ok(())
            }
            SessionStatus::Ended => Err(SignalingError::SessionEnded),
            SessionStatus::Waiting | SessionStatus::Connected => Err(
                SignalingError::InvalidState("No recording in progress".to_string()),
            ),
        }
    }

    /// Marks the session ended. Returns false if it already was.
    pub fn end(&mut self) -> bool {
        if self.is_ended() {
            return false;
        }
        self.status = SessionStatus::Ended;
        self.ended_at = Some(Utc::now());
        self.ended = Some(Instant::now());
        true
    }

    #[must_use]
    pub fn timestamps(&self) -> SessionTimestamps {
        SessionTimestamps {
            actual_start: self.connected_at,
            actual_end: self.ended_at,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "room-1".to_string(),
            SessionAuthorization {
                appointment_id: "appt-1".to_string(),
                patient_id: "patient-1".to_string(),
                doctor_id: "doctor-1".to_string(),
            },
        )
    }

    #[test]
    fn test_new_session_is_waiting() {
        let session = session();
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(session.connected_at().is_none());
        assert!(session.ended_at().is_none());
    }

    #[test]
    fn test_transition_fires_once_at_two_participants() {
        let mut session = session();

        assert!(!session.transition_if_ready(1));
        assert_eq!(session.status(), SessionStatus::Waiting);

        assert!(session.transition_if_ready(2));
        assert_eq!(session.status(), SessionStatus::Connected);
        let connected_at = session.connected_at();
        assert!(connected_at.is_some());

        // Re-entry does not re-fire
        assert!(!session.transition_if_ready(2));
        assert!(!session.transition_if_ready(3));
        assert_eq!(session.connected_at(), connected_at);
    }

    #[test]
    fn test_recording_transitions() {
        let mut session = session();
        assert!(matches!(
            session.start_recording(),
            Err(SignalingError::InvalidState(_))
        ));

        session.transition_if_ready(2);
        session.start_recording().unwrap();
        assert_eq!(session.status(), SessionStatus::Recording);
        assert!(session.start_recording().is_err());

        // No automatic transition while recording
        assert!(!session.transition_if_ready(3));

        session.stop_recording().unwrap();
        assert_eq!(session.status(), SessionStatus::Connected);
        assert!(session.stop_recording().is_err());
    }

    #[test]
    fn test_end_is_terminal_and_idempotent() {
        let mut session = session();
        session.transition_if_ready(2);

        assert!(session.end());
        assert!(session.is_ended());
        let ended_at = session.ended_at();
        assert!(ended_at.is_some());

        assert!(!session.end());
        assert_eq!(session.ended_at(), ended_at);
        assert!(matches!(
            session.start_recording(),
            Err(SignalingError::SessionEnded)
        ));
        assert!(!session.transition_if_ready(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_freezes_at_end() {
        let mut session = session();
        tokio::time::advance(Duration::from_secs(90)).await;
        session.end();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(session.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn test_timestamps_follow_lifecycle() {
        let mut session = session();
        assert_eq!(session.timestamps(), SessionTimestamps::default());

        session.transition_if_ready(2);
        session.end();
        let timestamps = session.timestamps();
        assert!(timestamps.actual_start.is_some());
        assert!(timestamps.actual_end.is_some());
    }
}
