//! Side-channel records: chat messages and vital-sign snapshots.
//!
//! Both are immutable once built. They are persisted first and broadcast
//! only after the write succeeds.

use crate::errors::SignalingError;
use chrono::{DateTime, Utc};
use common::types::ChatMessageType;
use serde::{Deserialize, Serialize};

/// Longest accepted chat message, in characters.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: ChatMessageType,
}

impl ChatMessage {
    /// Builds a new message with a fresh `msg_<uuid>` id.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` for blank or oversized text.
    pub fn new(
        session_id: &str,
        sender_id: &str,
        sender_name: &str,
        message: String,
        message_type: ChatMessageType,
    ) -> Result<Self, SignalingError> {
        if message.trim().is_empty() {
            return Err(SignalingError::InvalidMessage(
                "Chat message cannot be empty".to_string(),
            ));
        }
        if message.chars().count() > MAX_CHAT_MESSAGE_CHARS {
            return Err(SignalingError::InvalidMessage(format!(
                "Chat message exceeds {MAX_CHAT_MESSAGE_CHARS} characters"
            )));
        }

        Ok(Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: sender_name.to_string(),
            message,
            timestamp: Utc::now(),
            message_type,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: f64,
    pub diastolic: f64,
}

/// Readings shared by a patient. Every field is optional but at least one
/// must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSigns {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blood_pressure: Option<BloodPressure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oxygen_saturation: Option<f64>,
}

impl VitalSigns {
    /// Rejects empty payloads and physiologically impossible values.
    ///
    /// # Errors
    ///
    /// `InvalidMessage` naming the offending field.
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.heart_rate.is_none()
            && self.blood_pressure.is_none()
            && self.temperature.is_none()
            && self.oxygen_saturation.is_none()
        {
            return Err(SignalingError::InvalidMessage(
                "Vital signs must include at least one reading".to_string(),
            ));
        }

        check_range("heartRate", self.heart_rate, 1.0, 300.0)?;
        if let Some(bp) = self.blood_pressure {
            check_range("bloodPressure.systolic", Some(bp.systolic), 1.0, 300.0)?;
            check_range("bloodPressure.diastolic", Some(bp.diastolic), 1.0, 250.0)?;
        }
        check_range("temperature", self.temperature, 25.0, 45.0)?;
        check_range("oxygenSaturation", self.oxygen_saturation, 0.0, 100.0)?;
        Ok(())
    }
}

fn check_range(field: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), SignalingError> {
    match value {
        Some(v) if !v.is_finite() || v < min || v > max => Err(SignalingError::InvalidMessage(
            format!("{field} must be between {min} and {max}"),
        )),
        _ => Ok(()),
    }
}

/// A vitals snapshot as persisted and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VitalSignsRecord {
    pub session_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub vitals: VitalSigns,
    pub timestamp: DateTime<Utc>,
}

impl VitalSignsRecord {
    #[must_use]
    pub fn new(session_id: &str, patient_id: &str, patient_name: &str, vitals: VitalSigns) -> Self {
        Self {
            session_id: session_id.to_string(),
            patient_id: patient_id.to_string(),
            patient_name: patient_name.to_string(),
            vitals,
            timestamp: Utc::now(),
        }
    }
}
