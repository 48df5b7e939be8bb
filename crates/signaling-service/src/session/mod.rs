//! Session domain: lifecycle, participants and side-channel records.
//!
//! These types are owned by a single session actor and hold no locks.

pub mod model;
pub mod participants;
pub mod records;

pub use model::{Session, SessionAuthorization};
pub use participants::{authorize_join, Participant, ParticipantInfo, ParticipantManager};
pub use records::{ChatMessage, VitalSigns, VitalSignsRecord};
