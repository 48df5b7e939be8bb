//! Telehealth Signaling Service Library
//!
//! Signaling and media orchestration for one-to-one telemedicine
//! consultations:
//!
//! - WebSocket signaling for joining a consultation room and negotiating
//!   WebRTC transports, producers and consumers
//! - A pool of media workers hosting one router per live session
//! - Chat and vital-sign sharing, persisted before they are broadcast
//! - An audit trail for every PHI-touching action
//!
//! # Architecture
//!
//! ```text
//! SessionRegistryActor (singleton per instance)
//! ├── supervises N SessionActors
//! │   └── SessionActor (one per live room)
//! │       ├── owns the Session, its ParticipantManager and router lease
//! │       ├── SideChannelRouter lane (chat, vitals, status writes)
//! │       └── delivers to N ConnectionActors
//! │           └── ConnectionActor (one per WebSocket)
//! └── WorkerPool (round-robin router placement)
//! ```
//!
//! Each socket runs a [`signaling::SignalingGateway`] that turns client
//! events into requests on the room's session actor.
//!
//! # Modules
//!
//! - [`actors`] - Registry, session and connection actors
//! - [`audit`] - Non-blocking audit emitter
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client error codes
//! - [`media`] - Media engine traits, worker pool and in-process engine
//! - [`observability`] - Metrics, health and session statistics
//! - [`session`] - Session lifecycle, participants and records
//! - [`side_channel`] - Ordered chat and vitals persistence
//! - [`signaling`] - Wire protocol, gateway and WebSocket transport
//! - [`storage`] - Storage collaborator traits and the Redis store

pub mod actors;
pub mod audit;
pub mod config;
pub mod errors;
pub mod media;
pub mod observability;
pub mod session;
pub mod side_channel;
pub mod signaling;
pub mod storage;
