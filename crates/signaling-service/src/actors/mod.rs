//! Actor model for the signaling service.
//!
//! ```text
//! SessionRegistryActor (singleton per instance)
//! └── supervises N SessionActors
//!     └── SessionActor (one per live room)
//!         ├── owns session state, participants and the router lease
//!         ├── runs the room's SideChannelRouter lane
//!         └── sends to the ConnectionActor of each participant
//!             └── ConnectionActor (one per WebSocket)
//! ```
//!
//! - **One writer per room**: every mutation of a room goes through its session mailbox
//! - **No engine calls inside a handler**: the actor spawns them and commits on completion
//! - **CancellationToken propagation**: registry token → session tokens → participant tokens
//! - **Backlog sampling**: each actor records its queue length per message (see [`metrics`])
//!
//! # Modules
//!
//! - [`registry`] - `SessionRegistryActor` singleton that supervises sessions
//! - [`session`] - `SessionActor` per live room
//! - [`connection`] - `ConnectionActor` per signaling socket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Live counts and mailbox backlog

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, MailboxMonitor};
pub use registry::{SessionRegistryActor, SessionRegistryHandle};
pub use session::{SessionActor, SessionActorHandle};

use crate::audit::AuditEmitter;
use crate::media::types::WebRtcTransportOptions;
use crate::media::worker_pool::WorkerPool;
use crate::storage::SessionStore;
use std::sync::Arc;
use std::time::Duration;

/// Per-session timing and limits.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// How long a transport may stay unconnected, or a consumer unresumed,
    /// and how long an empty session waits for someone to rejoin.
    pub negotiation_grace_period: Duration,
    pub sweep_interval: Duration,
    /// `None` disables the limit.
    pub max_session_duration: Option<Duration>,
    pub max_participants: usize,
    pub transport_options: WebRtcTransportOptions,
}

/// Collaborators every session actor needs.
#[derive(Clone)]
pub struct SessionServices {
    pub pool: Arc<WorkerPool>,
    pub store: Arc<dyn SessionStore>,
    pub audit: AuditEmitter,
    pub settings: SessionSettings,
    pub metrics: Arc<ActorMetrics>,
}
