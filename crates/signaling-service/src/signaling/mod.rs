//! Client-facing signaling.
//!
//! - [`protocol`] - JSON wire events
//! - [`gateway`] - per-connection state machine
//! - [`websocket`] - axum upgrade handler and socket loop

pub mod gateway;
pub mod protocol;
pub mod websocket;

pub use gateway::{GatewayContext, GatewayPhase, SignalingGateway};
pub use websocket::{signaling_router, SignalingState};
