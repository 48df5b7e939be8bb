//! # Signaling Test Utilities
//!
//! Shared test utilities for the telehealth signaling service.
//!
//! ## Modules
//!
//! - `mock_store` - In-memory directory, session store and audit sink
//! - `fixtures` - Appointments, client frames and WebRTC parameters
//! - `harness` - Full signaling stack driven through gateways, no sockets
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let appointment = TestAppointment::new("room-1");
//!     let harness = TestHarness::start(MockStore::new().with_appointment(&appointment)).await;
//!
//!     let mut doctor = harness.connect("conn-doctor");
//!     doctor.send(appointment.join_doctor()).await;
//!     doctor.expect("router-capabilities").await;
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_store;

pub use fixtures::*;
pub use harness::*;
pub use mock_store::*;
