//! Common types shared across the telehealth signaling crates.

#![warn(clippy::pedantic)]

/// Module for wire-level enums shared by the service and its test utilities
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
