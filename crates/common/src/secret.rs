//! Secret types for keeping credentials out of logs.
//!
//! Re-exports [`secrecy`] so every crate in the workspace wraps sensitive
//! configuration the same way. `SecretString` redacts itself in `Debug`
//! output and zeroizes on drop; reading the value requires an explicit
//! `expose_secret()` call, which makes every access site greppable.
//!
//! # Example
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct StorageSettings {
//!     redis_url: SecretString,
//! }
//!
//! let settings = StorageSettings {
//!     redis_url: SecretString::from("redis://:hunter2@cache:6379"),
//! };
//!
//! assert!(!format!("{settings:?}").contains("hunter2"));
//! assert!(settings.redis_url.expose_secret().starts_with("redis://"));
//! ```
//!
//! Use `SecretString` for connection URLs that may embed passwords, API keys
//! for storage backends, and anything else that must never reach a log line.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:pw@localhost:6379");
        let debug_str = format!("{secret:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("pw@localhost"));
    }

    #[test]
    fn test_expose_secret_returns_inner_value() {
        let secret = SecretString::from("redis://localhost:6379");
        assert_eq!(secret.expose_secret(), "redis://localhost:6379");
    }

    #[test]
    fn test_deserialize_keeps_value_hidden() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct StorageCredentials {
            host: String,
            password: SecretString,
        }

        let json = r#"{"host": "cache", "password": "my-secret-value"}"#;
        let creds: StorageCredentials = serde_json::from_str(json).expect("deserialize");

        assert_eq!(creds.password.expose_secret(), "my-secret-value");

        let debug = format!("{creds:?}");
        assert!(debug.contains("cache"));
        assert!(!debug.contains("my-secret-value"));
    }
}
