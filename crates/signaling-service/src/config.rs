//! Signaling service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::actors::SessionSettings;
use crate::audit::AuditSettings;
use crate::media::types::WebRtcTransportOptions;
use crate::media::worker_pool::WorkerPoolSettings;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:4443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default IP the media workers listen on.
pub const DEFAULT_LISTEN_IP: &str = "127.0.0.1";

/// Default first RTC port of the first worker.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;

/// Default number of RTC ports reserved per worker.
pub const DEFAULT_RTC_PORTS_PER_WORKER: u16 = 100;

pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;
pub const DEFAULT_MIN_OUTGOING_BITRATE: u32 = 600_000;
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;
pub const DEFAULT_MAX_SCTP_MESSAGE_SIZE: u32 = 262_144;

/// Default maximum concurrent sessions per instance.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Default maximum participants in one session (doctor, patient, observers).
pub const DEFAULT_MAX_PARTICIPANTS_PER_SESSION: usize = 4;

/// Default maximum session duration in seconds (2 hours). Zero disables the limit.
pub const DEFAULT_MAX_SESSION_DURATION_SECONDS: u64 = 7200;

/// Default time a transport may stay unconnected, or a consumer unresumed,
/// before it is reclaimed.
pub const DEFAULT_NEGOTIATION_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default interval between stale-resource sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5;

pub const DEFAULT_AUDIT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_AUDIT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_AUDIT_RETRY_BASE_MS: u64 = 200;

/// Default instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sig";

/// Signaling service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (appointments, chat, vitals, audit).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Unique identifier for this instance.
    pub instance_id: String,

    /// WebSocket signaling bind address (default: "0.0.0.0:4443").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Origin accepted on the signaling upgrade. `None` accepts any origin.
    pub allowed_origin: Option<String>,

    /// Number of media workers (default: number of CPUs).
    pub media_workers: usize,

    pub rtc_min_port: u16,
    pub rtc_ports_per_worker: u16,
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,

    pub initial_outgoing_bitrate: u32,
    pub min_outgoing_bitrate: u32,
    pub max_incoming_bitrate: u32,
    pub max_sctp_message_size: u32,

    /// Maximum concurrent sessions this instance accepts.
    pub max_sessions: usize,

    /// Maximum participants in a single session.
    pub max_participants_per_session: usize,

    /// Maximum session duration in seconds. Zero disables the limit.
    pub max_session_duration_seconds: u64,

    pub negotiation_grace_period_seconds: u64,
    pub sweep_interval_seconds: u64,

    pub audit_queue_capacity: usize,
    pub audit_max_attempts: u32,
    pub audit_retry_base_ms: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("instance_id", &self.instance_id)
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("allowed_origin", &self.allowed_origin)
            .field("media_workers", &self.media_workers)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_ports_per_worker", &self.rtc_ports_per_worker)
            .field("listen_ip", &self.listen_ip)
            .field("announced_ip", &self.announced_ip)
            .field("initial_outgoing_bitrate", &self.initial_outgoing_bitrate)
            .field("min_outgoing_bitrate", &self.min_outgoing_bitrate)
            .field("max_incoming_bitrate", &self.max_incoming_bitrate)
            .field("max_sctp_message_size", &self.max_sctp_message_size)
            .field("max_sessions", &self.max_sessions)
            .field(
                "max_participants_per_session",
                &self.max_participants_per_session,
            )
            .field(
                "max_session_duration_seconds",
                &self.max_session_duration_seconds,
            )
            .field(
                "negotiation_grace_period_seconds",
                &self.negotiation_grace_period_seconds,
            )
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("audit_queue_capacity", &self.audit_queue_capacity)
            .field("audit_max_attempts", &self.audit_max_attempts)
            .field("audit_retry_base_ms", &self.audit_retry_base_ms)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let signaling_bind_address = vars
            .get("SIG_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SIG_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let allowed_origin = vars
            .get("SIG_ALLOWED_ORIGIN")
            .filter(|s| !s.is_empty())
            .cloned();

        let media_workers = vars
            .get("SIG_MEDIA_WORKERS")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
            });
        if media_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SIG_MEDIA_WORKERS must be at least 1".to_string(),
            ));
        }

        // Parse media port ranges
        let rtc_min_port = vars
            .get("SIG_RTC_MIN_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_MIN_PORT);

        let rtc_ports_per_worker: u16 = vars
            .get("SIG_RTC_PORTS_PER_WORKER")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_PORTS_PER_WORKER);

        let total_ports = u64::from(rtc_ports_per_worker) * media_workers as u64;
        if rtc_ports_per_worker == 0 || u64::from(rtc_min_port) + total_ports > u64::from(u16::MAX)
        {
            return Err(ConfigError::InvalidValue(format!(
                "RTC port range does not fit: {media_workers} workers x {rtc_ports_per_worker} ports from {rtc_min_port}"
            )));
        }

        let listen_ip_raw = vars
            .get("SIG_LISTEN_IP")
            .map_or(DEFAULT_LISTEN_IP, String::as_str);
        let listen_ip: IpAddr = listen_ip_raw.parse().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "SIG_LISTEN_IP is not an IP address: {listen_ip_raw}"
            ))
        })?;

        let announced_ip = vars
            .get("SIG_ANNOUNCED_IP")
            .filter(|s| !s.is_empty())
            .cloned();

        // Parse transport bitrate limits
        let initial_outgoing_bitrate = vars
            .get("SIG_INITIAL_OUTGOING_BITRATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_INITIAL_OUTGOING_BITRATE);

        let min_outgoing_bitrate = vars
            .get("SIG_MIN_OUTGOING_BITRATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MIN_OUTGOING_BITRATE);

        let max_incoming_bitrate = vars
            .get("SIG_MAX_INCOMING_BITRATE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_INCOMING_BITRATE);

        let max_sctp_message_size = vars
            .get("SIG_MAX_SCTP_MESSAGE_SIZE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SCTP_MESSAGE_SIZE);

        // Parse capacity limits
        let max_sessions = vars
            .get("SIG_MAX_SESSIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SESSIONS);

        let max_participants_per_session = vars
            .get("SIG_MAX_PARTICIPANTS_PER_SESSION")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_PARTICIPANTS_PER_SESSION);
        if max_participants_per_session < 2 {
            return Err(ConfigError::InvalidValue(
                "SIG_MAX_PARTICIPANTS_PER_SESSION must allow a doctor and a patient".to_string(),
            ));
        }

        let max_session_duration_seconds = vars
            .get("SIG_MAX_SESSION_DURATION_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_SESSION_DURATION_SECONDS);

        let negotiation_grace_period_seconds = vars
            .get("SIG_NEGOTIATION_GRACE_PERIOD_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_NEGOTIATION_GRACE_PERIOD_SECONDS);

        let sweep_interval_seconds = vars
            .get("SIG_SWEEP_INTERVAL_SECONDS")
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS);

        // Parse audit delivery parameters
        let audit_queue_capacity = vars
            .get("SIG_AUDIT_QUEUE_CAPACITY")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_AUDIT_QUEUE_CAPACITY);

        let audit_max_attempts = vars
            .get("SIG_AUDIT_MAX_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_AUDIT_MAX_ATTEMPTS);

        let audit_retry_base_ms = vars
            .get("SIG_AUDIT_RETRY_BASE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_AUDIT_RETRY_BASE_MS);

        // Generate instance ID
        let instance_id = vars.get("SIG_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            instance_id,
            signaling_bind_address,
            health_bind_address,
            allowed_origin,
            media_workers,
            rtc_min_port,
            rtc_ports_per_worker,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            min_outgoing_bitrate,
            max_incoming_bitrate,
            max_sctp_message_size,
            max_sessions,
            max_participants_per_session,
            max_session_duration_seconds,
            negotiation_grace_period_seconds,
            sweep_interval_seconds,
            audit_queue_capacity,
            audit_max_attempts,
            audit_retry_base_ms,
        })
    }

    /// Options used for every WebRTC transport this instance creates.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
            min_outgoing_bitrate: self.min_outgoing_bitrate,
            max_incoming_bitrate: self.max_incoming_bitrate,
            max_sctp_message_size: self.max_sctp_message_size,
        }
    }

    #[must_use]
    pub fn worker_pool_settings(&self) -> WorkerPoolSettings {
        WorkerPoolSettings {
            num_workers: self.media_workers,
            rtc_min_port: self.rtc_min_port,
            rtc_ports_per_worker: self.rtc_ports_per_worker,
        }
    }

    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            negotiation_grace_period: Duration::from_secs(self.negotiation_grace_period_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            max_session_duration: (self.max_session_duration_seconds > 0)
                .then(|| Duration::from_secs(self.max_session_duration_seconds)),
            max_participants: self.max_participants_per_session,
            transport_options: self.transport_options(),
        }
    }

    #[must_use]
    pub fn audit_settings(&self) -> AuditSettings {
        AuditSettings {
            queue_capacity: self.audit_queue_capacity,
            max_attempts: self.audit_max_attempts,
            retry_base: Duration::from_millis(self.audit_retry_base_ms),
        }
    }
}
