#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MESSAGE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_STALE_AFTER_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;
const DEFAULT_PENDING_CAPACITY: usize = 1000;
const DEFAULT_RECEIVED_CAPACITY: usize = 4096;

/// Configuration for a managed connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint the default transport factory dials
    pub url: String,
    /// Interval between heartbeat probes while connected
    pub heartbeat_interval: Duration,
    /// Maximum time to wait for a single transport operation
    pub message_timeout: Duration,
    /// Age after which an unconfirmed message becomes eligible for retransmission
    pub stale_after: Duration,
    /// Whether large outbound payloads are gzip-compressed
    pub enable_compression: bool,
    /// Serialized size above which compression kicks in
    pub compression_threshold: usize,
    /// Capacity of the pending (not yet transmitted) queue; oldest dropped on overflow
    pub pending_capacity: usize,
    /// Capacity of the inbound de-duplication set; oldest ids evicted first
    pub received_capacity: usize,
    /// Reconnection strategy configuration
    pub reconnect: ReconnectConfig,
}

impl ConnectionConfig {
    /// Configuration for the given endpoint with all defaults.
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT_DURATION,
            stale_after: DEFAULT_STALE_AFTER_DURATION,
            enable_compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            received_capacity: DEFAULT_RECEIVED_CAPACITY,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// Automatic retry stops after this; only a network-recovery notification
    /// or an explicit `connect()` restarts the cycle.
    pub max_attempts: u32,
    /// Initial backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // No jitter: callers rely on the exact min(base * 2^n, max) sequence
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}
