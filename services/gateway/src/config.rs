use std::env;
use std::time::Duration;

/// Every tunable knob of the connection fabric, loaded from environment
/// variables with defaults matching the original system's (§6).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,

    // Heartbeat (§4.6).
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub max_missed_pongs: u32,
    pub zombie_detect: Duration,
    pub zombie_grace: Duration,

    pub stale_closing_threshold: Duration,
    pub max_close_retries: u32,

    // Connection limits.
    pub max_connections_per_user: usize,
    pub max_total_connections: usize,
    pub idle_timeout: Duration,

    // Shutdown (§4.13).
    pub drain_timeout: Duration,
    pub force_close_timeout: Duration,
    pub notify_clients: bool,

    // Queueing (§4.7).
    pub queue_capacity_per_user: usize,
    pub priority_threshold: i32,
    pub message_flush_timeout: Duration,

    // Validation (§4.10).
    pub max_message_bytes: usize,
    pub max_text_chars: usize,
    pub strict_validation: bool,

    // Compression / chunking (§4.11).
    pub chunk_size_bytes: usize,
    pub compression_preference: String,
    /// How long a partial chunked transfer may sit incomplete before it is
    /// discarded rather than waiting forever for the remaining chunks.
    pub chunk_reassembly_timeout: Duration,

    // Rate limiting.
    pub rate_limit_burst: u32,
    pub rate_limit_per_second: u32,

    // Reconnection.
    pub reconnection_window: Duration,
    pub reconnection_max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),

            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed_pongs: 2,
            zombie_detect: Duration::from_secs(60),
            zombie_grace: Duration::from_secs(30),

            stale_closing_threshold: Duration::from_secs(60),
            max_close_retries: 3,

            max_connections_per_user: 5,
            max_total_connections: 1000,
            idle_timeout: Duration::from_secs(300),

            drain_timeout: Duration::from_secs(30),
            force_close_timeout: Duration::from_secs(60),
            notify_clients: true,

            queue_capacity_per_user: 1000,
            priority_threshold: 5,
            message_flush_timeout: Duration::from_secs(5),

            max_message_bytes: 1_048_576,
            max_text_chars: 10_000,
            strict_validation: false,

            chunk_size_bytes: 65_536,
            compression_preference: "none".to_owned(),
            chunk_reassembly_timeout: Duration::from_secs(120),

            rate_limit_burst: 20,
            rate_limit_per_second: 10,

            reconnection_window: Duration::from_secs(300),
            reconnection_max_attempts: 5,
        }
    }
}

impl GatewayConfig {
    /// Overrides defaults with whichever `GATEWAY_*` environment variables
    /// are set, following the teacher's `env::var(...).unwrap_or_else(...)`
    /// convention. Unparseable values fall back to the default rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),

            heartbeat_interval: env_secs("GATEWAY_HEARTBEAT_INTERVAL_S", defaults.heartbeat_interval),
            pong_timeout: env_secs("GATEWAY_PONG_TIMEOUT_S", defaults.pong_timeout),
            max_missed_pongs: env_u32("GATEWAY_MAX_MISSED_PONGS", defaults.max_missed_pongs),
            zombie_detect: env_secs("GATEWAY_ZOMBIE_DETECT_S", defaults.zombie_detect),
            zombie_grace: env_secs("GATEWAY_ZOMBIE_GRACE_S", defaults.zombie_grace),

            stale_closing_threshold: env_secs(
                "GATEWAY_STALE_CLOSING_THRESHOLD_S",
                defaults.stale_closing_threshold,
            ),
            max_close_retries: env_u32("GATEWAY_MAX_CLOSE_RETRIES", defaults.max_close_retries),

            max_connections_per_user: env_usize(
                "GATEWAY_MAX_CONNECTIONS_PER_USER",
                defaults.max_connections_per_user,
            ),
            max_total_connections: env_usize(
                "GATEWAY_MAX_TOTAL_CONNECTIONS",
                defaults.max_total_connections,
            ),
            idle_timeout: env_secs("GATEWAY_IDLE_TIMEOUT_S", defaults.idle_timeout),

            drain_timeout: env_secs("GATEWAY_DRAIN_TIMEOUT_S", defaults.drain_timeout),
            force_close_timeout: env_secs(
                "GATEWAY_FORCE_CLOSE_TIMEOUT_S",
                defaults.force_close_timeout,
            ),
            notify_clients: env_bool("GATEWAY_NOTIFY_CLIENTS", defaults.notify_clients),

            queue_capacity_per_user: env_usize(
                "GATEWAY_QUEUE_CAPACITY_PER_USER",
                defaults.queue_capacity_per_user,
            ),
            priority_threshold: env::var("GATEWAY_PRIORITY_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.priority_threshold),
            message_flush_timeout: env_secs(
                "GATEWAY_MESSAGE_FLUSH_TIMEOUT_S",
                defaults.message_flush_timeout,
            ),

            max_message_bytes: env_usize("GATEWAY_MAX_MESSAGE_BYTES", defaults.max_message_bytes),
            max_text_chars: env_usize("GATEWAY_MAX_TEXT_CHARS", defaults.max_text_chars),
            strict_validation: env_bool("GATEWAY_STRICT_VALIDATION", defaults.strict_validation),

            chunk_size_bytes: env_usize("GATEWAY_CHUNK_SIZE_BYTES", defaults.chunk_size_bytes),
            compression_preference: env::var("GATEWAY_COMPRESSION_PREFERENCE")
                .unwrap_or(defaults.compression_preference),
            chunk_reassembly_timeout: env_secs(
                "GATEWAY_CHUNK_REASSEMBLY_TIMEOUT_S",
                defaults.chunk_reassembly_timeout,
            ),

            rate_limit_burst: env_u32("GATEWAY_RATE_LIMIT_BURST", defaults.rate_limit_burst),
            rate_limit_per_second: env_u32(
                "GATEWAY_RATE_LIMIT_PER_SECOND",
                defaults.rate_limit_per_second,
            ),

            reconnection_window: env_secs("GATEWAY_RECONNECTION_WINDOW_S", defaults.reconnection_window),
            reconnection_max_attempts: env_u32(
                "GATEWAY_RECONNECTION_MAX_ATTEMPTS",
                defaults.reconnection_max_attempts,
            ),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
