//! Runtime configuration for the orchestration engine.
//!
//! Configuration is an explicit value constructed once by the top-level
//! entry point and passed down to the components that need it. There are no
//! lazily-constructed global clients; every collaborator is injected at
//! construction time.

/// Environment variable for the notification flush group size.
const ENV_NOTIFICATION_BATCH_SIZE: &str = "STRATUS_NOTIFICATION_BATCH_SIZE";
/// Environment variable for the inline payload size threshold (bytes).
const ENV_INLINE_PAYLOAD_LIMIT: &str = "STRATUS_INLINE_PAYLOAD_LIMIT";
/// Environment variable toggling the timeseries sink.
const ENV_TIMESERIES_ENABLED: &str = "STRATUS_TIMESERIES_ENABLED";
/// Environment variable for the payload blob prefix.
const ENV_PAYLOAD_PREFIX: &str = "STRATUS_PAYLOAD_PREFIX";

/// Orchestration engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Notification events are flushed in groups of this size.
    pub notification_batch_size: usize,
    /// Documents larger than this (serialized bytes) are offloaded to blob
    /// storage and replaced by a `{"reference": ...}` envelope.
    pub inline_payload_limit: usize,
    /// Whether state transitions are recorded to the timeseries sink.
    pub timeseries_enabled: bool,
    /// Blob path prefix under which dispatch inputs are persisted.
    pub payload_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            notification_batch_size: 10,
            // Leaves headroom below typical engine input limits (256 KiB).
            inline_payload_limit: 240 * 1024,
            timeseries_enabled: false,
            payload_prefix: "payloads".to_string(),
        }
    }
}

impl Config {
    /// Builds a configuration from environment variables, falling back to
    /// defaults for anything unset or unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            notification_batch_size: env_parse(
                ENV_NOTIFICATION_BATCH_SIZE,
                defaults.notification_batch_size,
            ),
            inline_payload_limit: env_parse(ENV_INLINE_PAYLOAD_LIMIT, defaults.inline_payload_limit),
            timeseries_enabled: env_parse(ENV_TIMESERIES_ENABLED, defaults.timeseries_enabled),
            payload_prefix: std::env::var(ENV_PAYLOAD_PREFIX)
                .unwrap_or(defaults.payload_prefix),
        }
    }
}

/// Parses an environment variable, returning the default when unset or
/// malformed (a malformed value is logged, not fatal).
fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}
