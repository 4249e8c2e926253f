use std::env;
use std::time::Duration;

/// Reference default for the connection handshake deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Reference default for action dispatch and data acknowledgement deadlines.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Observation window used to coalesce rapid layout changes into one
/// `resize` message.
pub const DEFAULT_RESIZE_DEBOUNCE: Duration = Duration::from_millis(25);

/// Host-side configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// How long `load` waits for the applet's initial `register` message.
    pub connect_timeout: Duration,
    /// How long `dispatch_action` and `set_data` wait for their reply.
    pub response_timeout: Duration,
    /// Guest-side resize coalescing window.
    pub resize_debounce: Duration,
}

impl HostConfig {
    /// Load configuration from `ALCOVE_*` environment variables, falling back
    /// to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: env_duration_ms("ALCOVE_CONNECT_TIMEOUT_MS")
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            response_timeout: env_duration_ms("ALCOVE_RESPONSE_TIMEOUT_MS")
                .unwrap_or(DEFAULT_RESPONSE_TIMEOUT),
            resize_debounce: env_duration_ms("ALCOVE_RESIZE_DEBOUNCE_MS")
                .unwrap_or(DEFAULT_RESIZE_DEBOUNCE),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            resize_debounce: DEFAULT_RESIZE_DEBOUNCE,
        }
    }
}

fn env_duration_ms(var: &str) -> Option<Duration> {
    let raw = env::var(var).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => None,
    }
}
