//! Client configuration and credentials.

use std::time::Duration;

/// Configuration for a collaboration client.
///
/// The timing constants are fixed protocol parameters; tests override them
/// with struct-update syntax to keep runs fast.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// WebSocket URL of the collaboration server.
    pub server_url: String,
    /// Interval between outbound heartbeat pings while connected.
    pub heartbeat_interval: Duration,
    /// Deadline for dial + authenticated handshake per attempt.
    pub handshake_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Consecutive failed attempts after which the connection enters the
    /// terminal `Error` status and stops retrying.
    pub max_reconnect_attempts: u32,
    /// How long a collaborator stays in the typing set without a fresh
    /// typing signal.
    pub typing_ttl: Duration,
    /// Quiet period before a burst of local edits is flushed as one message.
    pub edit_debounce: Duration,
    /// Outbound frame queue capacity.
    pub outgoing_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
            typing_ttl: Duration::from_secs(3),
            edit_debounce: Duration::from_millis(500),
            outgoing_capacity: 256,
        }
    }
}

/// Caller-supplied authentication token for the transport handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.typing_ttl, Duration::from_secs(3));
        assert_eq!(config.edit_debounce, Duration::from_millis(500));
    }

    #[test]
    fn test_config_override() {
        let config = CollabConfig {
            server_url: "ws://10.0.0.1:8080".to_string(),
            max_reconnect_attempts: 2,
            ..CollabConfig::default()
        };
        assert_eq!(config.server_url, "ws://10.0.0.1:8080");
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.outgoing_capacity, 256);
    }
}
