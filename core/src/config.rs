//! Session configuration

use crate::protocol::PROTOCOL_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors for session configuration validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Peer name cannot be empty")]
    EmptyPeerName,

    #[error("Start attempts must be at least 1")]
    ZeroStartAttempts,

    #[error("Receive buffer too small: {0} bytes")]
    ReceiveBufferTooSmall(usize),
}

/// Tunables for session establishment and the data path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Advertised name of the peer to discover and connect
    pub peer_name: String,
    /// How many times `start` runs the full establishment sequence (default 5)
    pub max_start_attempts: u32,
    /// Delay between establishment attempts (default 5 s)
    pub retry_delay: Duration,
    /// Settle time between stopping a prior discovery and starting a new one
    /// (default 500 ms)
    pub discovery_settle_delay: Duration,
    /// Bound on one Discover transaction; `None` waits indefinitely on the
    /// transport's own callbacks (default 30 s)
    pub discover_timeout: Option<Duration>,
    /// Bound on one Connect transaction; `None` waits indefinitely
    /// (default 30 s)
    pub connect_timeout: Option<Duration>,
    /// How long a graceful stop waits for the peer's DisconnectAck before
    /// forcing teardown (default 3 s)
    pub disconnect_ack_wait: Duration,
    /// Size of the per-adapter receive buffer (default 64 KiB)
    pub receive_buffer_size: usize,
    /// Acknowledge every delivered packet over the control channel (default true)
    pub auto_ack: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_name: String::new(),
            max_start_attempts: 5,
            retry_delay: Duration::from_secs(5),
            discovery_settle_delay: Duration::from_millis(500),
            discover_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Some(Duration::from_secs(30)),
            disconnect_ack_wait: Duration::from_secs(3),
            receive_buffer_size: 64 * 1024,
            auto_ack: true,
        }
    }
}

impl SessionConfig {
    /// Create a configuration targeting the named peer
    pub fn new(peer_name: impl Into<String>) -> Self {
        Self {
            peer_name: peer_name.into(),
            ..Self::default()
        }
    }

    /// Set the establishment retry bound
    pub fn with_max_start_attempts(mut self, attempts: u32) -> Self {
        self.max_start_attempts = attempts;
        self
    }

    /// Set the delay between establishment attempts
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the discovery settle delay
    pub fn with_discovery_settle_delay(mut self, delay: Duration) -> Self {
        self.discovery_settle_delay = delay;
        self
    }

    /// Bound (or unbound, with `None`) each Discover transaction
    pub fn with_discover_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.discover_timeout = timeout;
        self
    }

    /// Bound (or unbound, with `None`) each Connect transaction
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the bounded wait for DisconnectAck during graceful stop
    pub fn with_disconnect_ack_wait(mut self, wait: Duration) -> Self {
        self.disconnect_ack_wait = wait;
        self
    }

    /// Toggle the post-delivery acknowledgement
    pub fn with_auto_ack(mut self, enabled: bool) -> Self {
        self.auto_ack = enabled;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_name.is_empty() {
            return Err(ConfigError::EmptyPeerName);
        }
        if self.max_start_attempts == 0 {
            return Err(ConfigError::ZeroStartAttempts);
        }
        if self.receive_buffer_size < PROTOCOL_HEADER_SIZE {
            return Err(ConfigError::ReceiveBufferTooSmall(self.receive_buffer_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_bounds() {
        let config = SessionConfig::new("peer-b");
        assert_eq!(config.max_start_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(5));
        assert_eq!(config.discovery_settle_delay, Duration::from_millis(500));
        assert!(config.auto_ack);
    }

    #[test]
    fn test_builder_chain() {
        let config = SessionConfig::new("peer-b")
            .with_max_start_attempts(2)
            .with_retry_delay(Duration::from_millis(10))
            .with_discover_timeout(None)
            .with_auto_ack(false);
        assert_eq!(config.max_start_attempts, 2);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert!(config.discover_timeout.is_none());
        assert!(!config.auto_ack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_peer_name() {
        let config = SessionConfig::default();
        assert_eq!(config.validate().unwrap_err(), ConfigError::EmptyPeerName);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let config = SessionConfig::new("peer-b").with_max_start_attempts(0);
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::ZeroStartAttempts
        );
    }

    #[test]
    fn test_validate_rejects_tiny_receive_buffer() {
        let mut config = SessionConfig::new("peer-b");
        config.receive_buffer_size = 4;
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::ReceiveBufferTooSmall(4)
        ));
    }
}
