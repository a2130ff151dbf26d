use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Which well-known session server a client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    #[default]
    Dev,
    Prod,
}

impl ServerMode {
    pub fn server_address(self) -> &'static str {
        match self {
            ServerMode::Dev => "127.0.0.1:5000",
            ServerMode::Prod => "collab.local:5000",
        }
    }
}

/// Settings for one [`NetworkClient`](crate::client::NetworkClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity stamped on every message this client sends.
    pub user: String,
    /// `host:port` of the session server.
    pub server: String,
    pub connect_timeout: Duration,
    /// Upper bound on waiting for the server to acknowledge the handshake.
    pub handshake_timeout: Duration,
    /// Cadence at which blocking calls poll for a response.
    pub poll_interval: Duration,
}

impl ClientConfig {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn for_mode(user: impl Into<String>, mode: ServerMode) -> Self {
        Self::new(user, mode.server_address())
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_mode_is_the_default() {
        let config = ClientConfig::for_mode("alice", ServerMode::default());
        assert_eq!(config.server, "127.0.0.1:5000");
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn builders_override_timeouts() {
        let config = ClientConfig::new("alice", "127.0.0.1:9")
            .with_poll_interval(Duration::from_millis(10))
            .with_connect_timeout(Duration::from_millis(250))
            .with_handshake_timeout(Duration::from_millis(500));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.handshake_timeout, Duration::from_millis(500));
    }
}
