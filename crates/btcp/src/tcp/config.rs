//! Configuration types for sockets and servers.

use std::time::Duration;

/// Default host dialed by [`connect`](super::connect).
pub const DEFAULT_CONNECT_HOST: &str = "127.0.0.1";

/// Default address a server binds to.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Socket-level options.
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Maximum size of a single transport read, and so of a delivered chunk.
    pub read_buffer_size: usize,
    /// Queued-but-unsent byte count at which `write` starts returning `false`.
    pub high_water_mark: usize,
    /// Connection timeout. `None` waits for the OS to give up.
    pub connect_timeout: Option<Duration>,
    /// Keep the write side open after the peer half-closes.
    ///
    /// When `false` (the default) the socket ends its own write side once the
    /// peer's end-of-stream has been delivered and queued writes are flushed.
    pub allow_half_open: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            no_delay: false,
            read_buffer_size: 64 * 1024,
            high_water_mark: 16 * 1024,
            connect_timeout: Some(Duration::from_secs(30)),
            allow_half_open: false,
        }
    }
}

impl SocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Set the read buffer size. Values below one byte are raised to one.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Set the write backpressure threshold.
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Disable the connection timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect_timeout = None;
        self
    }

    /// Keep the write side open after the peer half-closes.
    pub fn allow_half_open(mut self, enabled: bool) -> Self {
        self.allow_half_open = enabled;
        self
    }
}

/// Configuration for a server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The address to bind to when [`listen`](super::Server::listen) is given
    /// only a port.
    pub bind_address: String,
    /// Pending-connection backlog passed to `listen(2)`.
    pub backlog: u32,
    /// Socket-level options for accepted connections.
    pub socket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            backlog: 511,
            socket: SocketConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new server configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default bind address.
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Set the connection backlog size.
    pub fn backlog(mut self, size: u32) -> Self {
        self.backlog = size;
        self
    }

    /// Set socket options for accepted connections.
    pub fn socket_config(mut self, config: SocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY for accepted connections.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Keep accepted connections writable after their peer half-closes.
    pub fn allow_half_open(mut self, enabled: bool) -> Self {
        self.socket.allow_half_open = enabled;
        self
    }
}

/// Format a `host:port` endpoint, bracketing bare IPv6 literals.
pub(crate) fn endpoint(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_formats_ipv6() {
        assert_eq!(endpoint("127.0.0.1", 80), "127.0.0.1:80");
        assert_eq!(endpoint("::1", 80), "[::1]:80");
        assert_eq!(endpoint("[::1]", 80), "[::1]:80");
        assert_eq!(endpoint("localhost", 12000), "localhost:12000");
    }
}
