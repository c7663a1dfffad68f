// ABOUTME: Tunables for the acceptor and its connections, built with a fluent builder
// ABOUTME: Nothing here is mutable at runtime; changing a setting means rebuilding a config

use std::net::SocketAddr;

/// Static configuration for a running gateway. Constructed once at
/// startup and shared read-only (`Arc<ServerConfig>`) by every connection
/// task.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum simultaneous connections from a single remote IP. `0`
    /// disables the cap.
    pub max_client_cnxns: usize,
    /// Largest payload a single frame may carry, in bytes.
    pub max_frame_size: u32,
    /// A connection's outbound queue is drained and coalesced into one
    /// `write_all` as long as the staged buffer stays under this size;
    /// once it's reached, whatever is staged gets flushed rather than
    /// growing further.
    pub write_coalesce_size: usize,
}

impl ServerConfig {
    pub fn builder(bind_addr: SocketAddr) -> ServerConfigBuilder {
        ServerConfigBuilder::new(bind_addr)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfigBuilder::new("0.0.0.0:2181".parse().unwrap()).build()
    }
}

/// Fluent builder mirroring the construction style of the rest of the
/// gateway's configuration surface.
pub struct ServerConfigBuilder {
    bind_addr: SocketAddr,
    max_client_cnxns: usize,
    max_frame_size: u32,
    write_coalesce_size: usize,
}

impl ServerConfigBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        ServerConfigBuilder {
            bind_addr,
            max_client_cnxns: 10,
            max_frame_size: 1024 * 1024,
            write_coalesce_size: 64 * 1024,
        }
    }

    pub fn with_max_client_cnxns(mut self, n: usize) -> Self {
        self.max_client_cnxns = n;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: u32) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_write_coalesce_size(mut self, bytes: usize) -> Self {
        self.write_coalesce_size = bytes;
        self
    }

    pub fn build(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            max_client_cnxns: self.max_client_cnxns,
            max_frame_size: self.max_frame_size,
            write_coalesce_size: self.write_coalesce_size,
        }
    }
}

/// Convenience constructor for tests and demos that only care about the
/// bind address.
pub fn quick_config(bind_addr: SocketAddr) -> ServerConfig {
    ServerConfig::builder(bind_addr).build()
}
