//! Codec and connection configuration.

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Configuration shared by all codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Largest message accepted, in bytes.
    ///
    /// Framed codecs apply it to the length prefix; the unframed codec applies
    /// it to the bytes it is willing to buffer while waiting for one message.
    pub max_frame_size: usize,
}

impl CodecConfig {
    /// Create a config with default limits.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a config with a custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How a server finds message boundaries on the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    /// Every message is preceded by a 4-byte big-endian length.
    #[default]
    LengthPrefixed,
    /// No length prefix; boundaries are discovered by speculative decoding.
    Unframed,
}

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Framing expected from clients.
    pub framing: Framing,
    /// Codec limits.
    pub codec: CodecConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            framing: Framing::default(),
            codec: CodecConfig::default(),
        }
    }
}

/// Configuration for the RPC client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Codec limits.
    pub codec: CodecConfig,
}
