use serde::{Deserialize, Serialize};
use std::path::Path;

/// Buffer and connection limits
pub mod limits {
    /// Hard cap on a single edge buffer (inbuf or outbuf)
    pub const EDGE_BUFFER_CAP: usize = 64 * 1024;

    /// Outbuf level above which stream SENDMEs are withheld
    pub const OUTBUF_HIGH_WATER: usize = 10 * 1024;

    /// Maximum bytes pulled off a socket per readable wake-up
    pub const READ_PER_WAKE: usize = 16 * 1024;

    /// Maximum edge connections the daemon will carry at once
    pub const MAX_EDGE_CONNECTIONS: usize = 1024;
}

/// Relay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// SOCKS listen address
    pub socks_listen_addr: String,

    /// SOCKS listen port
    pub socks_listen_port: u16,

    /// Destination ports the exit side refuses to connect to
    pub refuse_exit_ports: Vec<u16>,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socks_listen_addr: "127.0.0.1".to_string(),
            socks_listen_port: 9050,
            refuse_exit_ports: vec![25],
            verbose: false,
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socks_port(mut self, port: u16) -> Self {
        self.socks_listen_port = port;
        self
    }

    pub fn with_refused_ports(mut self, ports: Vec<u16>) -> Self {
        self.refuse_exit_ports = ports;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn refuses_port(&self, port: u16) -> bool {
        self.refuse_exit_ports.contains(&port)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}
