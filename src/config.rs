use rustls::ClientConfig as RustlsClientConfig;
use rustls::ServerConfig as RustlsConfig;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;

pub const MAX_POOL_THREADS: usize = 64;

/// Bit flags selecting which access events get logged.
pub mod access {
    pub const CONNECT: u32 = 1 << 0;
    pub const DISCONNECT: u32 = 1 << 1;
    pub const HANDSHAKE: u32 = 1 << 2;
    pub const MESSAGE: u32 = 1 << 3;
    pub const CONTROL: u32 = 1 << 4;
    pub const ALL: u32 = u32::MAX;
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Inbound payload cap. Exceeding it closes the connection with 1009.
    pub max_message_size: usize,
    /// Bounds the opening WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Bounds the TLS handshake when the transport is secure.
    pub tls_handshake_timeout: Duration,
    /// How long to wait for the peer's close ack before dropping the transport.
    pub close_timeout: Duration,
    /// Worker threads for `listen_on`/`run_on` (1..=64).
    pub pool_threads: usize,
    /// How long to back off before retrying `accept` after running out of
    /// file descriptors.
    pub accept_retry_delay: Duration,
    /// Disable the word-aligned masking fast path at runtime.
    pub strict_masking: bool,
    /// Bitmask of `access::*` flags selecting which access events are logged.
    pub log_access: u32,
    /// Minimum severity an error must have to be logged.
    pub log_error: log::LevelFilter,
    /// Value of the `Server` response header / `User-Agent` request header.
    pub agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_message_size: 16 << 20,
            handshake_timeout: Duration::from_millis(5000),
            tls_handshake_timeout: Duration::from_millis(5000),
            close_timeout: Duration::from_millis(1000),
            pool_threads: 1,
            accept_retry_delay: Duration::from_millis(500),
            strict_masking: false,
            log_access: access::CONNECT | access::DISCONNECT | access::HANDSHAKE,
            log_error: log::LevelFilter::Warn,
            agent: concat!("ws-endpoint/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_threads == 0 || self.pool_threads > MAX_POOL_THREADS {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    pub fn access_enabled(&self, flag: u32) -> bool {
        self.log_access & flag != 0
    }

    /// Whether errors of `level` severity clear the configured threshold.
    pub fn error_enabled(&self, level: log::Level) -> bool {
        level <= self.log_error
    }
}

#[derive(Clone, Default)]
pub struct ServerConfig {
    pub settings: Settings,
    pub tls_config: Option<Arc<RustlsConfig>>,
}

#[derive(Clone, Default)]
pub struct ClientConfig {
    pub settings: Settings,
    pub tls_config: Option<Arc<RustlsClientConfig>>,
    /// Optional `Origin` header for the opening handshake.
    pub origin: Option<String>,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`.
    pub subprotocols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.max_message_size, 16 << 20);
        assert_eq!(settings.handshake_timeout, Duration::from_secs(5));
        assert_eq!(settings.close_timeout, Duration::from_secs(1));
        assert_eq!(settings.pool_threads, 1);
        assert!(!settings.strict_masking);
        settings.validate().unwrap();
    }

    #[test]
    fn pool_threads_bounds() {
        let mut settings = Settings::default();
        settings.pool_threads = 0;
        assert!(settings.validate().is_err());
        settings.pool_threads = 65;
        assert!(settings.validate().is_err());
        settings.pool_threads = 64;
        assert!(settings.validate().is_ok());
    }
}
