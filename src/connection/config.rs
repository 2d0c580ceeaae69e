//! Connection configuration.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption (port 143). **Not recommended for production.**
    None,
    /// Start with plaintext, switch to TLS in place via
    /// [`upgrade`](crate::ImapConnection::upgrade) (port 143).
    StartTls,
    /// TLS from the start (port 993). **Recommended.**
    #[default]
    Implicit,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None | Self::StartTls => 143,
            Self::Implicit => 993,
        }
    }
}

/// Callback consulted for server certificates that WebPKI verification
/// rejected. Returning `true` trusts the certificate anyway.
pub type TrustDecider = Arc<dyn Fn(&CertificateDer<'_>) -> bool + Send + Sync>;

/// IMAP connection configuration.
#[derive(Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Timeout for establishing the TCP connection and TLS handshake.
    pub connect_timeout: Duration,
    /// Floor of the per-send response timeout.
    pub response_timeout_floor: Duration,
    /// Per-byte scaling of the response timeout: larger sends get
    /// proportionally more time before the connection is declared dead.
    pub response_timeout_per_byte: Duration,
    /// How long the queue must stay empty before the idle event fires.
    pub idle_delay: Duration,
    /// Run the compression codec on a worker task instead of inline.
    pub offload_compression: bool,
    /// Additional trust anchor for TLS verification.
    pub trust_anchor: Option<CertificateDer<'static>>,
    /// Trust decision callback for otherwise-rejected certificates.
    pub trust_decider: Option<TrustDecider>,
}

impl Config {
    /// Creates a configuration with implicit TLS on port 993.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Security::Implicit.default_port(),
            security: Security::Implicit,
            connect_timeout: Duration::from_secs(30),
            response_timeout_floor: Duration::from_secs(10),
            response_timeout_per_byte: Duration::from_millis(100),
            idle_delay: Duration::from_millis(1000),
            offload_compression: false,
            trust_anchor: None,
            trust_decider: None,
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Returns the response timeout for a send of the given size.
    #[must_use]
    pub fn response_timeout(&self, sent_bytes: usize) -> Duration {
        let scaled = self
            .response_timeout_per_byte
            .saturating_mul(u32::try_from(sent_bytes).unwrap_or(u32::MAX));
        self.response_timeout_floor.saturating_add(scaled)
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("connect_timeout", &self.connect_timeout)
            .field("offload_compression", &self.offload_compression)
            .field("has_trust_anchor", &self.trust_anchor.is_some())
            .field("has_trust_decider", &self.trust_decider.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for connection configuration.
#[derive(Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    connect_timeout: Duration,
    response_timeout_floor: Duration,
    response_timeout_per_byte: Duration,
    idle_delay: Duration,
    offload_compression: bool,
    trust_anchor: Option<CertificateDer<'static>>,
    trust_decider: Option<TrustDecider>,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        let defaults = Config::new(host);
        Self {
            host: defaults.host,
            port: None,
            security: defaults.security,
            connect_timeout: defaults.connect_timeout,
            response_timeout_floor: defaults.response_timeout_floor,
            response_timeout_per_byte: defaults.response_timeout_per_byte,
            idle_delay: defaults.idle_delay,
            offload_compression: defaults.offload_compression,
            trust_anchor: None,
            trust_decider: None,
        }
    }

    /// Sets the port. Defaults to the security mode's standard port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the floor of the per-send response timeout.
    #[must_use]
    pub const fn response_timeout_floor(mut self, timeout: Duration) -> Self {
        self.response_timeout_floor = timeout;
        self
    }

    /// Sets the per-byte scaling of the response timeout.
    #[must_use]
    pub const fn response_timeout_per_byte(mut self, per_byte: Duration) -> Self {
        self.response_timeout_per_byte = per_byte;
        self
    }

    /// Sets the delay before the idle event fires.
    #[must_use]
    pub const fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Runs the compression codec on a worker task.
    #[must_use]
    pub const fn offload_compression(mut self, offload: bool) -> Self {
        self.offload_compression = offload;
        self
    }

    /// Adds a trust anchor to the TLS root store.
    #[must_use]
    pub fn trust_anchor(mut self, anchor: CertificateDer<'static>) -> Self {
        self.trust_anchor = Some(anchor);
        self
    }

    /// Installs a trust decision callback for rejected certificates.
    #[must_use]
    pub fn trust_decider(mut self, decider: TrustDecider) -> Self {
        self.trust_decider = Some(decider);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            host: self.host,
            security: self.security,
            connect_timeout: self.connect_timeout,
            response_timeout_floor: self.response_timeout_floor,
            response_timeout_per_byte: self.response_timeout_per_byte,
            idle_delay: self.idle_delay,
            offload_compression: self.offload_compression,
            trust_anchor: self.trust_anchor,
            trust_decider: self.trust_decider,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports() {
        assert_eq!(Security::None.default_port(), 143);
        assert_eq!(Security::StartTls.default_port(), 143);
        assert_eq!(Security::Implicit.default_port(), 993);
    }

    #[test]
    fn test_config_new() {
        let config = Config::new("imap.example.com");
        assert_eq!(config.host, "imap.example.com");
        assert_eq!(config.port, 993);
        assert_eq!(config.security, Security::Implicit);
    }

    #[test]
    fn test_builder_default_port_follows_security() {
        let config = Config::builder("imap.example.com")
            .security(Security::None)
            .build();
        assert_eq!(config.port, 143);

        let config = Config::builder("imap.example.com")
            .security(Security::None)
            .port(1143)
            .build();
        assert_eq!(config.port, 1143);
    }

    #[test]
    fn test_response_timeout_scales_with_size() {
        let config = Config::builder("h")
            .response_timeout_floor(Duration::from_secs(10))
            .response_timeout_per_byte(Duration::from_millis(100))
            .build();
        assert_eq!(config.response_timeout(0), Duration::from_secs(10));
        assert_eq!(config.response_timeout(26), Duration::from_millis(12_600));
    }
}
