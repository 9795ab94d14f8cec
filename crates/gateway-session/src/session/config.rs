//! Session configuration.

use crate::error::{Error, Result};
use crate::protocol::framing::{FrameCodec, SlipCodec};
use crate::protocol::registry::{OpcodeRegistry, PASSWORD_LEN, StandardRegistry};
use crate::session::Session;
use crate::session::actor::SessionActor;
use crate::transport::{ClientIdentity, Connector, TlsConnector};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Port the gateway accepts sessions on.
pub const DEFAULT_PORT: u16 = 51200;

/// Builds a frame codec for each new transport.
pub type FrameCodecFactory = Arc<dyn Fn() -> Box<dyn FrameCodec> + Send + Sync>;

/// Configuration for a gateway session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Gateway host name or address.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// Password sent in the login request.
    pub password: String,
    /// Client certificate offered during the TLS handshake.
    pub client_identity: Option<ClientIdentity>,
    /// Reconnect after an unexpected close.
    pub auto_reconnect: bool,
    /// Connect on demand when a request is issued while idle.
    pub auto_connect: bool,
    /// Time allowed for the transport to open.
    pub connect_timeout: Duration,
    /// Time allowed for a confirmation to arrive.
    pub request_timeout: Duration,
    /// Delay before a scheduled reconnect.
    pub reconnect_delay: Duration,
    /// Idle period after which a keepalive request is sent.
    pub keepalive_interval: Duration,
    /// Buffer size of each event subscription.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            password: String::new(),
            client_identity: None,
            auto_reconnect: true,
            auto_connect: false,
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_millis(5000),
            reconnect_delay: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5 * 60),
            event_capacity: 64,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .field("client_identity", &self.client_identity)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_connect", &self.auto_connect)
            .field("connect_timeout", &self.connect_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("reconnect_delay", &self.reconnect_delay)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<()> {
        if self.password.len() > PASSWORD_LEN {
            return Err(Error::InvalidConfig(format!(
                "password longer than {PASSWORD_LEN} bytes"
            )));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating sessions.
pub struct SessionBuilder {
    config: SessionConfig,
    registry: Option<Arc<dyn OpcodeRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    frame_codec: Option<FrameCodecFactory>,
}

impl SessionBuilder {
    /// Create a new session builder.
    #[must_use]
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            config: SessionConfig {
                host: host.into(),
                password: password.into(),
                ..SessionConfig::default()
            },
            registry: None,
            connector: None,
            frame_codec: None,
        }
    }

    /// Start from a complete configuration.
    #[must_use]
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            registry: None,
            connector: None,
            frame_codec: None,
        }
    }

    /// Set the gateway port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Offer a client certificate during the TLS handshake.
    #[must_use]
    pub fn client_identity(mut self, identity: ClientIdentity) -> Self {
        self.config.client_identity = Some(identity);
        self
    }

    /// Enable or disable reconnecting after an unexpected close.
    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Enable or disable connecting on demand.
    #[must_use]
    pub const fn auto_connect(mut self, enabled: bool) -> Self {
        self.config.auto_connect = enabled;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the delay before a scheduled reconnect.
    #[must_use]
    pub const fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the keepalive idle period.
    #[must_use]
    pub const fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = interval;
        self
    }

    /// Use a custom opcode registry.
    #[must_use]
    pub fn registry(mut self, registry: impl OpcodeRegistry) -> Self {
        self.registry = Some(Arc::new(registry));
        self
    }

    /// Use a custom connector instead of TCP and TLS.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Use a custom transport framing.
    #[must_use]
    pub fn frame_codec<C, F>(mut self, factory: F) -> Self
    where
        C: FrameCodec,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.frame_codec = Some(Arc::new(move || Box::new(factory()) as Box<dyn FrameCodec>));
        self
    }

    /// Build the session and start its task.
    ///
    /// No connection is made until [`Session::connect`] is called, or a
    /// request is issued with `auto_connect` enabled.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the TLS
    /// configuration cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => {
                if self.config.host.is_empty() {
                    return Err(Error::InvalidConfig("gateway host not specified".to_string()));
                }
                Arc::new(TlsConnector::new(
                    self.config.host.clone(),
                    self.config.port,
                    self.config.client_identity.as_ref(),
                )?)
            }
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StandardRegistry));
        let frame_codec = self
            .frame_codec
            .unwrap_or_else(|| Arc::new(|| Box::new(SlipCodec::new()) as Box<dyn FrameCodec>));

        Ok(SessionActor::spawn(self.config, registry, connector, frame_codec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.port, 51200);
        assert!(config.auto_reconnect);
        assert!(!config.auto_connect);
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SessionConfig {
            password: "hunter2".to_string(),
            ..SessionConfig::default()
        };

        assert!(!format!("{config:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let long_password = "x".repeat(PASSWORD_LEN + 1);

        assert!(matches!(
            SessionBuilder::new("gateway", long_password).build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SessionBuilder::new("", "secret").build(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_build_with_tls_connector() {
        let session = SessionBuilder::new("192.168.0.10", "secret")
            .auto_reconnect(false)
            .build()
            .unwrap();

        assert_eq!(session.state(), crate::session::SessionState::Idle);
    }
}
