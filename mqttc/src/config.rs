//! Client configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::MAX_CLIENT_ID_LEN;
use crate::types::LastWill;

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default keep alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;

/// Default upper bound on an inbound packet's remaining length.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Default initial size of the reader's buffer.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client ID, at most 23 characters.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep alive interval in seconds. 0 disables keepalive.
    pub keep_alive: u16,
    /// Clean session flag for the first connect. Reconnects always resume.
    pub clean_session: bool,
    /// Last will carried in CONNECT.
    pub last_will: Option<LastWill>,
    /// Maximum inbound packet size.
    pub max_packet_size: usize,
    /// Initial reader buffer size; grows up to `max_packet_size`.
    pub read_buffer_size: usize,
    /// Send PINGREQ every `keep_alive` seconds.
    pub auto_keepalive: bool,
}

impl ClientConfig {
    /// Create a new client config with default port and keep alive.
    pub fn new(host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            last_will: None,
            max_packet_size: MAX_PACKET_SIZE,
            read_buffer_size: READ_BUFFER_SIZE,
            auto_keepalive: true,
        }
    }

    /// Set the broker port. 0 selects the default port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = if port == 0 { DEFAULT_PORT } else { port };
        self
    }

    /// Set credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the last will.
    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Enable or disable automatic keep-alive.
    pub fn with_auto_keepalive(mut self, enabled: bool) -> Self {
        self.auto_keepalive = enabled;
        self
    }

    /// Interval of the keepalive timer, if one should run.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        if !self.auto_keepalive || self.keep_alive == 0 {
            return None;
        }
        Some(Duration::from_secs(self.keep_alive as u64))
    }

    /// Checks the configuration before any I/O happens.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidParameter("empty broker host".into()));
        }
        let id_len = self.client_id.chars().count();
        if id_len > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidParameter(format!(
                "client id has {} characters, at most {} allowed",
                id_len, MAX_CLIENT_ID_LEN
            )));
        }
        if self.read_buffer_size == 0 || self.max_packet_size == 0 {
            return Err(Error::InvalidParameter("zero buffer size".into()));
        }
        Ok(())
    }
}
