//! Server configuration.
//!
//! Built from command-line arguments; there is no configuration file.

use std::collections::HashMap;
use std::time::Duration;

use crate::socks::consts::DEFAULT_WRITE_BUF_MAX;

/// Default listen address; empty host means every interface.
pub const DEFAULT_LISTEN: &str = ":1080";

/// Tunable parameters for a [`ProxyServer`](crate::server::ProxyServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `HOST:PORT` to listen on; empty host binds the wildcard address
    pub listen: String,
    /// Username/password credentials; `None` disables authentication
    pub users: Option<HashMap<String, String>>,
    /// How long a client egress buffer may sit nonempty without progress
    pub client_stall_timeout: Duration,
    /// How long a remote egress buffer may sit nonempty without progress
    pub remote_stall_timeout: Duration,
    /// How long a session may go without any I/O at all
    pub idle_timeout: Duration,
    /// Egress queue size at which the producer side stops reading
    pub max_write_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: DEFAULT_LISTEN.to_string(),
            users: None,
            client_stall_timeout: Duration::from_secs(5),
            remote_stall_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            max_write_buffer: DEFAULT_WRITE_BUF_MAX,
        }
    }
}

impl ServerConfig {
    /// Check the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_write_buffer == 0 {
            return Err("max_write_buffer must be nonzero".to_string());
        }
        if self.client_stall_timeout.is_zero()
            || self.remote_stall_timeout.is_zero()
            || self.idle_timeout.is_zero()
        {
            return Err("timeouts must be nonzero".to_string());
        }
        if let Some(users) = &self.users {
            if users.is_empty() {
                return Err("credential map must not be empty".to_string());
            }
        }
        self.listen_host_port().map(|_| ())
    }

    /// Split the listen string into host and port. An empty host stands
    /// for the wildcard address; IPv6 hosts may be bracketed.
    pub fn listen_host_port(&self) -> Result<(String, u16), String> {
        let (host, port) = self
            .listen
            .rsplit_once(':')
            .ok_or_else(|| format!("listen address {:?} is missing a port", self.listen))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid listen port {:?}", port))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), port))
    }
}
