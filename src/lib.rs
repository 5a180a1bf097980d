//! # socksd - SOCKS5 proxy server
//!
//! An event-driven SOCKS5 (RFC 1928) proxy server supporting CONNECT and
//! UDP ASSOCIATE, with no-auth and username/password (RFC 1929)
//! authentication.
//!
//! ## Features
//!
//! - **Single-reactor design**: every session cooperates on one runtime
//!   thread; all I/O is nonblocking
//! - **Backpressure**: per-direction write queues are capped; the
//!   producing side stops reading until the consumer drains
//! - **Half-close aware relaying**: each direction of a CONNECT relay
//!   shuts down independently and the session ends when both have
//! - **Three-axis timeouts**: client write stalls, remote write stalls,
//!   and whole-session idleness are tracked separately and swept by a
//!   single re-armed timer
//! - **Graceful shutdown**: the first interrupt stops accepting and
//!   drains; the second force-terminates
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksd::{NoAuth, ProxyServer, ServerConfig};
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//!
//! let server = ProxyServer::new(ServerConfig::default(), Arc::new(NoAuth));
//! let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
//! let listener = server.bind().await?;
//! server.serve(listener, shutdown_rx).await?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod addr;
pub mod buffer;
pub mod config;
pub mod error;
pub mod iochannel;
pub mod server;
pub mod session;
pub mod socks;
pub mod timeout;

pub use addr::Address;
pub use config::ServerConfig;
pub use error::SessionError;
pub use server::ProxyServer;
pub use socks::{AuthStatus, Authenticator, NoAuth, UserPassAuth};

/// Version of the socksd library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "socksd");
    }
}
