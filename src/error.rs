//! Error types for socksd.
//!
//! Per-session failures are collected into [`SessionError`]; they are
//! logged at the session boundary and never affect other sessions.
//! Startup failures (bind/listen) are reported through `anyhow` with
//! context and are fatal to the process.

use std::io;
use thiserror::Error;

/// Everything that can go wrong inside one proxy session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Protocol version byte was not 5
    #[error("bad protocol version: {0}")]
    BadVersion(u8),

    /// NMETHODS outside the accepted range
    #[error("bad method count: {0}")]
    BadMethodCount(u8),

    /// Unknown address type byte
    #[error("bad address type: {0}")]
    BadAtype(u8),

    /// Command other than CONNECT or UDP ASSOCIATE
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    /// Domain-name destination with no resolver configured
    #[error("domain destination not supported: {0}")]
    DomainNotSupported(String),

    /// Username/password sub-negotiation version was not 1
    #[error("bad auth sub-negotiation version: {0}")]
    BadAuthVersion(u8),

    /// Credentials did not match
    #[error("authentication failed")]
    AuthFailed,

    /// No offered method was acceptable
    #[error("no acceptable authentication method")]
    AuthRejected,

    /// Stream ended before the handshake completed
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// Data arrived where the protocol allows none
    #[error("unexpected data on control stream")]
    UnexpectedData,

    /// Malformed SOCKS5 UDP datagram
    #[error("bad udp packet: {0}")]
    BadPacket(&'static str),

    /// Read side of a socket failed
    #[error("read error: {0}")]
    Read(#[source] io::Error),

    /// Write side of a socket failed
    #[error("write error: {0}")]
    Write(#[source] io::Error),

    /// Connecting to the remote endpoint failed
    #[error("connect error: {0}")]
    Connect(#[source] io::Error),

    /// Binding a UDP relay socket failed
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),

    /// Shutting down a write half failed
    #[error("shutdown error: {0}")]
    Shutdown(#[source] io::Error),

    /// Reclaimed by a timeout wheel
    #[error("session timed out")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_protocol_errors() {
        assert_eq!(
            SessionError::BadVersion(4).to_string(),
            "bad protocol version: 4"
        );
        assert_eq!(
            SessionError::BadMethodCount(0).to_string(),
            "bad method count: 0"
        );
        assert_eq!(
            SessionError::UnsupportedCommand(2).to_string(),
            "unsupported command: 2"
        );
        assert_eq!(
            SessionError::AuthRejected.to_string(),
            "no acceptable authentication method"
        );
    }

    #[test]
    fn test_io_errors_keep_source() {
        use std::error::Error as _;

        let err = SessionError::Connect(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("connect error:"));
    }
}
