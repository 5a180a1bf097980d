//! Pluggable SOCKS5 authentication.
//!
//! The server owns one [`Authenticator`]; each session calls `begin` with
//! the offered method set, then feeds ingress bytes through `step` until
//! it reports done or failed, and finally calls `end` exactly once when
//! the session leaves the authentication phase (including teardown).

mod none;
mod password;

pub use none::NoAuth;
pub use password::UserPassAuth;

use crate::buffer::ByteQueue;
use crate::error::SessionError;
use std::collections::BTreeSet;

/// Outcome of one authentication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// More bytes are needed
    Continue,
    /// Authentication succeeded
    Done,
    /// Authentication failed; the session must be terminated
    Failed,
}

/// Method selection and per-step authentication.
///
/// `step` must never block: it consumes exactly the bytes it parsed from
/// `input` and stages any protocol response into `reply`, which the
/// session writes through the client channel.
pub trait Authenticator: Send + Sync {
    /// Choose one method from the offered set, or
    /// [`SOCKS5_METHOD_NOT_ACCEPTABLE`](crate::socks::consts::SOCKS5_METHOD_NOT_ACCEPTABLE)
    /// to reject. When rejected, neither `step` nor `end` is called.
    fn begin(&self, offered: &BTreeSet<u8>) -> u8;

    /// Drive authentication with whatever bytes have arrived.
    fn step(&self, input: &mut ByteQueue, reply: &mut Vec<u8>)
        -> Result<AuthStatus, SessionError>;

    /// Called exactly once when the session leaves the auth phase.
    fn end(&self) {}
}
