//! Username/password authentication (RFC 1929).

use super::{AuthStatus, Authenticator};
use crate::buffer::ByteQueue;
use crate::error::SessionError;
use crate::socks::consts::{
    SOCKS5_AUTH_FAILURE, SOCKS5_AUTH_SUCCESS, SOCKS5_AUTH_VERSION, SOCKS5_METHOD_NOT_ACCEPTABLE,
    SOCKS5_METHOD_PASSWORD,
};
use crate::socks::wire;
use std::collections::BTreeSet;
use std::collections::HashMap;
use tracing::debug;

/// Validates clients against a fixed credential map.
///
/// # Protocol
///
/// Client sends:
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
///
/// Server responds with `{0x01, status}` where status 0 is success.
#[derive(Debug, Clone)]
pub struct UserPassAuth {
    users: HashMap<String, String>,
}

impl UserPassAuth {
    /// Create from a credential map.
    pub fn new(users: HashMap<String, String>) -> Self {
        UserPassAuth { users }
    }

    /// Create with a single username/password pair.
    pub fn single(username: &str, password: &str) -> Self {
        let mut users = HashMap::new();
        users.insert(username.to_string(), password.to_string());
        UserPassAuth { users }
    }
}

impl Authenticator for UserPassAuth {
    fn begin(&self, offered: &BTreeSet<u8>) -> u8 {
        if offered.contains(&SOCKS5_METHOD_PASSWORD) {
            SOCKS5_METHOD_PASSWORD
        } else {
            SOCKS5_METHOD_NOT_ACCEPTABLE
        }
    }

    fn step(
        &self,
        input: &mut ByteQueue,
        reply: &mut Vec<u8>,
    ) -> Result<AuthStatus, SessionError> {
        let (username, password, used) = match wire::parse_userpass(input)? {
            Some(parsed) => parsed,
            None => return Ok(AuthStatus::Continue),
        };
        input.pop(used);

        if self.users.get(&username).map(String::as_str) == Some(password.as_str()) {
            debug!("authenticated user {}", username);
            reply.extend_from_slice(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_SUCCESS]);
            Ok(AuthStatus::Done)
        } else {
            debug!("credential mismatch for user {}", username);
            reply.extend_from_slice(&[SOCKS5_AUTH_VERSION, SOCKS5_AUTH_FAILURE]);
            Ok(AuthStatus::Failed)
        }
    }
}
