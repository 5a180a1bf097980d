//! The no-authentication method (0x00).

use super::{AuthStatus, Authenticator};
use crate::buffer::ByteQueue;
use crate::error::SessionError;
use crate::socks::consts::{SOCKS5_METHOD_NONE, SOCKS5_METHOD_NOT_ACCEPTABLE};
use std::collections::BTreeSet;

/// Accepts every client that offers method 0x00.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    fn begin(&self, offered: &BTreeSet<u8>) -> u8 {
        if offered.contains(&SOCKS5_METHOD_NONE) {
            SOCKS5_METHOD_NONE
        } else {
            SOCKS5_METHOD_NOT_ACCEPTABLE
        }
    }

    fn step(
        &self,
        _input: &mut ByteQueue,
        _reply: &mut Vec<u8>,
    ) -> Result<AuthStatus, SessionError> {
        Ok(AuthStatus::Done)
    }
}
