//! Write-buffered egress channel with backpressure and half-close.
//!
//! One channel owns one direction of a relay: the write half of a socket
//! plus its outbound queue. Producers feed bytes in; the relay pump
//! drives the queue out whenever the socket is writable. The pump applies
//! backpressure by not reading from the producer while [`IoChannel::over_limit`]
//! holds, and performs the half-close once the producer has finished and
//! the queue has drained.

use crate::buffer::ByteQueue;
use crate::error::SessionError;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::debug;

/// Buffered egress toward one socket write half.
pub struct IoChannel {
    writer: OwnedWriteHalf,
    queue: ByteQueue,
    limit: usize,
    producer_done: bool,
    shut: bool,
}

impl IoChannel {
    /// Wrap a write half with an empty queue.
    pub fn new(writer: OwnedWriteHalf, limit: usize) -> Self {
        IoChannel {
            writer,
            queue: ByteQueue::new(),
            limit,
            producer_done: false,
            shut: false,
        }
    }

    /// Wrap a write half with an already-filled queue (pipelined bytes).
    pub fn with_queue(writer: OwnedWriteHalf, limit: usize, queue: ByteQueue) -> Self {
        IoChannel {
            writer,
            queue,
            limit,
            producer_done: false,
            shut: false,
        }
    }

    /// True when nothing is queued.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }

    /// True once the queue has reached the buffer cap; the producer's
    /// reads must pause until the queue drains below it.
    pub fn over_limit(&self) -> bool {
        self.queue.len() >= self.limit
    }

    /// True once the write half has been shut down.
    pub fn is_closed(&self) -> bool {
        self.shut
    }

    /// Mark the producer finished. The half-close happens on the next
    /// [`IoChannel::drive`] once the queue drains (immediately if it
    /// already has).
    pub fn set_producer_done(&mut self) {
        self.producer_done = true;
    }

    /// Accept bytes from the producer.
    ///
    /// When the queue is empty, one direct write is attempted first to
    /// avoid buffering; would-block counts as writing nothing. Whatever
    /// the socket did not take is queued.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), SessionError> {
        debug_assert!(!self.producer_done);

        let mut written = 0;
        if self.queue.is_empty() {
            match self.writer.try_write(data) {
                Ok(0) if !data.is_empty() => {
                    return Err(SessionError::Write(zero_write_error()));
                }
                Ok(n) => written = n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(SessionError::Write(e)),
            }
        }
        if written < data.len() {
            self.queue.push(&data[written..]);
        }
        if self.over_limit() {
            debug!("write buffer full ({} bytes), pausing producer", self.queue.len());
        }
        Ok(())
    }

    /// Drain queued bytes into the socket.
    ///
    /// Waits for writability, then writes until the socket would block or
    /// the queue empties. Performs the half-close when the queue is empty
    /// and the producer has finished.
    pub async fn drive(&mut self) -> Result<(), SessionError> {
        if !self.queue.is_empty() {
            self.writer.writable().await.map_err(SessionError::Write)?;
            while !self.queue.is_empty() {
                match self.writer.try_write(self.queue.peek()) {
                    Ok(0) => return Err(SessionError::Write(zero_write_error())),
                    Ok(n) => self.queue.pop(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(SessionError::Write(e)),
                }
            }
            self.queue.compact();
        }
        if self.queue.is_empty() && self.producer_done && !self.shut {
            self.shut = true;
            self.writer.shutdown().await.map_err(SessionError::Shutdown)?;
        }
        Ok(())
    }

    /// Write `data` through the channel and drain everything queued.
    /// Used for handshake replies, which are always flushed in full.
    pub async fn send_all(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.feed(data)?;
        while !self.queue.is_empty() {
            self.drive().await?;
        }
        Ok(())
    }

    /// Flush the queue and shut down the write half.
    pub async fn finish(&mut self) -> Result<(), SessionError> {
        self.producer_done = true;
        while !self.is_closed() {
            self.drive().await?;
        }
        Ok(())
    }
}

fn zero_write_error() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "socket accepted zero bytes")
}
