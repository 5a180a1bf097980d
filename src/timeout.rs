//! Last-activity timeout tracking.
//!
//! Each axis (client write stall, remote write stall, session idle) is a
//! [`TimeoutWheel`]: sessions are touched on activity and swept in FIFO
//! order of their last activity. Wheels hold session ids, never session
//! state; expiry is acted on by the server, which owns the registry.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Handle identifying a live session in the registry and the wheels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// FIFO list of sessions ordered by last-activity timestamp.
///
/// `touch` moves a session to the tail with the current stamp; `sweep`
/// fires every head entry whose stamp is at least `timeout` old and
/// reports the time until the next would expire. Removal is lazy: stale
/// queue entries are skipped during sweeps and purged wholesale once
/// they outnumber live ones.
#[derive(Debug)]
pub struct TimeoutWheel {
    timeout: Duration,
    stamps: HashMap<SessionId, Instant>,
    order: VecDeque<(SessionId, Instant)>,
}

impl TimeoutWheel {
    /// Create a wheel with the given expiry period.
    pub fn new(timeout: Duration) -> Self {
        TimeoutWheel {
            timeout,
            stamps: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// The configured expiry period.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record activity for a session, moving it to the tail.
    pub fn touch(&mut self, now: Instant, id: SessionId) {
        self.stamps.insert(id, now);
        self.order.push_back((id, now));
        if self.order.len() > 2 * self.stamps.len() + 16 {
            self.purge_stale();
        }
    }

    /// Stop tracking a session.
    pub fn remove(&mut self, id: SessionId) {
        self.stamps.remove(&id);
    }

    /// Touch when `active`, remove otherwise.
    pub fn update(&mut self, now: Instant, id: SessionId, active: bool) {
        if active {
            self.touch(now, id);
        } else {
            self.remove(id);
        }
    }

    /// Whether a session is currently tracked.
    pub fn contains(&self, id: SessionId) -> bool {
        self.stamps.contains_key(&id)
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    /// True when no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    /// Collect every session whose last activity is at least `timeout`
    /// old into `expired`, untracking them, and return the time until
    /// the next entry would expire (the full period when empty).
    pub fn sweep(&mut self, now: Instant, expired: &mut Vec<SessionId>) -> Duration {
        while let Some(&(id, stamp)) = self.order.front() {
            match self.stamps.get(&id) {
                // removed or re-touched since this entry was queued
                Some(&current) if current != stamp => {
                    self.order.pop_front();
                }
                None => {
                    self.order.pop_front();
                }
                Some(&current) => {
                    let deadline = current + self.timeout;
                    if deadline <= now {
                        expired.push(id);
                        self.stamps.remove(&id);
                        self.order.pop_front();
                    } else {
                        return deadline - now;
                    }
                }
            }
        }
        self.timeout
    }

    fn purge_stale(&mut self) {
        let stamps = &self.stamps;
        self.order
            .retain(|&(id, stamp)| stamps.get(&id) == Some(&stamp));
    }
}

/// The three timeout axes shared by the server and its sessions.
#[derive(Debug)]
pub struct Wheels {
    /// Client egress stalls; doubles as the handshake deadline
    pub client_stall: Mutex<TimeoutWheel>,
    /// Remote egress stalls
    pub remote_stall: Mutex<TimeoutWheel>,
    /// Whole-session inactivity
    pub idle: Mutex<TimeoutWheel>,
}

impl Wheels {
    /// Create the three wheels from their periods.
    pub fn new(client_stall: Duration, remote_stall: Duration, idle: Duration) -> Self {
        Wheels {
            client_stall: Mutex::new(TimeoutWheel::new(client_stall)),
            remote_stall: Mutex::new(TimeoutWheel::new(remote_stall)),
            idle: Mutex::new(TimeoutWheel::new(idle)),
        }
    }

    /// Shortest of the three periods; the sweep timer's initial arm.
    pub fn min_timeout(&self) -> Duration {
        let client = self.client_stall.lock().unwrap().timeout();
        let remote = self.remote_stall.lock().unwrap().timeout();
        let idle = self.idle.lock().unwrap().timeout();
        client.min(remote).min(idle)
    }

    /// Record whole-session activity.
    pub fn touch_idle(&self, id: SessionId) {
        self.idle.lock().unwrap().touch(Instant::now(), id);
    }

    /// Start the handshake deadline for a fresh session.
    pub fn touch_client_stall(&self, id: SessionId) {
        self.client_stall.lock().unwrap().touch(Instant::now(), id);
    }

    /// Track or clear a client egress stall depending on queue state.
    pub fn update_client_stall(&self, id: SessionId, buffered: bool) {
        self.client_stall
            .lock()
            .unwrap()
            .update(Instant::now(), id, buffered);
    }

    /// Track or clear a remote egress stall depending on queue state.
    pub fn update_remote_stall(&self, id: SessionId, buffered: bool) {
        self.remote_stall
            .lock()
            .unwrap()
            .update(Instant::now(), id, buffered);
    }

    /// Unlink a session from every wheel.
    pub fn remove_all(&self, id: SessionId) {
        self.client_stall.lock().unwrap().remove(id);
        self.remote_stall.lock().unwrap().remove(id);
        self.idle.lock().unwrap().remove(id);
    }
}
