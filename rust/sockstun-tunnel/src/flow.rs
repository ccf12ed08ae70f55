//! Flow table for session tracking
//!
//! Maps a 5-tuple to the session relaying it. The table is owned by the event
//! loop, so it needs no internal locking.

use crate::error::{Result, TunnelError};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowProtocol::Tcp => f.write_str("tcp"),
            FlowProtocol::Udp => f.write_str("udp"),
        }
    }
}

/// Flow key. `local` is the application side behind the tun device,
/// `remote` the destination it addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: FlowProtocol,
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl FlowKey {
    pub fn tcp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { protocol: FlowProtocol::Tcp, local, remote }
    }

    pub fn udp(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { protocol: FlowProtocol::Udp, local, remote }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.local, self.remote)
    }
}

/// What the table needs to know about a session to expire it.
pub trait FlowEntry {
    fn last_activity(&self) -> Instant;

    fn idle_timeout(&self) -> Duration;

    /// Terminal sessions are swept regardless of activity.
    fn is_closed(&self) -> bool;

    fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity()) > self.idle_timeout()
    }
}

pub struct FlowTable<S> {
    sessions: HashMap<FlowKey, S>,
    limit: Option<usize>,
}

impl<S: FlowEntry> FlowTable<S> {
    /// `limit` caps the number of live sessions; `None` is unbounded.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            limit,
        }
    }

    /// Return the session for `key`, creating it with `create` if absent.
    ///
    /// The flag is `true` when the session was created by this call. Fails
    /// with `ResourceExhausted` when a new session would exceed the limit.
    pub fn lookup_or_create<F>(&mut self, key: FlowKey, create: F) -> Result<(&mut S, bool)>
    where
        F: FnOnce() -> Result<S>,
    {
        let full = self.limit.is_some_and(|limit| self.sessions.len() >= limit);
        match self.sessions.entry(key) {
            Entry::Occupied(entry) => Ok((entry.into_mut(), false)),
            Entry::Vacant(entry) => {
                if full {
                    return Err(TunnelError::ResourceExhausted(format!(
                        "session limit reached, dropping {}",
                        key
                    )));
                }
                let session = create()?;
                Ok((entry.insert(session), true))
            }
        }
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut S> {
        self.sessions.get_mut(key)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn remove(&mut self, key: &FlowKey) -> Option<S> {
        self.sessions.remove(key)
    }

    /// Remove sessions that are closed or idle past their timeout. The caller
    /// tears down what is returned.
    pub fn evict_idle(&mut self, now: Instant) -> Vec<(FlowKey, S)> {
        let expired: Vec<FlowKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.is_closed() || s.is_idle(now))
            .map(|(k, _)| *k)
            .collect();

        expired
            .into_iter()
            .filter_map(|key| self.sessions.remove(&key).map(|s| (key, s)))
            .collect()
    }

    /// Remove every session.
    pub fn drain(&mut self) -> Vec<(FlowKey, S)> {
        self.sessions.drain().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&FlowKey, &mut S)> {
        self.sessions.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
