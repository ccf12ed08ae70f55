//! Session plumbing shared by TCP and UDP
//!
//! Sessions live inside the event loop. Each one drives a relay task on the
//! same runtime; the task reports back through [`SessionEvent`]s tagged with
//! the session id, so events from a replaced session are recognisable.

use crate::error::TunnelError;
use crate::flow::{FlowEntry, FlowKey};
use crate::tcp::TcpSession;
use crate::udp::UdpSession;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

/// Packets produced while handling one input, written to the tun device by
/// the event loop.
#[derive(Debug, Default)]
pub struct Outbox {
    pub packets: Vec<Vec<u8>>,
    pub retransmits: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Vec<u8>) {
        self.packets.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[derive(Debug)]
pub enum EventKind {
    /// Proxy handshake finished
    Connected,
    ConnectFailed(TunnelError),
    /// Bytes read from a CONNECT stream
    Data(Bytes),
    /// Bytes flushed to a CONNECT stream
    Written(usize),
    /// The proxy closed its side of a CONNECT stream
    Eof,
    Failed(TunnelError),
    /// Reply datagram from a UDP relay
    Datagram { src: SocketAddr, data: Bytes },
}

#[derive(Debug)]
pub struct SessionEvent {
    pub id: SessionId,
    pub key: FlowKey,
    pub kind: EventKind,
}

/// Everything a relay task needs to report back to the event loop.
#[derive(Clone)]
pub struct RelayContext {
    pub id: SessionId,
    pub key: FlowKey,
    pub events: mpsc::Sender<SessionEvent>,
    pub cancel: CancellationToken,
}

impl RelayContext {
    /// Returns `false` once the event loop is gone.
    pub async fn emit(&self, kind: EventKind) -> bool {
        self.events
            .send(SessionEvent {
                id: self.id,
                key: self.key,
                kind,
            })
            .await
            .is_ok()
    }
}

pub enum Session {
    Tcp(TcpSession),
    Udp(UdpSession),
}

impl Session {
    pub fn id(&self) -> SessionId {
        match self {
            Session::Tcp(s) => s.id(),
            Session::Udp(s) => s.id(),
        }
    }
}

impl FlowEntry for Session {
    fn last_activity(&self) -> Instant {
        match self {
            Session::Tcp(s) => s.last_activity(),
            Session::Udp(s) => s.last_activity(),
        }
    }

    fn idle_timeout(&self) -> Duration {
        match self {
            Session::Tcp(s) => s.idle_timeout(),
            Session::Udp(s) => s.idle_timeout(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Session::Tcp(s) => s.is_closed(),
            Session::Udp(s) => s.is_closed(),
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        match self {
            Session::Tcp(s) => s.is_expired(now),
            Session::Udp(s) => now.saturating_duration_since(s.last_activity()) > s.idle_timeout(),
        }
    }
}
