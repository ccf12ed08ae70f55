//! UDP session management
//!
//! Each captured UDP flow gets its own relay, set up lazily on the first
//! datagram. Datagrams that arrive before the relay is ready wait in a small
//! bounded queue.

use crate::config::UdpRelayMode;
use crate::error::{Result, TunnelError};
use crate::flow::FlowKey;
use crate::packet::build_udp;
use crate::session::{EventKind, Outbox, RelayContext, SessionId};
use crate::socks5::{encode_udp_frame, read_udp_frame, Socks5Client, TargetAddr, UdpAssociation};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, trace, warn};

/// Datagrams held per session while the relay is not yet ready
pub const PENDING_DATAGRAMS: usize = 64;
const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct UdpParams {
    pub idle_timeout: Duration,
    pub relay_mode: UdpRelayMode,
    pub recv_buffer_size: usize,
}

/// Event-loop side of a UDP relay task.
pub struct DatagramLink {
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    _task: Option<AbortOnDropHandle<()>>,
}

impl DatagramLink {
    pub fn spawn(
        ctx: RelayContext,
        client: Arc<Socks5Client>,
        params: &UdpParams,
        remote: SocketAddr,
    ) -> Self {
        let (tx, rx) = mpsc::channel(PENDING_DATAGRAMS);
        let cancel = ctx.cancel.clone();
        let task = tokio::spawn(relay_udp(
            ctx,
            client,
            params.relay_mode,
            remote,
            rx,
            params.recv_buffer_size,
        ));
        Self {
            tx,
            cancel,
            _task: Some(AbortOnDropHandle::new(task)),
        }
    }
}

impl Drop for DatagramLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_udp(
    ctx: RelayContext,
    client: Arc<Socks5Client>,
    mode: UdpRelayMode,
    remote: SocketAddr,
    mut rx: mpsc::Receiver<Bytes>,
    recv_buffer_size: usize,
) {
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        result = async {
            match mode {
                UdpRelayMode::Udp => relay_associate(&ctx, &client, remote, &mut rx, recv_buffer_size).await,
                UdpRelayMode::Tcp => relay_over_tcp(&ctx, &client, remote, &mut rx).await,
            }
        } => result,
    };
    if let Err(e) = result {
        ctx.emit(EventKind::Failed(e)).await;
    }
}

async fn relay_associate(
    ctx: &RelayContext,
    client: &Socks5Client,
    remote: SocketAddr,
    rx: &mut mpsc::Receiver<Bytes>,
    recv_buffer_size: usize,
) -> Result<()> {
    let UdpAssociation { mut control, relay } = match client.udp_associate().await {
        Ok(assoc) => assoc,
        Err(e) => {
            ctx.emit(EventKind::ConnectFailed(e)).await;
            return Ok(());
        }
    };
    if let Err(e) = relay.set_recv_buffer_size(recv_buffer_size) {
        debug!("UDP relay SO_RCVBUF: {}", e);
    }
    if !ctx.emit(EventKind::Connected).await {
        return Ok(());
    }

    let target = TargetAddr::Ip(remote);
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut control_buf = [0u8; 64];
    loop {
        tokio::select! {
            datagram = rx.recv() => match datagram {
                Some(payload) => {
                    if let Err(e) = relay.send_to(&target, &payload).await {
                        debug!("UDP {} send to relay failed: {}", ctx.key, e);
                    }
                }
                None => return Ok(()),
            },
            reply = relay.recv_from(&mut buf) => match reply {
                Ok((src, data)) => {
                    let src = src.socket_addr().unwrap_or(remote);
                    if !ctx.emit(EventKind::Datagram { src, data }).await {
                        return Ok(());
                    }
                }
                Err(TunnelError::Protocol(reason)) => {
                    trace!("UDP {} dropping relay datagram: {}", ctx.key, reason);
                }
                Err(e) => return Err(e),
            },
            read = control.read(&mut control_buf) => match read {
                Ok(0) | Err(_) => {
                    return Err(TunnelError::ProxyUnreachable(
                        "UDP ASSOCIATE control connection closed".into(),
                    ));
                }
                Ok(_) => {}
            },
        }
    }
}

async fn relay_over_tcp(
    ctx: &RelayContext,
    client: &Socks5Client,
    remote: SocketAddr,
    rx: &mut mpsc::Receiver<Bytes>,
) -> Result<()> {
    let stream = match client.udp_over_tcp().await {
        Ok(stream) => stream,
        Err(e) => {
            ctx.emit(EventKind::ConnectFailed(e)).await;
            return Ok(());
        }
    };
    if !ctx.emit(EventKind::Connected).await {
        return Ok(());
    }

    let (mut reader, mut writer) = stream.into_split();
    let target = TargetAddr::Ip(remote);

    let upload = async {
        while let Some(payload) = rx.recv().await {
            let frame = encode_udp_frame(&target, &payload)?;
            writer.write_all(&frame).await?;
        }
        Ok::<(), TunnelError>(())
    };

    let download = async {
        loop {
            let (src, data) = read_udp_frame(&mut reader).await?;
            let src = src.socket_addr().unwrap_or(remote);
            if !ctx.emit(EventKind::Datagram { src, data }).await {
                return Ok::<(), TunnelError>(());
            }
        }
    };

    tokio::try_join!(upload, download).map(|_| ())
}

/// One captured UDP flow.
pub struct UdpSession {
    id: SessionId,
    key: FlowKey,
    state: UdpState,
    idle_timeout: Duration,
    last_activity: Instant,
    ready: bool,
    link: Option<DatagramLink>,
}

impl UdpSession {
    pub fn new(id: SessionId, key: FlowKey, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            id,
            key,
            state: UdpState::Active,
            idle_timeout,
            last_activity: now,
            ready: false,
            link: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> UdpState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.state == UdpState::Closed
    }

    pub fn attach(&mut self, link: DatagramLink) {
        self.link = Some(link);
    }

    /// Queue a captured datagram for the relay.
    ///
    /// Fails with `ResourceExhausted` when the queue is full; the datagram is
    /// dropped and the session stays usable.
    pub fn on_datagram(&mut self, payload: &[u8], now: Instant) -> Result<()> {
        self.last_activity = now;
        let Some(link) = &self.link else {
            return Err(TunnelError::ChannelClosed);
        };
        match link.tx.try_send(Bytes::copy_from_slice(payload)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TunnelError::ResourceExhausted(format!(
                "UDP {} queue full",
                self.key
            ))),
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(TunnelError::ChannelClosed)
            }
        }
    }

    pub fn on_ready(&mut self) {
        self.ready = true;
        debug!("UDP {} relay ready", self.key);
    }

    /// Wrap a relay reply into a packet for the local side. The reply's
    /// source becomes the packet source.
    pub fn on_reply(&mut self, src: SocketAddr, data: &[u8], now: Instant, out: &mut Outbox) -> Result<()> {
        if self.state == UdpState::Closed {
            return Ok(());
        }
        self.last_activity = now;
        let src = match (src.ip(), self.key.local.ip()) {
            (IpAddr::V4(v4), IpAddr::V6(_)) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), src.port()),
            (IpAddr::V6(v6), IpAddr::V4(_)) => match v6.to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), src.port()),
                None => {
                    return Err(TunnelError::malformed(format!(
                        "IPv6 reply source {} for IPv4 flow {}",
                        src, self.key
                    )))
                }
            },
            _ => src,
        };
        out.push(build_udp(src, self.key.local, data)?);
        Ok(())
    }

    pub fn on_failed(&mut self, error: &TunnelError) {
        warn!("UDP {} relay failed: {}", self.key, error);
        self.close();
    }

    pub fn close(&mut self) {
        self.state = UdpState::Closed;
        self.link = None;
    }
}

#[cfg(test)]
impl DatagramLink {
    fn detached() -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(PENDING_DATAGRAMS);
        let link = Self {
            tx,
            cancel: CancellationToken::new(),
            _task: None,
        };
        (link, rx)
    }
}
