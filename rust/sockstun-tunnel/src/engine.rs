//! Tunnel engine
//!
//! [`Tunnel`] is the control surface: `init`, `run`, `stop`, `fini` and a
//! stats query. `run` drives a single-threaded event loop that multiplexes the
//! tun device, every session's relay task and the housekeeping timer.

use crate::config::Config;
use crate::device::{PacketDevice, TunFd};
use crate::error::{Result, TunnelError};
use crate::flow::{FlowEntry, FlowKey, FlowTable};
use crate::packet::{parse_packet, ParsedPacket, TcpInfo, TransportInfo};
use crate::session::{EventKind, Outbox, RelayContext, Session, SessionEvent, SessionId};
use crate::socks5::{Socks5Client, TargetAddr};
use crate::stats::{StatsSnapshot, TrafficStats, TunnelStats};
use crate::tcp::{reset_for_unknown, TcpParams, TcpSession, UpstreamLink};
use crate::udp::{DatagramLink, UdpParams, UdpSession};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest packet read from the device
pub const PACKET_BUFFER_SIZE: usize = 65535;
const EVENT_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Initialized,
    Running,
    Stopped,
    Finalized,
}

/// One engine instance, from `init` to `fini`.
///
/// `stop` and `stats` may be called from any thread while `run` blocks on
/// another; the other operations must be serialized by the caller.
pub struct Tunnel {
    config: Arc<Config>,
    stats: Arc<TunnelStats>,
    state: Mutex<TunnelState>,
    stop: CancellationToken,
    tun: Mutex<Option<TunFd>>,
}

impl Tunnel {
    /// Create an engine without a descriptor, to be driven by
    /// [`Tunnel::run_with_device`].
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            stats: Arc::new(TunnelStats::new()),
            state: Mutex::new(TunnelState::Initialized),
            stop: CancellationToken::new(),
            tun: Mutex::new(None),
        })
    }

    /// Validate `config` and take a duplicate of the tun descriptor `fd`.
    pub fn init(fd: RawFd, config: Config) -> Result<Self> {
        let tun = TunFd::dup(fd)?;
        let tunnel = Self::new(config)?;
        *tunnel.tun.lock() = Some(tun);
        info!(
            "tunnel initialized on fd {}, proxy {}",
            fd,
            tunnel.config.tcp_endpoint()
        );
        Ok(tunnel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// The four traffic counters, consistent with each other.
    pub fn stats(&self) -> TrafficStats {
        self.stats.traffic()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the event loop on the tun descriptor until [`Tunnel::stop`].
    ///
    /// Builds its own current-thread runtime, so it must not be called from
    /// inside one.
    pub fn run(&self) -> Result<()> {
        self.begin_run()?;
        let result = self.run_on_runtime();
        self.end_run();
        result
    }

    fn run_on_runtime(&self) -> Result<()> {
        let tun = self
            .tun
            .lock()
            .take()
            .ok_or(TunnelError::InvalidDescriptor(-1))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let device = tun.into_device()?;
            self.event_loop(device).await
        })
    }

    /// Run the event loop on `device` until [`Tunnel::stop`].
    pub async fn run_with_device<D: PacketDevice>(&self, device: D) -> Result<()> {
        self.begin_run()?;
        let result = self.event_loop(device).await;
        self.end_run();
        result
    }

    /// Request shutdown. Returns immediately; `run` drains the sessions and
    /// returns. A stop before `run` makes the next `run` return at once.
    pub fn stop(&self) -> Result<()> {
        let state = self.state.lock();
        if *state == TunnelState::Finalized {
            return Err(TunnelError::OrderingViolation("stop after fini"));
        }
        if !self.stop.is_cancelled() {
            info!("tunnel stop requested");
        }
        self.stop.cancel();
        Ok(())
    }

    /// Release the engine's resources. Only valid once `run` has returned.
    pub fn fini(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TunnelState::Running => Err(TunnelError::OrderingViolation("fini while running")),
            TunnelState::Finalized => Err(TunnelError::OrderingViolation("fini called twice")),
            TunnelState::Initialized | TunnelState::Stopped => {
                self.stop.cancel();
                self.tun.lock().take();
                *state = TunnelState::Finalized;
                info!("tunnel finalized: {}", self.stats.snapshot());
                Ok(())
            }
        }
    }

    fn begin_run(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            TunnelState::Initialized => {
                *state = TunnelState::Running;
                Ok(())
            }
            TunnelState::Running => Err(TunnelError::OrderingViolation("run while already running")),
            TunnelState::Stopped => Err(TunnelError::OrderingViolation("run after the tunnel stopped")),
            TunnelState::Finalized => Err(TunnelError::OrderingViolation("run after fini")),
        }
    }

    fn end_run(&self) {
        *self.state.lock() = TunnelState::Stopped;
    }

    async fn event_loop<D: PacketDevice>(&self, device: D) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let engine = Engine::new(device, &self.config, Arc::clone(&self.stats), events_tx, self.stop.clone());
        info!("tunnel running, mtu {}", self.config.tunnel.mtu);
        let result = engine.run(events_rx).await;
        match &result {
            Ok(()) => info!("tunnel stopped: {}", self.stats.snapshot()),
            Err(e) => warn!("tunnel loop failed: {}", e),
        }
        result
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// The event loop and everything it owns.
struct Engine<D> {
    device: D,
    stats: Arc<TunnelStats>,
    sessions: FlowTable<Session>,
    tcp_client: Arc<Socks5Client>,
    udp_client: Arc<Socks5Client>,
    tcp_params: TcpParams,
    udp_params: UdpParams,
    eviction_interval: Duration,
    events: mpsc::Sender<SessionEvent>,
    stop: CancellationToken,
    next_id: SessionId,
}

impl<D: PacketDevice> Engine<D> {
    fn new(
        device: D,
        config: &Config,
        stats: Arc<TunnelStats>,
        events: mpsc::Sender<SessionEvent>,
        stop: CancellationToken,
    ) -> Self {
        let misc = &config.misc;
        Self {
            device,
            stats,
            sessions: FlowTable::new(misc.session_limit()),
            tcp_client: Arc::new(Socks5Client::new(config.tcp_endpoint(), misc.connect_timeout())),
            udp_client: Arc::new(Socks5Client::new(config.udp_endpoint(), misc.connect_timeout())),
            tcp_params: TcpParams {
                mtu: config.tunnel.mtu,
                buffer_size: misc.tcp_buffer_size,
                idle_timeout: misc.tcp_idle_timeout(),
                closing_timeout: misc.tcp_closing_timeout(),
                retransmit_after: misc.eviction_interval(),
            },
            udp_params: UdpParams {
                idle_timeout: misc.udp_idle_timeout(),
                relay_mode: config.udp_relay_mode(),
                recv_buffer_size: misc.udp_recv_buffer_size,
            },
            eviction_interval: misc.eviction_interval(),
            events,
            stop,
            next_id: 1,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) -> Result<()> {
        let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
        let mut ticker = tokio::time::interval(self.eviction_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stop = self.stop.clone();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                read = self.device.recv(&mut buf) => match read {
                    Ok(0) => {
                        self.shutdown().await;
                        return Err(TunnelError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "tun device closed",
                        )));
                    }
                    Ok(n) => self.handle_packet(&buf[..n]).await,
                    Err(TunnelError::Io(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        self.shutdown().await;
                        return Err(e);
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = ticker.tick() => self.housekeeping().await,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn handle_packet(&mut self, data: &[u8]) {
        let packet = match parse_packet(data) {
            Ok(packet) => packet,
            Err(TunnelError::Unsupported(reason)) => {
                trace!("dropping unsupported packet: {}", reason);
                self.stats.record_unsupported();
                return;
            }
            Err(e) => {
                debug!("dropping malformed packet: {}", e);
                self.stats.record_malformed();
                return;
            }
        };
        self.stats.record_received(data.len());

        let now = Instant::now();
        let mut out = Outbox::new();
        match &packet.transport {
            TransportInfo::Tcp(seg) => self.handle_tcp(&packet, seg, now, &mut out),
            TransportInfo::Udp(udp) => {
                let key = FlowKey::udp(
                    SocketAddr::new(packet.src_addr, udp.src_port),
                    SocketAddr::new(packet.dst_addr, udp.dst_port),
                );
                self.handle_udp(key, packet.payload, now);
            }
            TransportInfo::Icmp | TransportInfo::Other(_) => {
                trace!("not relaying {:?} from {}", packet.protocol, packet.src_addr);
                self.stats.record_unsupported();
            }
        }
        self.flush(out).await;
    }

    fn handle_tcp(&mut self, packet: &ParsedPacket<'_>, seg: &TcpInfo, now: Instant, out: &mut Outbox) {
        let key = FlowKey::tcp(
            SocketAddr::new(packet.src_addr, seg.src_port),
            SocketAddr::new(packet.dst_addr, seg.dst_port),
        );

        if !(seg.flags.syn && !seg.flags.ack) {
            match self.sessions.get_mut(&key) {
                Some(Session::Tcp(session)) => {
                    if let Err(e) = session.on_segment(seg, packet.payload, now, out) {
                        debug!("TCP {} segment error: {}", key, e);
                    }
                    self.reap(&key);
                }
                _ if seg.flags.rst => {}
                _ => match reset_for_unknown(&key, seg, packet.payload.len()) {
                    Ok(rst) => {
                        trace!("TCP {} unknown flow, sending RST", key);
                        out.push(rst);
                    }
                    Err(e) => debug!("TCP {} RST build failed: {}", key, e),
                },
            }
            return;
        }

        // A SYN with a new sequence number replaces whatever the tuple held
        if let Some(Session::Tcp(existing)) = self.sessions.get_mut(&key) {
            if !existing.is_closed() && !existing.is_own_syn(seg) {
                debug!("TCP {} new SYN in state {}, replacing session", key, existing.state());
                if let Err(e) = existing.reset(out) {
                    debug!("TCP {} reset failed: {}", key, e);
                }
            }
        }
        self.reap(&key);

        let id = self.next_id;
        let params = self.tcp_params.clone();
        let created = self
            .sessions
            .lookup_or_create(key, || Ok(Session::Tcp(TcpSession::new(id, key, params, now))));
        match created {
            Ok((Session::Tcp(session), created)) => {
                if let Err(e) = session.on_syn(seg, out) {
                    debug!("TCP {} SYN error: {}", key, e);
                }
                if created {
                    self.next_id += 1;
                    let ctx = RelayContext {
                        id,
                        key,
                        events: self.events.clone(),
                        cancel: self.stop.child_token(),
                    };
                    session.attach(UpstreamLink::spawn(
                        ctx,
                        Arc::clone(&self.tcp_client),
                        TargetAddr::Ip(key.remote),
                        self.tcp_params.buffer_size,
                    ));
                    self.stats.record_tcp_session();
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{}", e);
                self.stats.record_dropped();
                if let Ok(rst) = reset_for_unknown(&key, seg, packet.payload.len()) {
                    out.push(rst);
                }
            }
        }
    }

    fn handle_udp(&mut self, key: FlowKey, payload: &[u8], now: Instant) {
        self.reap(&key);

        let id = self.next_id;
        let idle_timeout = self.udp_params.idle_timeout;
        let created = self
            .sessions
            .lookup_or_create(key, || Ok(Session::Udp(UdpSession::new(id, key, idle_timeout, now))));
        match created {
            Ok((Session::Udp(session), created)) => {
                if created {
                    self.next_id += 1;
                    let ctx = RelayContext {
                        id,
                        key,
                        events: self.events.clone(),
                        cancel: self.stop.child_token(),
                    };
                    session.attach(DatagramLink::spawn(
                        ctx,
                        Arc::clone(&self.udp_client),
                        &self.udp_params,
                        key.remote,
                    ));
                    self.stats.record_udp_session();
                    debug!("UDP {} new session", key);
                }
                if let Err(e) = session.on_datagram(payload, now) {
                    trace!("UDP {} datagram dropped: {}", key, e);
                    self.stats.record_dropped();
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("{}", e);
                self.stats.record_dropped();
            }
        }
        self.reap(&key);
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { id, key, kind } = event;
        let Some(session) = self.sessions.get_mut(&key) else {
            trace!("event for gone session {}", key);
            return;
        };
        if session.id() != id {
            trace!("stale event for {} (session {})", key, id);
            return;
        }

        let now = Instant::now();
        let mut out = Outbox::new();
        let result = match (session, kind) {
            (Session::Tcp(s), EventKind::Connected) => {
                s.on_connected();
                Ok(())
            }
            (Session::Tcp(s), EventKind::ConnectFailed(e)) => {
                self.stats.record_proxy_error();
                s.on_connect_failed(&e, &mut out)
            }
            (Session::Tcp(s), EventKind::Data(data)) => s.on_upstream_data(data, now, &mut out),
            (Session::Tcp(s), EventKind::Written(n)) => s.on_upstream_written(n, &mut out),
            (Session::Tcp(s), EventKind::Eof) => s.on_upstream_eof(now, &mut out),
            (Session::Tcp(s), EventKind::Failed(e)) => s.on_upstream_error(&e, &mut out),
            (Session::Udp(s), EventKind::Connected) => {
                s.on_ready();
                Ok(())
            }
            (Session::Udp(s), EventKind::ConnectFailed(e)) => {
                self.stats.record_proxy_error();
                s.on_failed(&e);
                Ok(())
            }
            (Session::Udp(s), EventKind::Failed(e)) => {
                s.on_failed(&e);
                Ok(())
            }
            (Session::Udp(s), EventKind::Datagram { src, data }) => s.on_reply(src, &data, now, &mut out),
            (_, kind) => {
                trace!("ignoring {:?} for {}", kind, key);
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("{} event error: {}", key, e);
            if e.is_malformed() {
                self.stats.record_dropped();
            }
        }
        self.reap(&key);
        self.flush(out).await;
    }

    /// Periodic work: retransmit timers, then eviction of idle and finished
    /// sessions.
    async fn housekeeping(&mut self) {
        let now = Instant::now();
        let mut out = Outbox::new();

        for (key, session) in self.sessions.iter_mut() {
            if let Session::Tcp(s) = session {
                if let Err(e) = s.on_tick(now, &mut out) {
                    debug!("TCP {} tick error: {}", key, e);
                }
            }
        }

        for (key, mut session) in self.sessions.evict_idle(now) {
            if let Session::Tcp(s) = &mut session {
                if let Err(e) = s.reset(&mut out) {
                    debug!("TCP {} reset failed: {}", key, e);
                }
            }
            debug!("evicted {}", key);
            self.retire(session);
        }

        self.flush(out).await;
    }

    /// Remove the session for `key` if it has finished.
    fn reap(&mut self, key: &FlowKey) {
        if self.sessions.get_mut(key).is_some_and(|s| s.is_closed()) {
            if let Some(session) = self.sessions.remove(key) {
                trace!("removed {}", key);
                self.retire(session);
            }
        }
    }

    fn retire(&self, session: Session) {
        match session {
            Session::Tcp(_) => self.stats.record_tcp_closed(),
            Session::Udp(_) => self.stats.record_udp_closed(),
        }
    }

    async fn flush(&mut self, out: Outbox) {
        for _ in 0..out.retransmits {
            self.stats.record_retransmit();
        }
        for packet in out.packets {
            match self.device.send(&packet).await {
                Ok(()) => self.stats.record_sent(packet.len()),
                Err(e) => {
                    warn!("tun write failed: {}", e);
                    self.stats.record_dropped();
                }
            }
        }
    }

    /// Reset every TCP session toward the local side and drop all sessions,
    /// which cancels their relay tasks.
    async fn shutdown(&mut self) {
        let mut out = Outbox::new();
        let sessions = self.sessions.drain();
        if !sessions.is_empty() {
            info!("closing {} sessions", sessions.len());
        }
        for (key, mut session) in sessions {
            match &mut session {
                Session::Tcp(s) => {
                    if let Err(e) = s.reset(&mut out) {
                        debug!("TCP {} reset failed: {}", key, e);
                    }
                }
                Session::Udp(s) => s.close(),
            }
            self.retire(session);
        }
        self.flush(out).await;
    }
}
