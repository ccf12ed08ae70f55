//! TCP session management
//!
//! The local side of every captured connection is terminated here: the SYN is
//! answered at once with a SYN-ACK while the SOCKS5 CONNECT runs in the
//! background, then payload is relayed in both directions. The state machine
//! is synchronous and owned by the event loop; the upstream socket is driven
//! by a relay task that talks to it through [`UpstreamLink`].

use crate::error::{Result, TunnelError};
use crate::flow::FlowKey;
use crate::packet::{
    build_tcp, mss_for_mtu, TcpFlags, TcpInfo, TcpSegment, DEFAULT_MSS_V4, DEFAULT_MSS_V6,
};
use crate::session::{EventKind, Outbox, RelayContext, SessionId};
use crate::socks5::{Socks5Client, TargetAddr};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

/// Duplicate ACKs that trigger a fast retransmit
const DUP_ACK_THRESHOLD: u32 = 3;
const MAX_READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Handshaking,
    Connecting,
    Established,
    Closing,
    Closed,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-session TCP parameters, derived from the engine configuration.
#[derive(Debug, Clone)]
pub struct TcpParams {
    pub mtu: u32,
    /// Bytes buffered per direction
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub closing_timeout: Duration,
    /// Time without ACK progress before the oldest segment is resent
    pub retransmit_after: Duration,
}

/// Check if `a` is before `b` (handling wraparound)
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

enum WriteCommand {
    Data(Bytes),
    Shutdown,
}

/// Event-loop side of a relay task. Dropping it cancels the task and closes
/// the upstream socket.
pub struct UpstreamLink {
    writer: mpsc::UnboundedSender<WriteCommand>,
    credits: Arc<Semaphore>,
    cancel: CancellationToken,
    _task: Option<AbortOnDropHandle<()>>,
}

impl UpstreamLink {
    /// Spawn the relay task: SOCKS5 CONNECT to `target`, then pump bytes.
    pub fn spawn(
        ctx: RelayContext,
        client: Arc<Socks5Client>,
        target: TargetAddr,
        buffer_size: usize,
    ) -> Self {
        let (writer, writes) = mpsc::unbounded_channel();
        let credits = Arc::new(Semaphore::new(buffer_size));
        let cancel = ctx.cancel.clone();
        let read_chunk = buffer_size.clamp(1, MAX_READ_CHUNK);
        let task = tokio::spawn(relay_tcp(
            ctx,
            client,
            target,
            Arc::clone(&credits),
            writes,
            read_chunk,
        ));
        Self {
            writer,
            credits,
            cancel,
            _task: Some(AbortOnDropHandle::new(task)),
        }
    }

    fn write(&self, data: Bytes) -> bool {
        self.writer.send(WriteCommand::Data(data)).is_ok()
    }

    fn shutdown(&self) {
        let _ = self.writer.send(WriteCommand::Shutdown);
    }

    /// Return flow-control credit for bytes the local side acknowledged
    fn release(&self, bytes: usize) {
        if bytes > 0 {
            self.credits.add_permits(bytes);
        }
    }
}

impl Drop for UpstreamLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_tcp(
    ctx: RelayContext,
    client: Arc<Socks5Client>,
    target: TargetAddr,
    credits: Arc<Semaphore>,
    mut writes: mpsc::UnboundedReceiver<WriteCommand>,
    read_chunk: usize,
) {
    let connected = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        result = client.connect(&target) => result,
    };
    let stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            ctx.emit(EventKind::ConnectFailed(e)).await;
            return;
        }
    };
    if !ctx.emit(EventKind::Connected).await {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();

    let upload = async {
        while let Some(cmd) = writes.recv().await {
            match cmd {
                WriteCommand::Data(data) => {
                    writer.write_all(&data).await?;
                    if !ctx.emit(EventKind::Written(data.len())).await {
                        break;
                    }
                }
                WriteCommand::Shutdown => {
                    writer.shutdown().await?;
                    break;
                }
            }
        }
        Ok::<(), TunnelError>(())
    };

    let download = async {
        let mut buf = vec![0u8; read_chunk];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                ctx.emit(EventKind::Eof).await;
                return Ok::<(), TunnelError>(());
            }
            // Blocks until the local side has acknowledged enough earlier data
            match credits.acquire_many(n as u32).await {
                Ok(permit) => permit.forget(),
                Err(_) => return Ok(()),
            }
            if !ctx.emit(EventKind::Data(Bytes::copy_from_slice(&buf[..n]))).await {
                return Ok(());
            }
        }
    };

    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        result = async { tokio::try_join!(upload, download) } => result,
    };
    if let Err(e) = result {
        ctx.emit(EventKind::Failed(e)).await;
    }
}

/// One captured TCP connection.
pub struct TcpSession {
    id: SessionId,
    key: FlowKey,
    state: TcpState,
    params: TcpParams,

    iss: u32,
    /// Sequence number of the local side's SYN
    irs: u32,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    mss: u16,
    peer_window: u32,
    last_advertised: u16,

    /// Local bytes handed to the relay task but not yet written upstream
    upstream_backlog: usize,
    /// Upstream bytes waiting for the local receive window
    send_queue: VecDeque<Bytes>,
    /// Sent to the local side, not yet acknowledged
    unacked: VecDeque<(u32, Bytes)>,
    dup_acks: u32,

    local_fin: bool,
    upstream_eof: bool,
    upstream_connected: bool,
    fin_seq: Option<u32>,

    last_activity: Instant,
    last_progress: Instant,
    closing_since: Option<Instant>,

    link: Option<UpstreamLink>,
}

impl TcpSession {
    pub fn new(id: SessionId, key: FlowKey, params: TcpParams, now: Instant) -> Self {
        let iss: u32 = rand::random();
        Self {
            id,
            key,
            state: TcpState::Handshaking,
            params,
            iss,
            irs: 0,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt: 0,
            mss: DEFAULT_MSS_V4,
            peer_window: 0,
            last_advertised: 0,
            upstream_backlog: 0,
            send_queue: VecDeque::new(),
            unacked: VecDeque::new(),
            dup_acks: 0,
            local_fin: false,
            upstream_eof: false,
            upstream_connected: false,
            fin_seq: None,
            last_activity: now,
            last_progress: now,
            closing_since: None,
            link: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn mss(&self) -> u16 {
        self.mss
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// The proxy accepted the CONNECT
    pub fn is_connected(&self) -> bool {
        self.upstream_connected
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn idle_timeout(&self) -> Duration {
        self.params.idle_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Idle past the timeout, or lingering in `Closing` too long
    pub fn is_expired(&self, now: Instant) -> bool {
        if let Some(since) = self.closing_since {
            if now.saturating_duration_since(since) > self.params.closing_timeout {
                return true;
            }
        }
        now.saturating_duration_since(self.last_activity) > self.params.idle_timeout
    }

    /// Attach the relay task opened for this session
    pub fn attach(&mut self, link: UpstreamLink) {
        self.link = Some(link);
    }

    /// Window advertised to the local side, bounded by free relay buffer
    pub fn recv_window(&self) -> u16 {
        self.params
            .buffer_size
            .saturating_sub(self.upstream_backlog)
            .min(u16::MAX as usize) as u16
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq.is_some_and(|fin| seq_lt(fin, self.snd_una))
    }

    /// Whether `seg` is the SYN this session was opened with. A SYN with any
    /// other sequence number starts a new connection on the same tuple.
    pub fn is_own_syn(&self, seg: &TcpInfo) -> bool {
        self.state == TcpState::Handshaking || seg.seq == self.irs
    }

    /// Handle a SYN from the local side: answer with SYN-ACK and move on to
    /// `Connecting`. A retransmitted SYN gets the same SYN-ACK again.
    pub fn on_syn(&mut self, seg: &TcpInfo, out: &mut Outbox) -> Result<()> {
        if self.state != TcpState::Handshaking {
            if seg.seq == self.irs && self.snd_una == self.iss {
                trace!("TCP SYN retransmit: {}", self.key);
                self.send_syn_ack(out)?;
            }
            return Ok(());
        }

        let ipv6 = self.key.local.is_ipv6();
        let local_mss = mss_for_mtu(ipv6, self.params.mtu);
        let default_mss = if ipv6 { DEFAULT_MSS_V6 } else { DEFAULT_MSS_V4 };

        self.irs = seg.seq;
        self.rcv_nxt = seg.seq.wrapping_add(1);
        self.mss = seg.mss.unwrap_or(default_mss).min(local_mss).max(1);
        self.peer_window = seg.window as u32;
        self.send_syn_ack(out)?;
        self.state = TcpState::Connecting;
        debug!("TCP SYN {} mss {}", self.key, self.mss);
        Ok(())
    }

    fn send_syn_ack(&mut self, out: &mut Outbox) -> Result<()> {
        let mss = mss_for_mtu(self.key.local.is_ipv6(), self.params.mtu);
        self.emit(out, self.iss, TcpFlags::syn_ack(), &[], Some(mss))
    }

    /// Handle a non-SYN segment from the local side.
    pub fn on_segment(
        &mut self,
        seg: &TcpInfo,
        payload: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<()> {
        self.last_activity = now;

        if seg.flags.rst {
            debug!("TCP RST from local: {}", self.key);
            self.state = TcpState::Closed;
            return Ok(());
        }
        if seg.flags.syn {
            return self.on_syn(seg, out);
        }
        if self.state == TcpState::Closed || !seg.flags.ack {
            return Ok(());
        }

        let pure_ack = payload.is_empty() && !seg.flags.fin;
        self.process_ack(seg, pure_ack, now, out)?;

        let mut need_ack = false;
        if !payload.is_empty() {
            self.process_data(seg.seq, payload);
            need_ack = true;
        }

        if seg.flags.fin {
            let fin_seq = seg.seq.wrapping_add(payload.len() as u32);
            if fin_seq == self.rcv_nxt && !self.local_fin {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.local_fin = true;
                self.enter_closing(now);
                if let Some(link) = &self.link {
                    link.shutdown();
                }
                debug!("TCP FIN from local: {}", self.key);
            }
            need_ack = true;
        }

        let sent = self.flush_send(now, out)?;
        if need_ack && sent == 0 {
            self.emit(out, self.snd_nxt, TcpFlags::ack_only(), &[], None)?;
        }
        self.check_closed();
        Ok(())
    }

    fn process_ack(&mut self, seg: &TcpInfo, pure_ack: bool, now: Instant, out: &mut Outbox) -> Result<()> {
        let ack = seg.ack;
        self.peer_window = seg.window as u32;

        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            let mut released = 0;
            while let Some((seq, data)) = self.unacked.front_mut() {
                let end = seq.wrapping_add(data.len() as u32);
                if seq_le(end, ack) {
                    released += data.len();
                    self.unacked.pop_front();
                } else {
                    if seq_lt(*seq, ack) {
                        let n = ack.wrapping_sub(*seq) as usize;
                        data.advance(n);
                        *seq = ack;
                        released += n;
                    }
                    break;
                }
            }
            self.snd_una = ack;
            self.dup_acks = 0;
            self.last_progress = now;
            if let Some(link) = &self.link {
                link.release(released);
            }
        } else if ack == self.snd_una && pure_ack && !self.unacked.is_empty() {
            self.dup_acks += 1;
            if self.dup_acks == DUP_ACK_THRESHOLD {
                trace!("TCP fast retransmit: {} seq {}", self.key, self.snd_una);
                self.retransmit_oldest(out)?;
            }
        }
        Ok(())
    }

    fn process_data(&mut self, seq: u32, payload: &[u8]) {
        if self.local_fin {
            return;
        }

        let end = seq.wrapping_add(payload.len() as u32);
        if seq_le(end, self.rcv_nxt) {
            trace!("TCP duplicate segment: {} seq {}", self.key, seq);
            return;
        }
        if seq_lt(self.rcv_nxt, seq) {
            trace!("TCP out of order: {} seq {} expected {}", self.key, seq, self.rcv_nxt);
            return;
        }

        let fresh = &payload[self.rcv_nxt.wrapping_sub(seq) as usize..];
        let room = self.params.buffer_size.saturating_sub(self.upstream_backlog);
        let take = fresh.len().min(room);
        if take == 0 {
            return;
        }

        let Some(link) = &self.link else {
            return;
        };
        if !link.write(Bytes::copy_from_slice(&fresh[..take])) {
            return;
        }
        self.upstream_backlog += take;
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
    }

    /// Send queued upstream data within the local receive window, then FIN
    /// once upstream has finished. Returns the number of segments sent.
    fn flush_send(&mut self, now: Instant, out: &mut Outbox) -> Result<usize> {
        // The SYN-ACK must be acknowledged before any data goes out
        if self.snd_una == self.iss || self.state == TcpState::Closed {
            return Ok(0);
        }

        let mut sent = 0;
        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
            let usable = (self.peer_window as usize).saturating_sub(in_flight);
            let chunk = {
                let Some(front) = self.send_queue.front_mut() else {
                    break;
                };
                let n = front.len().min(self.mss as usize).min(usable);
                if n == 0 {
                    break;
                }
                let chunk = front.split_to(n);
                if front.is_empty() {
                    self.send_queue.pop_front();
                }
                chunk
            };

            if in_flight == 0 {
                self.last_progress = now;
            }
            let seq = self.snd_nxt;
            self.emit(out, seq, TcpFlags::psh_ack(), &chunk, None)?;
            self.snd_nxt = self.snd_nxt.wrapping_add(chunk.len() as u32);
            self.unacked.push_back((seq, chunk));
            sent += 1;
        }

        if self.send_queue.is_empty() && self.upstream_eof && self.fin_seq.is_none() {
            if self.snd_nxt == self.snd_una {
                self.last_progress = now;
            }
            let seq = self.snd_nxt;
            self.emit(out, seq, TcpFlags::fin_ack(), &[], None)?;
            self.fin_seq = Some(seq);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            sent += 1;
            debug!("TCP FIN to local: {}", self.key);
        }
        Ok(sent)
    }

    fn retransmit_oldest(&mut self, out: &mut Outbox) -> Result<()> {
        if let Some((seq, data)) = self.unacked.front().cloned() {
            self.emit(out, seq, TcpFlags::psh_ack(), &data, None)?;
            out.retransmits += 1;
        } else if let (Some(fin), false) = (self.fin_seq, self.fin_acked()) {
            self.emit(out, fin, TcpFlags::fin_ack(), &[], None)?;
            out.retransmits += 1;
        }
        Ok(())
    }

    /// Housekeeping: resend what the local side has not acknowledged for a
    /// full retransmit interval.
    pub fn on_tick(&mut self, now: Instant, out: &mut Outbox) -> Result<()> {
        if matches!(self.state, TcpState::Closed | TcpState::Handshaking) {
            return Ok(());
        }
        if now.saturating_duration_since(self.last_progress) < self.params.retransmit_after {
            return Ok(());
        }

        if self.snd_una == self.iss {
            self.send_syn_ack(out)?;
            out.retransmits += 1;
            self.last_progress = now;
        } else if !self.unacked.is_empty() || (self.fin_seq.is_some() && !self.fin_acked()) {
            trace!("TCP timer retransmit: {} seq {}", self.key, self.snd_una);
            self.retransmit_oldest(out)?;
            self.last_progress = now;
        }
        Ok(())
    }

    pub fn on_connected(&mut self) {
        self.upstream_connected = true;
        if self.state == TcpState::Connecting {
            self.state = TcpState::Established;
        }
        info!("TCP {} established via proxy", self.key);
    }

    /// CONNECT failed: reset the local side, never retried.
    pub fn on_connect_failed(&mut self, error: &TunnelError, out: &mut Outbox) -> Result<()> {
        warn!("TCP {} proxy connect failed: {}", self.key, error);
        self.reset(out)
    }

    pub fn on_upstream_data(&mut self, data: Bytes, now: Instant, out: &mut Outbox) -> Result<()> {
        if self.state == TcpState::Closed {
            return Ok(());
        }
        self.last_activity = now;
        self.send_queue.push_back(data);
        self.flush_send(now, out)?;
        Ok(())
    }

    /// Bytes reached the upstream socket; reopen the window if it was small
    pub fn on_upstream_written(&mut self, bytes: usize, out: &mut Outbox) -> Result<()> {
        self.upstream_backlog = self.upstream_backlog.saturating_sub(bytes);
        if self.state == TcpState::Closed {
            return Ok(());
        }

        let threshold = (self.mss as usize).min(self.params.buffer_size / 2).max(1);
        let window = self.recv_window() as usize;
        if (self.last_advertised as usize) < threshold && window >= threshold {
            trace!("TCP window update: {} window {}", self.key, window);
            self.emit(out, self.snd_nxt, TcpFlags::ack_only(), &[], None)?;
        }
        Ok(())
    }

    pub fn on_upstream_eof(&mut self, now: Instant, out: &mut Outbox) -> Result<()> {
        if self.state == TcpState::Closed {
            return Ok(());
        }
        self.upstream_eof = true;
        self.enter_closing(now);
        self.flush_send(now, out)?;
        self.check_closed();
        Ok(())
    }

    pub fn on_upstream_error(&mut self, error: &TunnelError, out: &mut Outbox) -> Result<()> {
        debug!("TCP {} upstream failed: {}", self.key, error);
        self.reset(out)
    }

    /// Send RST to the local side and close.
    pub fn reset(&mut self, out: &mut Outbox) -> Result<()> {
        if self.state == TcpState::Closed {
            return Ok(());
        }
        self.state = TcpState::Closed;
        self.link = None;
        self.emit(out, self.snd_nxt, TcpFlags::rst_ack(), &[], None)
    }

    fn enter_closing(&mut self, now: Instant) {
        if matches!(self.state, TcpState::Connecting | TcpState::Established) {
            self.state = TcpState::Closing;
            self.closing_since = Some(now);
        }
    }

    fn check_closed(&mut self) {
        if self.local_fin && self.fin_acked() && self.state != TcpState::Closed {
            debug!("TCP {} closed", self.key);
            self.state = TcpState::Closed;
        }
    }

    fn emit(
        &mut self,
        out: &mut Outbox,
        seq: u32,
        flags: TcpFlags,
        payload: &[u8],
        mss: Option<u16>,
    ) -> Result<()> {
        let window = self.recv_window();
        self.last_advertised = window;
        let packet = build_tcp(&TcpSegment {
            src: self.key.remote,
            dst: self.key.local,
            seq,
            ack: self.rcv_nxt,
            flags,
            window,
            mss,
            payload,
        })?;
        out.push(packet);
        Ok(())
    }

    #[cfg(test)]
    fn iss(&self) -> u32 {
        self.iss
    }
}

/// RST answering a segment that belongs to no session (RFC 793 reset
/// generation).
pub fn reset_for_unknown(key: &FlowKey, seg: &TcpInfo, payload_len: usize) -> Result<Vec<u8>> {
    let (seq, ack, flags) = if seg.flags.ack {
        (seg.ack, 0, TcpFlags::rst_only())
    } else {
        let mut seg_len = payload_len as u32;
        if seg.flags.syn {
            seg_len += 1;
        }
        if seg.flags.fin {
            seg_len += 1;
        }
        (0, seg.seq.wrapping_add(seg_len), TcpFlags::rst_ack())
    };
    build_tcp(&TcpSegment {
        src: key.remote,
        dst: key.local,
        seq,
        ack,
        flags,
        window: 0,
        mss: None,
        payload: &[],
    })
}

#[cfg(test)]
impl UpstreamLink {
    /// Link with no task behind it; writes land in the returned receiver.
    fn detached() -> (Self, mpsc::UnboundedReceiver<WriteCommand>, Arc<Semaphore>) {
        let (writer, writes) = mpsc::unbounded_channel();
        let credits = Arc::new(Semaphore::new(0));
        let link = Self {
            writer,
            credits: Arc::clone(&credits),
            cancel: CancellationToken::new(),
            _task: None,
        };
        (link, writes, credits)
    }
}
