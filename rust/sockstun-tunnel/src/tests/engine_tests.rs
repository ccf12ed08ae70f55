//! Event loop scenarios against a scripted SOCKS5 server on loopback

use crate::config::{Config, UdpRelayMode, UdpServerConfig};
use crate::device::{ChannelDevice, ChannelPeer};
use crate::engine::{Tunnel, TunnelState};
use crate::error::Result;
use crate::packet::{build_tcp, build_udp, parse_packet, TcpFlags, TcpInfo, TcpSegment, TransportInfo};
use crate::socks5::{decode_udp_datagram, encode_udp_datagram, encode_udp_frame, read_udp_frame, TargetAddr};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn local() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

fn remote() -> SocketAddr {
    "93.184.216.34:80".parse().unwrap()
}

fn dns_server() -> SocketAddr {
    "8.8.8.8:53".parse().unwrap()
}

/// How the scripted proxy answers.
#[derive(Debug, Clone, Copy, Default)]
struct Script {
    /// Reply code for every request
    reply: u8,
    /// Answer UDP ASSOCIATE with BND.ADDR 0.0.0.0
    unspecified_bind: bool,
    /// Close the ASSOCIATE control stream after the first echoed datagram
    close_control_after_echo: bool,
}

/// Requests seen by the scripted proxy, and notice of closed streams.
struct ScriptedProxy {
    port: u16,
    requests: mpsc::UnboundedReceiver<(u8, TargetAddr)>,
    closed: mpsc::UnboundedReceiver<()>,
}

impl ScriptedProxy {
    /// Answer every request with `reply`; successful streams echo.
    async fn start(reply: u8) -> Self {
        Self::with_script(Script {
            reply,
            ..Default::default()
        })
        .await
    }

    async fn with_script(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (req_tx, requests) = mpsc::unbounded_channel();
        let (closed_tx, closed) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, script, req_tx.clone(), closed_tx.clone()));
            }
        });
        Self { port, requests, closed }
    }

    async fn next_request(&mut self) -> (u8, TargetAddr) {
        timeout(WAIT, self.requests.recv()).await.unwrap().unwrap()
    }

    async fn no_more_requests(&mut self) -> bool {
        timeout(Duration::from_millis(200), self.requests.recv()).await.is_err()
    }
}

async fn serve(
    mut stream: TcpStream,
    script: Script,
    requests: mpsc::UnboundedSender<(u8, TargetAddr)>,
    closed: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut req = [0u8; 3];
    stream.read_exact(&mut req).await?;
    let target = TargetAddr::read_from(&mut stream).await?;
    let _ = requests.send((req[1], target));

    if script.reply != 0x00 {
        stream.write_all(&[0x05, script.reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
        return Ok(());
    }

    match req[1] {
        0x03 => {
            let relay = UdpSocket::bind("127.0.0.1:0").await?;
            let port = relay.local_addr()?.port().to_be_bytes();
            let bind = if script.unspecified_bind { [0, 0, 0, 0] } else { [127, 0, 0, 1] };
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, bind[0], bind[1], bind[2], bind[3], port[0], port[1]])
                .await?;
            let mut buf = vec![0u8; 65535];
            let mut control = [0u8; 16];
            loop {
                tokio::select! {
                    received = relay.recv_from(&mut buf) => {
                        let (n, peer) = received?;
                        let (dst, payload) = decode_udp_datagram(&buf[..n])?;
                        let echo = encode_udp_datagram(&dst, payload)?;
                        relay.send_to(&echo, peer).await?;
                        if script.close_control_after_echo {
                            break;
                        }
                    }
                    read = stream.read(&mut control) => {
                        if read.unwrap_or(0) == 0 {
                            break;
                        }
                    }
                }
            }
        }
        0x05 => {
            stream.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            let (mut reader, mut writer) = stream.split();
            while let Ok((dst, data)) = read_udp_frame(&mut reader).await {
                writer.write_all(&encode_udp_frame(&dst, &data)?).await?;
            }
        }
        _ => {
            stream.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await?;
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stream.write_all(&buf[..n]).await?,
                }
            }
        }
    }
    let _ = closed.send(());
    Ok(())
}

struct Harness {
    tunnel: Arc<Tunnel>,
    peer: ChannelPeer,
    runner: JoinHandle<Result<()>>,
}

impl Harness {
    fn start(config: Config) -> Self {
        let tunnel = Arc::new(Tunnel::new(config).unwrap());
        let (device, peer) = ChannelDevice::pair(64);
        let runner = {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move { tunnel.run_with_device(device).await })
        };
        Self { tunnel, peer, runner }
    }

    async fn inject(&self, packet: Vec<u8>) {
        self.peer.inject.send(packet).await.unwrap();
    }

    async fn next_packet(&mut self) -> Vec<u8> {
        timeout(WAIT, self.peer.written.recv()).await.unwrap().unwrap()
    }

    /// Next TCP segment written to the device, with its payload.
    async fn next_tcp(&mut self) -> (TcpInfo, Vec<u8>) {
        loop {
            let packet = self.next_packet().await;
            let parsed = parse_packet(&packet).unwrap();
            if let TransportInfo::Tcp(seg) = &parsed.transport {
                return (seg.clone(), parsed.payload.to_vec());
            }
        }
    }

    /// Next TCP segment that carries data.
    async fn next_tcp_data(&mut self) -> (TcpInfo, Vec<u8>) {
        loop {
            let (seg, payload) = self.next_tcp().await;
            if !payload.is_empty() {
                return (seg, payload);
            }
        }
    }

    /// Next RST written to the device, skipping retransmitted SYN-ACKs.
    async fn next_rst(&mut self) -> TcpInfo {
        loop {
            let (seg, _) = self.next_tcp().await;
            if seg.flags.rst {
                return seg;
            }
        }
    }

    async fn wait_until(&self, what: &str, check: impl Fn(&Tunnel) -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !check(&self.tunnel) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(self) -> Arc<Tunnel> {
        self.tunnel.stop().unwrap();
        timeout(WAIT, self.runner).await.unwrap().unwrap().unwrap();
        self.tunnel
    }
}

fn config(port: u16) -> Config {
    let mut config = Config::for_server("127.0.0.1", port);
    config.misc.eviction_interval = 50;
    config
}

fn segment(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
    build_tcp(&TcpSegment {
        src: local(),
        dst: remote(),
        seq,
        ack,
        flags,
        window: 65535,
        mss: flags.syn.then_some(1460),
        payload,
    })
    .unwrap()
}

/// SYN, SYN-ACK, ACK. Returns the tunnel's next sequence number.
async fn open_connection(harness: &mut Harness) -> u32 {
    harness.inject(segment(1000, 0, TcpFlags::syn_only(), b"")).await;
    let (syn_ack, _) = harness.next_tcp().await;
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack, 1001);
    let iss = syn_ack.seq;
    harness
        .inject(segment(1001, iss.wrapping_add(1), TcpFlags::ack_only(), b""))
        .await;
    iss.wrapping_add(1)
}

#[tokio::test]
async fn test_syn_answered_locally_with_single_connect() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    harness.inject(segment(1000, 0, TcpFlags::syn_only(), b"")).await;
    let (syn_ack, _) = harness.next_tcp().await;
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack, 1001);
    assert!(syn_ack.mss.is_some());

    let (command, target) = proxy.next_request().await;
    assert_eq!(command, 0x01);
    assert_eq!(target, TargetAddr::Ip(remote()));

    // A retransmitted SYN is answered again but opens nothing new
    harness.inject(segment(1000, 0, TcpFlags::syn_only(), b"")).await;
    let (again, _) = harness.next_tcp().await;
    assert!(again.flags.syn && again.flags.ack);
    assert_eq!(again.seq, syn_ack.seq);
    assert!(proxy.no_more_requests().await);

    let traffic = harness.tunnel.stats();
    assert_eq!(traffic.rx_packets, 2);
    assert!(traffic.tx_packets >= 2);
    assert_eq!(harness.tunnel.stats_snapshot().tcp_sessions_total, 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_tcp_payload_relayed_both_ways() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    let snd = open_connection(&mut harness).await;
    proxy.next_request().await;
    harness
        .inject(segment(1001, snd, TcpFlags::psh_ack(), b"hello proxy"))
        .await;

    let (seg, payload) = harness.next_tcp_data().await;
    assert_eq!(payload, b"hello proxy");
    assert_eq!(seg.seq, snd);
    assert_eq!(seg.ack, 1001 + 11);
    harness
        .inject(segment(1012, snd.wrapping_add(11), TcpFlags::ack_only(), b""))
        .await;

    let tunnel = harness.stop().await;
    let snapshot = tunnel.stats_snapshot();
    assert_eq!(snapshot.tcp_sessions_active, 0);
    assert_eq!(snapshot.proxy_errors, 0);
}

#[tokio::test]
async fn test_connect_refused_resets_and_removes_session() {
    let mut proxy = ScriptedProxy::start(0x05).await;
    let mut harness = Harness::start(config(proxy.port));

    harness.inject(segment(1000, 0, TcpFlags::syn_only(), b"")).await;
    let (syn_ack, _) = harness.next_tcp().await;
    assert!(syn_ack.flags.syn);
    proxy.next_request().await;

    let rst = harness.next_rst().await;
    assert_eq!(rst.ack, 1001);
    assert_eq!(rst.seq, syn_ack.seq.wrapping_add(1));
    harness
        .wait_until("session removal", |t| t.stats_snapshot().tcp_sessions_active == 0)
        .await;
    assert_eq!(harness.tunnel.stats_snapshot().proxy_errors, 1);

    // The tuple is unknown again: stray segments get a RST and no retry happens
    harness
        .inject(segment(1001, syn_ack.seq.wrapping_add(1), TcpFlags::ack_only(), b""))
        .await;
    harness.next_rst().await;
    assert!(proxy.no_more_requests().await);
    harness.stop().await;
}

#[tokio::test]
async fn test_unreachable_proxy_resets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut harness = Harness::start(config(port));

    harness.inject(segment(1000, 0, TcpFlags::syn_only(), b"")).await;
    let (syn_ack, _) = harness.next_tcp().await;
    assert!(syn_ack.flags.syn);
    let rst = harness.next_rst().await;
    assert_eq!(rst.ack, 1001);
    assert_eq!(harness.tunnel.stats_snapshot().proxy_errors, 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_flow_segments() {
    let proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    harness.inject(segment(500, 77, TcpFlags::ack_only(), b"")).await;
    let rst = harness.next_rst().await;
    assert_eq!(rst.seq, 77);

    // RST for an unknown tuple is swallowed
    harness.inject(segment(500, 0, TcpFlags::rst_only(), b"")).await;
    harness
        .wait_until("second packet", |t| t.stats().rx_packets == 2)
        .await;
    assert!(timeout(Duration::from_millis(200), harness.peer.written.recv())
        .await
        .is_err());
    assert_eq!(harness.tunnel.stats_snapshot().tcp_sessions_total, 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_malformed_packets_touch_no_traffic_counters() {
    let proxy = ScriptedProxy::start(0x00).await;
    let harness = Harness::start(config(proxy.port));

    let mut truncated = segment(1000, 0, TcpFlags::syn_only(), b"");
    truncated.truncate(30);
    harness.inject(truncated).await;
    harness.inject(vec![0x45, 0x00]).await;
    harness.inject(vec![0x20; 40]).await;

    harness
        .wait_until("malformed count", |t| t.stats_snapshot().malformed_packets == 3)
        .await;
    let snapshot = harness.tunnel.stats_snapshot();
    assert_eq!(snapshot.traffic.rx_packets, 0);
    assert_eq!(snapshot.traffic.rx_bytes, 0);
    assert_eq!(snapshot.traffic.tx_packets, 0);
    assert_eq!(snapshot.tcp_sessions_total, 0);
    harness.stop().await;
}

#[tokio::test]
async fn test_udp_datagrams_share_one_association() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    harness.inject(build_udp(local(), dns_server(), b"query-1").unwrap()).await;
    harness.inject(build_udp(local(), dns_server(), b"query-2").unwrap()).await;

    let (command, _) = proxy.next_request().await;
    assert_eq!(command, 0x03);

    let mut replies = Vec::new();
    for _ in 0..2 {
        let packet = harness.next_packet().await;
        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.src_socket(), Some(dns_server()));
        assert_eq!(parsed.dst_socket(), Some(local()));
        replies.push(parsed.payload.to_vec());
    }
    replies.sort();
    assert_eq!(replies, vec![b"query-1".to_vec(), b"query-2".to_vec()]);
    assert!(proxy.no_more_requests().await);

    let snapshot = harness.tunnel.stats_snapshot();
    assert_eq!(snapshot.udp_sessions_total, 1);
    assert_eq!(snapshot.traffic.rx_packets, 2);
    assert_eq!(snapshot.traffic.tx_packets, 2);
    harness.stop().await;
}

#[tokio::test]
async fn test_udp_in_tcp_relay() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut config = config(proxy.port);
    config.socks5.udp = Some(UdpServerConfig {
        udp_relay: UdpRelayMode::Tcp,
        ..Default::default()
    });
    let mut harness = Harness::start(config);

    harness.inject(build_udp(local(), dns_server(), b"framed").unwrap()).await;
    let (command, _) = proxy.next_request().await;
    assert_eq!(command, 0x05);

    let packet = harness.next_packet().await;
    let parsed = parse_packet(&packet).unwrap();
    assert_eq!(parsed.src_socket(), Some(dns_server()));
    assert_eq!(parsed.payload, b"framed");
    harness.stop().await;
}

#[tokio::test]
async fn test_idle_udp_session_evicted() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut config = config(proxy.port);
    config.misc.udp_read_write_timeout = 100;
    let mut harness = Harness::start(config);

    harness.inject(build_udp(local(), dns_server(), b"ping").unwrap()).await;
    proxy.next_request().await;
    harness.next_packet().await;

    harness
        .wait_until("eviction", |t| t.stats_snapshot().udp_sessions_active == 0)
        .await;
    // The association's control stream is closed with the session
    timeout(WAIT, proxy.closed.recv()).await.unwrap().unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_session_limit_refuses_new_flows() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut config = config(proxy.port);
    config.misc.max_session_count = 1;
    let mut harness = Harness::start(config);

    open_connection(&mut harness).await;
    proxy.next_request().await;

    let other: SocketAddr = "10.0.0.2:5001".parse().unwrap();
    let syn = build_tcp(&TcpSegment {
        src: other,
        dst: remote(),
        seq: 42,
        ack: 0,
        flags: TcpFlags::syn_only(),
        window: 65535,
        mss: None,
        payload: &[],
    })
    .unwrap();
    harness.inject(syn).await;
    let rst = harness.next_rst().await;
    assert_eq!(rst.ack, 43);
    assert_eq!(harness.tunnel.stats_snapshot().dropped_packets, 1);
    assert!(proxy.no_more_requests().await);
    harness.stop().await;
}

#[tokio::test]
async fn test_stop_drains_sessions_and_closes_upstream() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    open_connection(&mut harness).await;
    proxy.next_request().await;
    harness
        .wait_until("session", |t| t.stats_snapshot().tcp_sessions_active == 1)
        .await;

    let runner_done = {
        harness.tunnel.stop().unwrap();
        timeout(WAIT, &mut harness.runner).await.unwrap().unwrap()
    };
    runner_done.unwrap();

    let rst = harness.next_rst().await;
    assert_eq!(rst.ack, 1001);
    let tunnel = Arc::clone(&harness.tunnel);
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(tunnel.stats_snapshot().active_sessions(), 0);
    timeout(WAIT, proxy.closed.recv()).await.unwrap().unwrap();

    let before = tunnel.stats();
    tunnel.fini().unwrap();
    assert_eq!(tunnel.stats(), before);
}

#[tokio::test]
async fn test_syn_with_new_isn_replaces_live_session() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    open_connection(&mut harness).await;
    proxy.next_request().await;
    harness
        .wait_until("established", |t| t.stats_snapshot().tcp_sessions_active == 1)
        .await;

    // The local side lost our RST and reuses the tuple with a fresh ISN
    harness.inject(segment(777_000, 0, TcpFlags::syn_only(), b"")).await;
    loop {
        let (seg, _) = harness.next_tcp().await;
        if seg.flags.syn && seg.flags.ack && seg.ack == 777_001 {
            break;
        }
    }

    let (command, target) = proxy.next_request().await;
    assert_eq!(command, 0x01);
    assert_eq!(target, TargetAddr::Ip(remote()));
    timeout(WAIT, proxy.closed.recv()).await.unwrap().unwrap();

    let snapshot = harness.tunnel.stats_snapshot();
    assert_eq!(snapshot.tcp_sessions_total, 2);
    assert_eq!(snapshot.tcp_sessions_active, 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_idle_tcp_session_evicted() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut config = config(proxy.port);
    config.misc.tcp_read_write_timeout = 150;
    let mut harness = Harness::start(config);

    open_connection(&mut harness).await;
    proxy.next_request().await;

    harness
        .wait_until("eviction", |t| {
            let snapshot = t.stats_snapshot();
            snapshot.tcp_sessions_total == 1 && snapshot.tcp_sessions_active == 0
        })
        .await;
    let rst = harness.next_rst().await;
    assert_eq!(rst.ack, 1001);
    timeout(WAIT, proxy.closed.recv()).await.unwrap().unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_ipv6_tcp_relayed() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut harness = Harness::start(config(proxy.port));

    let local: SocketAddr = "[fd00::2]:5000".parse().unwrap();
    let remote: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
    let segment6 = |seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]| {
        build_tcp(&TcpSegment {
            src: local,
            dst: remote,
            seq,
            ack,
            flags,
            window: 65535,
            mss: flags.syn.then_some(1440),
            payload,
        })
        .unwrap()
    };

    harness.inject(segment6(1000, 0, TcpFlags::syn_only(), b"")).await;
    let packet = harness.next_packet().await;
    let parsed = parse_packet(&packet).unwrap();
    assert_eq!(parsed.src_socket(), Some(remote));
    assert_eq!(parsed.dst_socket(), Some(local));
    let syn_ack = parsed.tcp().unwrap().clone();
    assert!(syn_ack.flags.syn && syn_ack.flags.ack);
    assert_eq!(syn_ack.ack, 1001);

    let (command, target) = proxy.next_request().await;
    assert_eq!(command, 0x01);
    assert_eq!(target, TargetAddr::Ip(remote));

    let snd = syn_ack.seq.wrapping_add(1);
    harness.inject(segment6(1001, snd, TcpFlags::ack_only(), b"")).await;
    harness.inject(segment6(1001, snd, TcpFlags::psh_ack(), b"over v6")).await;

    let (seg, payload) = harness.next_tcp_data().await;
    assert_eq!(payload, b"over v6");
    assert_eq!(seg.seq, snd);
    assert_eq!(seg.ack, 1008);
    harness.stop().await;
}

#[tokio::test]
async fn test_unspecified_relay_address_uses_proxy_host() {
    let mut proxy = ScriptedProxy::with_script(Script {
        unspecified_bind: true,
        ..Default::default()
    })
    .await;
    let mut harness = Harness::start(config(proxy.port));

    harness.inject(build_udp(local(), dns_server(), b"query").unwrap()).await;
    let (command, _) = proxy.next_request().await;
    assert_eq!(command, 0x03);

    let packet = harness.next_packet().await;
    let parsed = parse_packet(&packet).unwrap();
    assert_eq!(parsed.src_socket(), Some(dns_server()));
    assert_eq!(parsed.payload, b"query");
    harness.stop().await;
}

#[tokio::test]
async fn test_closed_control_stream_ends_udp_session() {
    let mut proxy = ScriptedProxy::with_script(Script {
        close_control_after_echo: true,
        ..Default::default()
    })
    .await;
    let mut config = config(proxy.port);
    // Only the control stream can end the session here
    config.misc.udp_read_write_timeout = 600_000;
    let harness = Harness::start(config);

    harness.inject(build_udp(local(), dns_server(), b"once").unwrap()).await;
    proxy.next_request().await;
    timeout(WAIT, proxy.closed.recv()).await.unwrap().unwrap();

    harness
        .wait_until("session end", |t| {
            let snapshot = t.stats_snapshot();
            snapshot.udp_sessions_total == 1 && snapshot.udp_sessions_active == 0
        })
        .await;
    harness.stop().await;
}

#[tokio::test]
async fn test_session_limit_drops_new_udp_flow() {
    let mut proxy = ScriptedProxy::start(0x00).await;
    let mut config = config(proxy.port);
    config.misc.max_session_count = 1;
    let mut harness = Harness::start(config);

    harness.inject(build_udp(local(), dns_server(), b"first").unwrap()).await;
    proxy.next_request().await;
    harness.next_packet().await;

    let other: SocketAddr = "1.1.1.1:53".parse().unwrap();
    harness.inject(build_udp(local(), other, b"second").unwrap()).await;
    harness
        .wait_until("drop", |t| t.stats_snapshot().dropped_packets == 1)
        .await;

    let snapshot = harness.tunnel.stats_snapshot();
    assert_eq!(snapshot.udp_sessions_total, 1);
    assert_eq!(snapshot.udp_sessions_active, 1);
    assert!(proxy.no_more_requests().await);
    assert!(timeout(Duration::from_millis(200), harness.peer.written.recv())
        .await
        .is_err());
    harness.stop().await;
}
