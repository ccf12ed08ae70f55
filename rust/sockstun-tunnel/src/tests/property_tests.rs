//! Property-based tests for the packet codec, the flow table and the stats
//! counters.

use crate::error::TunnelError;
use crate::flow::{FlowEntry, FlowKey, FlowTable};
use crate::packet::{build_tcp, build_udp, parse_packet, TcpFlags, TcpSegment};
use crate::socks5::{decode_udp_datagram, TargetAddr};
use crate::stats::TunnelStats;
use proptest::prelude::*;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

struct Entry {
    created: Instant,
}

impl FlowEntry for Entry {
    fn last_activity(&self) -> Instant {
        self.created
    }
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(60)
    }
    fn is_closed(&self) -> bool {
        false
    }
}

fn ipv4_strategy() -> impl Strategy<Value = IpAddr> {
    any::<[u8; 4]>().prop_map(|o| IpAddr::V4(Ipv4Addr::from(o)))
}

fn ipv6_strategy() -> impl Strategy<Value = IpAddr> {
    any::<[u16; 8]>().prop_map(|s| IpAddr::V6(Ipv6Addr::from(s)))
}

/// Address pair of one family
fn endpoint_pair() -> impl Strategy<Value = (SocketAddr, SocketAddr)> {
    prop_oneof![
        (ipv4_strategy(), any::<u16>(), ipv4_strategy(), any::<u16>()),
        (ipv6_strategy(), any::<u16>(), ipv6_strategy(), any::<u16>()),
    ]
    .prop_map(|(a, pa, b, pb)| (SocketAddr::new(a, pa), SocketAddr::new(b, pb)))
}

fn flags_strategy() -> impl Strategy<Value = TcpFlags> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>())
        .prop_map(|(fin, syn, rst, psh, ack)| TcpFlags { fin, syn, rst, psh, ack })
}

/// Keys drawn from a small pool so sequences revisit the same tuples
fn key_strategy() -> impl Strategy<Value = FlowKey> {
    (any::<bool>(), 0u16..4, 0u16..3).prop_map(|(tcp, local_port, remote_port)| {
        let local = SocketAddr::from(([10, 0, 0, 2], 5000 + local_port));
        let remote = SocketAddr::from(([93, 184, 216, 34], 80 + remote_port));
        if tcp {
            FlowKey::tcp(local, remote)
        } else {
            FlowKey::udp(local, remote)
        }
    })
}

#[derive(Debug, Clone, Copy)]
enum StatsOp {
    Received(usize),
    Sent(usize),
    Malformed,
    Dropped,
}

fn stats_op_strategy() -> impl Strategy<Value = StatsOp> {
    prop_oneof![
        (0usize..70000).prop_map(StatsOp::Received),
        (0usize..70000).prop_map(StatsOp::Sent),
        Just(StatsOp::Malformed),
        Just(StatsOp::Dropped),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Arbitrary input never panics the parser; anything it accepts has a
    /// payload inside the buffer.
    #[test]
    fn test_parse_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..256)) {
        if let Ok(packet) = parse_packet(&data) {
            prop_assert!(packet.payload.len() <= data.len());
            prop_assert!(packet.total_len <= data.len());
        }
    }

    /// Any strict prefix of a valid packet is rejected, never parsed into a
    /// shorter phantom packet.
    #[test]
    fn test_truncated_packets_rejected(
        (src, dst) in endpoint_pair(),
        seq in any::<u32>(),
        flags in flags_strategy(),
        payload in prop::collection::vec(any::<u8>(), 0..64),
        udp in any::<bool>(),
        cut in any::<prop::sample::Index>(),
    ) {
        let packet = if udp {
            build_udp(src, dst, &payload).unwrap()
        } else {
            build_tcp(&TcpSegment {
                src,
                dst,
                seq,
                ack: 0,
                flags,
                window: 1024,
                mss: None,
                payload: &payload,
            }).unwrap()
        };
        prop_assert!(parse_packet(&packet).is_ok());

        let len = cut.index(packet.len());
        let result = parse_packet(&packet[..len]);
        prop_assert!(result.is_err());
        prop_assert!(!matches!(result, Err(TunnelError::Unsupported(_))));
    }

    /// Flipping a bit in the IPv4 header is caught by the header checksum.
    /// The version nibble is left alone: changing it reinterprets the packet
    /// as another IP version rather than corrupting it.
    #[test]
    fn test_ipv4_header_corruption_detected(
        payload in prop::collection::vec(any::<u8>(), 0..32),
        bit in prop_oneof![0usize..4, 8usize..160],
    ) {
        let src = SocketAddr::from(([10, 0, 0, 2], 40000));
        let dst = SocketAddr::from(([1, 1, 1, 1], 53));
        let mut packet = build_udp(src, dst, &payload).unwrap();
        packet[bit / 8] ^= 1 << (bit % 8);
        prop_assert!(parse_packet(&packet).is_err());
    }

    /// However packets arrive, the table holds at most one session per tuple
    /// and creates exactly one per distinct tuple.
    #[test]
    fn test_at_most_one_session_per_tuple(keys in prop::collection::vec(key_strategy(), 1..100)) {
        let mut table = FlowTable::new(None);
        let mut created = 0usize;
        for key in &keys {
            let (_, new) = table
                .lookup_or_create(*key, || Ok(Entry { created: Instant::now() }))
                .unwrap();
            if new {
                created += 1;
            }
        }
        let distinct: HashSet<FlowKey> = keys.iter().copied().collect();
        prop_assert_eq!(table.len(), distinct.len());
        prop_assert_eq!(created, distinct.len());
    }

    /// Traffic counters never decrease, and malformed or dropped packets do
    /// not move them.
    #[test]
    fn test_stats_monotonic(ops in prop::collection::vec(stats_op_strategy(), 0..100)) {
        let stats = TunnelStats::new();
        let mut previous = stats.traffic();
        for op in ops {
            match op {
                StatsOp::Received(n) => stats.record_received(n),
                StatsOp::Sent(n) => stats.record_sent(n),
                StatsOp::Malformed => stats.record_malformed(),
                StatsOp::Dropped => stats.record_dropped(),
            }
            let current = stats.traffic();
            let (before, after) = (previous.to_array(), current.to_array());
            for (b, a) in before.iter().zip(after.iter()) {
                prop_assert!(a >= b);
            }
            if matches!(op, StatsOp::Malformed | StatsOp::Dropped) {
                prop_assert_eq!(current, previous);
            }
            previous = current;
        }
    }

    /// SOCKS5 address and datagram decoding reject garbage without panicking.
    #[test]
    fn test_socks5_decoding_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..300)) {
        if let Ok((_, used)) = TargetAddr::parse(&data) {
            prop_assert!(used <= data.len());
        }
        if let Ok((_, payload)) = decode_udp_datagram(&data) {
            prop_assert!(payload.len() < data.len());
        }
    }
}
