//! sockstun tunnel engine - user-space tun to SOCKS5 relay
//!
//! Reads raw IP packets from a tun descriptor handed over by the platform,
//! terminates captured TCP connections and UDP flows locally, and relays
//! their payload through a SOCKS5 proxy.
//!
//! # Features
//!
//! - IPv4 and IPv6, TCP and UDP
//! - Local TCP handshake emulation with flow control and retransmission
//! - SOCKS5 CONNECT, UDP ASSOCIATE and UDP-in-TCP relaying
//! - Optional username/password authentication
//! - Idle eviction, session limits and consistent traffic counters
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                      tun descriptor                         |
//! +-------------------------------------------------------------+
//!                              |
//!                              v
//! +-------------------------------------------------------------+
//! |                   Tunnel event loop                         |
//! | +-------------+ +-------------+ +-------------+             |
//! | |Packet codec | | Flow table  | |Housekeeping |             |
//! | +-------------+ +-------------+ +-------------+             |
//! |          |             |              |                     |
//! | +-------------+ +-------------+                             |
//! | | TCP session | | UDP session |                             |
//! | +-------------+ +-------------+                             |
//! +-------------------------------------------------------------+
//!                              |
//!                              v
//! +-------------------------------------------------------------+
//! |             Relay tasks (SOCKS5 client)                     |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use sockstun_tunnel::{Config, Tunnel};
//! use std::sync::Arc;
//!
//! let config = Config::from_file("/data/tproxy.conf")?;
//! let tunnel = Arc::new(Tunnel::init(tun_fd, config)?);
//!
//! let runner = {
//!     let tunnel = Arc::clone(&tunnel);
//!     std::thread::spawn(move || tunnel.run())
//! };
//!
//! // later, from any thread
//! tunnel.stop()?;
//! runner.join().unwrap()?;
//! println!("{:?}", tunnel.stats());
//! tunnel.fini()?;
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod flow;
pub mod logging;
pub mod packet;
pub mod session;
pub mod socks5;
pub mod stats;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use config::{Config, LogLevel, MiscConfig, ProxyEndpoint, UdpRelayMode};
pub use device::{ChannelDevice, ChannelPeer, PacketDevice, TunDevice, TunFd};
pub use engine::{Tunnel, TunnelState};
pub use error::{Result, TunnelError};
pub use flow::{FlowKey, FlowProtocol, FlowTable};
pub use logging::init_logging;
pub use packet::{parse_packet, ParsedPacket, TcpFlags};
pub use socks5::{Socks5Client, TargetAddr};
pub use stats::{StatsSnapshot, TrafficStats, TunnelStats};
pub use tcp::TcpState;
pub use udp::UdpState;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::Tunnel;
    pub use crate::error::{Result, TunnelError};
    pub use crate::stats::TrafficStats;
}
