//! Error types for the sockstun tunneling engine

use std::io;
use thiserror::Error;

/// Result type alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Main error type for the tunneling engine
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too short: expected {expected}, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("SOCKS5 proxy rejected request: {reason} (code {code:#04x})")]
    ProxyRejected { code: u8, reason: &'static str },

    #[error("SOCKS5 proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid tun descriptor: {0}")]
    InvalidDescriptor(i32),

    #[error("Ordering violation: {0}")]
    OrderingViolation(&'static str),

    #[error("Channel closed")]
    ChannelClosed,
}

impl TunnelError {
    /// Errors that keep the engine from starting or indicate caller misuse.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Configuration(_)
                | TunnelError::InvalidDescriptor(_)
                | TunnelError::OrderingViolation(_)
        )
    }

    /// Per-packet parse failures, dropped and counted by the engine.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedPacket(_)
                | TunnelError::PacketTooShort { .. }
                | TunnelError::InvalidIpVersion(_)
        )
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        TunnelError::Configuration(message.into())
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        TunnelError::MalformedPacket(message.into())
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        TunnelError::Protocol(message.into())
    }

    pub fn rejected(code: u8) -> Self {
        TunnelError::ProxyRejected {
            code,
            reason: reply_message(code),
        }
    }

    /// The SOCKS5 reply code carried by a rejection, if any.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            TunnelError::ProxyRejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Human-readable text for a SOCKS5 reply code (RFC 1928 section 6).
///
/// Method-negotiation refusal (`0xFF`) shares the code space so that a
/// rejected greeting can be reported through [`TunnelError::ProxyRejected`].
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        0xFF => "no acceptable authentication method",
        _ => "unknown error",
    }
}
