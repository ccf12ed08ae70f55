//! Engine configuration
//!
//! The configuration resource is the YAML document written by the platform
//! service. Only the sections the engine acts on are modelled; anything else
//! (split-tunnel DNS, route lists) is accepted and ignored.

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MTU: u32 = 8500;
pub const MIN_MTU: u32 = 576;
pub const MAX_MTU: u32 = 65535;

/// Top-level configuration, immutable once the engine is initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    pub socks5: Socks5Config,
    #[serde(default)]
    pub misc: MiscConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunnelConfig {
    #[serde(default = "default_mtu")]
    pub mtu: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { mtu: default_mtu() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Socks5Config {
    pub tcp: ServerConfig,
    #[serde(default)]
    pub udp: Option<UdpServerConfig>,
}

/// Upstream server used for TCP CONNECT requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Upstream server used for UDP relaying. Every field falls back to the
/// TCP server when left out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpServerConfig {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub udp_relay: UdpRelayMode,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// How UDP datagrams reach the proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UdpRelayMode {
    /// Standard UDP ASSOCIATE with a separate datagram socket
    #[default]
    Udp,
    /// Datagrams framed over the TCP control connection
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiscConfig {
    /// Milliseconds allowed for the proxy connect and handshake
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Milliseconds of inactivity before a TCP session is evicted
    #[serde(default = "default_tcp_timeout")]
    pub tcp_read_write_timeout: u64,
    /// Milliseconds of inactivity before a UDP session is evicted
    #[serde(default = "default_udp_timeout")]
    pub udp_read_write_timeout: u64,
    /// Milliseconds a closing TCP session may linger
    #[serde(default = "default_closing_timeout")]
    pub tcp_closing_timeout: u64,
    /// Milliseconds between housekeeping sweeps
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval: u64,
    /// Upper bound on live sessions, 0 means unlimited
    #[serde(default)]
    pub max_session_count: usize,
    #[serde(default = "default_tcp_buffer_size")]
    pub tcp_buffer_size: usize,
    #[serde(default = "default_udp_recv_buffer_size")]
    pub udp_recv_buffer_size: usize,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            tcp_read_write_timeout: default_tcp_timeout(),
            udp_read_write_timeout: default_udp_timeout(),
            tcp_closing_timeout: default_closing_timeout(),
            eviction_interval: default_eviction_interval(),
            max_session_count: 0,
            tcp_buffer_size: default_tcp_buffer_size(),
            udp_recv_buffer_size: default_udp_recv_buffer_size(),
            log_file: default_log_file(),
            log_level: LogLevel::default(),
        }
    }
}

impl MiscConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_read_write_timeout)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_read_write_timeout)
    }

    pub fn tcp_closing_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_closing_timeout)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval)
    }

    /// `None` when the session count is unbounded
    pub fn session_limit(&self) -> Option<usize> {
        (self.max_session_count > 0).then_some(self.max_session_count)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Username/password pair for RFC 1929 authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A resolved proxy endpoint with the credentials to present to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub address: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

impl Config {
    /// Minimal configuration pointing at a single SOCKS5 server.
    pub fn for_server(address: impl Into<String>, port: u16) -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            socks5: Socks5Config {
                tcp: ServerConfig {
                    address: address.into(),
                    port,
                    username: None,
                    password: None,
                },
                udp: None,
            },
            misc: MiscConfig::default(),
        }
    }

    /// Read, parse and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        content.parse()
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_MTU..=MAX_MTU).contains(&self.tunnel.mtu) {
            return Err(TunnelError::config(format!(
                "tunnel.mtu {} outside {}..={}",
                self.tunnel.mtu, MIN_MTU, MAX_MTU
            )));
        }

        let tcp = &self.socks5.tcp;
        validate_server("socks5.tcp", &tcp.address, tcp.port)?;
        validate_credentials("socks5.tcp", &tcp.username, &tcp.password)?;

        if let Some(udp) = &self.socks5.udp {
            if let Some(address) = &udp.address {
                if address.trim().is_empty() && tcp.address.trim().is_empty() {
                    return Err(TunnelError::config("socks5.udp.address is empty"));
                }
            }
            validate_credentials("socks5.udp", &udp.username, &udp.password)?;
        }

        let misc = &self.misc;
        for (name, value) in [
            ("misc.connect-timeout", misc.connect_timeout),
            ("misc.tcp-read-write-timeout", misc.tcp_read_write_timeout),
            ("misc.udp-read-write-timeout", misc.udp_read_write_timeout),
            ("misc.tcp-closing-timeout", misc.tcp_closing_timeout),
            ("misc.eviction-interval", misc.eviction_interval),
        ] {
            if value == 0 {
                return Err(TunnelError::config(format!("{} must be positive", name)));
            }
        }
        if misc.tcp_buffer_size == 0 {
            return Err(TunnelError::config("misc.tcp-buffer-size must be positive"));
        }
        if misc.udp_recv_buffer_size == 0 {
            return Err(TunnelError::config("misc.udp-recv-buffer-size must be positive"));
        }

        Ok(())
    }

    /// Endpoint used for TCP sessions.
    pub fn tcp_endpoint(&self) -> ProxyEndpoint {
        let tcp = &self.socks5.tcp;
        ProxyEndpoint {
            address: tcp.address.trim().to_string(),
            port: tcp.port,
            credentials: credentials(&tcp.username, &tcp.password),
        }
    }

    /// Endpoint used for UDP sessions, falling back field by field to the
    /// TCP server.
    pub fn udp_endpoint(&self) -> ProxyEndpoint {
        let base = self.tcp_endpoint();
        let Some(udp) = &self.socks5.udp else {
            return base;
        };

        let address = udp
            .address
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .unwrap_or(base.address);
        let port = udp.port.filter(|p| *p != 0).unwrap_or(base.port);
        let credentials = credentials(&udp.username, &udp.password).or(base.credentials);

        ProxyEndpoint {
            address,
            port,
            credentials,
        }
    }

    pub fn udp_relay_mode(&self) -> UdpRelayMode {
        self.socks5
            .udp
            .as_ref()
            .map(|u| u.udp_relay)
            .unwrap_or_default()
    }
}

impl FromStr for Config {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(s)
            .map_err(|e| TunnelError::config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_server(section: &str, address: &str, port: u16) -> Result<()> {
    if address.trim().is_empty() {
        return Err(TunnelError::config(format!("{}.address is empty", section)));
    }
    if port == 0 {
        return Err(TunnelError::config(format!("{}.port must not be 0", section)));
    }
    Ok(())
}

fn validate_credentials(
    section: &str,
    username: &Option<String>,
    password: &Option<String>,
) -> Result<()> {
    let user = username.as_deref().unwrap_or("");
    let pass = password.as_deref().unwrap_or("");
    if user.is_empty() != pass.is_empty() {
        return Err(TunnelError::config(format!(
            "{}: username and password must be given together",
            section
        )));
    }
    if user.len() > 255 || pass.len() > 255 {
        return Err(TunnelError::config(format!(
            "{}: credentials longer than 255 bytes",
            section
        )));
    }
    Ok(())
}

fn credentials(username: &Option<String>, password: &Option<String>) -> Option<Credentials> {
    match (username.as_deref(), password.as_deref()) {
        (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some(Credentials {
            username: u.to_string(),
            password: p.to_string(),
        }),
        _ => None,
    }
}

fn default_mtu() -> u32 {
    DEFAULT_MTU
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_tcp_timeout() -> u64 {
    300_000
}

fn default_udp_timeout() -> u64 {
    60_000
}

fn default_closing_timeout() -> u64 {
    10_000
}

fn default_eviction_interval() -> u64 {
    1_000
}

fn default_tcp_buffer_size() -> usize {
    65536
}

fn default_udp_recv_buffer_size() -> usize {
    524288
}

fn default_log_file() -> String {
    "stderr".to_string()
}
