//! SOCKS5 client (RFC 1928, RFC 1929)
//!
//! Covers method negotiation, username/password authentication, CONNECT,
//! UDP ASSOCIATE, and the UDP-in-TCP forwarding extension where datagrams
//! travel framed over the control stream.
//!
//! UDP relay datagram format:
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! UDP-in-TCP frame format:
//!
//! ```text
//! +--------+--------+------+----------+----------+----------+
//! | DATLEN | HDRLEN | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +--------+--------+------+----------+----------+----------+
//! |   2    |   1    |  1   | Variable |    2     | Variable |
//! +--------+--------+------+----------+----------+----------+
//! ```

use crate::config::{Credentials, ProxyEndpoint};
use crate::error::{Result, TunnelError};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

pub const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;

/// Size of the RSV + FRAG prefix of a relay datagram
const UDP_PREFIX_LEN: usize = 3;
/// DATLEN + HDRLEN prefix of a UDP-in-TCP frame
const FRAME_PREFIX_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    UdpAssociate = 0x03,
    /// Datagrams carried on the control stream
    FwdUdp = 0x05,
}

/// Destination of a request or a relayed datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// `0.0.0.0:0`, used where the client has no address to announce
    pub fn unspecified() -> Self {
        TargetAddr::Ip(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Some(*addr),
            TargetAddr::Domain(..) => None,
        }
    }

    /// Bytes taken by ATYP, address and port
    pub fn encoded_len(&self) -> usize {
        let addr_len = match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 4,
            TargetAddr::Ip(SocketAddr::V6(_)) => 16,
            TargetAddr::Domain(domain, _) => 1 + domain.len(),
        };
        1 + addr_len + 2
    }

    pub fn write_to(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            TargetAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        buf.put_u8(ATYP_IPV4);
                        buf.put_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        buf.put_u8(ATYP_IPV6);
                        buf.put_slice(&ip.octets());
                    }
                }
                buf.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                if domain.is_empty() || domain.len() > 255 {
                    return Err(TunnelError::protocol(format!(
                        "domain length {} not encodable",
                        domain.len()
                    )));
                }
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Decode an address from the start of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(TargetAddr, usize)> {
        let short = || TunnelError::protocol("truncated address");
        let atyp = *buf.first().ok_or_else(short)?;
        match atyp {
            ATYP_IPV4 => {
                let b = buf.get(1..7).ok_or_else(short)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Ok((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_IPV6 => {
                let b = buf.get(1..19).ok_or_else(short)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&b[..16]);
                let port = u16::from_be_bytes([b[16], b[17]]);
                Ok((
                    TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            ATYP_DOMAIN => {
                let len = *buf.get(1).ok_or_else(short)? as usize;
                let b = buf.get(2..2 + len + 2).ok_or_else(short)?;
                let domain = String::from_utf8(b[..len].to_vec())
                    .map_err(|_| TunnelError::protocol("domain is not UTF-8"))?;
                let port = u16::from_be_bytes([b[len], b[len + 1]]);
                Ok((TargetAddr::Domain(domain, port), 2 + len + 2))
            }
            other => Err(TunnelError::protocol(format!(
                "unknown address type {:#04x}",
                other
            ))),
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<TargetAddr>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        let mut buf = vec![atyp];
        match atyp {
            ATYP_IPV4 => buf.resize(7, 0),
            ATYP_IPV6 => buf.resize(19, 0),
            ATYP_DOMAIN => {
                let len = reader.read_u8().await?;
                buf.push(len);
                buf.resize(2 + len as usize + 2, 0);
                reader.read_exact(&mut buf[2..]).await?;
                return TargetAddr::parse(&buf).map(|(addr, _)| addr);
            }
            other => {
                return Err(TunnelError::protocol(format!(
                    "unknown address type {:#04x}",
                    other
                )))
            }
        }
        reader.read_exact(&mut buf[1..]).await?;
        TargetAddr::parse(&buf).map(|(addr, _)| addr)
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Negotiate a method and authenticate if the server asks for it.
pub async fn handshake<S>(stream: &mut S, credentials: Option<&Credentials>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if credentials.is_some() {
        &[SOCKS5_VERSION, 0x02, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 0x01, AUTH_NONE]
    };
    stream.write_all(greeting).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol(format!(
            "unexpected version {:#04x} in method reply",
            response[0]
        )));
    }

    match (response[1], credentials) {
        (AUTH_NONE, _) => Ok(()),
        (AUTH_PASSWORD, Some(credentials)) => authenticate(stream, credentials).await,
        (AUTH_PASSWORD, None) => Err(TunnelError::protocol(
            "server requires authentication but no credentials are configured",
        )),
        (AUTH_NO_ACCEPTABLE, _) => Err(TunnelError::rejected(AUTH_NO_ACCEPTABLE)),
        (method, _) => Err(TunnelError::protocol(format!(
            "server selected unsupported method {:#04x}",
            method
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, credentials: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = credentials.username.as_bytes();
    let pass = credentials.password.as_bytes();
    if user.len() > 255 || pass.len() > 255 {
        return Err(TunnelError::protocol("credentials longer than 255 bytes"));
    }

    let mut auth = BytesMut::with_capacity(3 + user.len() + pass.len());
    auth.put_u8(AUTH_PASSWORD_VERSION);
    auth.put_u8(user.len() as u8);
    auth.put_slice(user);
    auth.put_u8(pass.len() as u8);
    auth.put_slice(pass);
    stream.write_all(&auth).await?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await?;
    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(TunnelError::protocol(format!(
            "unexpected version {:#04x} in authentication reply",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(TunnelError::ProxyRejected {
            code: response[1],
            reason: "authentication failed",
        });
    }
    Ok(())
}

/// Send a request and read the reply, returning BND.ADDR.
pub async fn request<S>(stream: &mut S, command: Command, target: &TargetAddr) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(3 + target.encoded_len());
    buf.put_slice(&[SOCKS5_VERSION, command as u8, 0x00]);
    target.write_to(&mut buf)?;
    stream.write_all(&buf).await?;

    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(TunnelError::protocol(format!(
            "unexpected version {:#04x} in reply",
            header[0]
        )));
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(TunnelError::rejected(header[1]));
    }

    TargetAddr::read_from(stream).await
}

/// Connects to one configured proxy server.
#[derive(Debug, Clone)]
pub struct Socks5Client {
    endpoint: ProxyEndpoint,
    connect_timeout: Duration,
}

impl Socks5Client {
    pub fn new(endpoint: ProxyEndpoint, connect_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
        }
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// Open a relayed TCP stream to `target`.
    pub async fn connect(&self, target: &TargetAddr) -> Result<TcpStream> {
        self.with_timeout("CONNECT", async {
            let mut stream = self.dial().await?;
            handshake(&mut stream, self.endpoint.credentials.as_ref()).await?;
            let bound = request(&mut stream, Command::Connect, target).await?;
            debug!("SOCKS5 CONNECT {} via {} bound {}", target, self.endpoint, bound);
            Ok(stream)
        })
        .await
    }

    /// Set up a UDP ASSOCIATE and a local socket connected to the relay.
    pub async fn udp_associate(&self) -> Result<UdpAssociation> {
        self.with_timeout("UDP ASSOCIATE", async {
            let mut control = self.dial().await?;
            handshake(&mut control, self.endpoint.credentials.as_ref()).await?;
            let bound =
                request(&mut control, Command::UdpAssociate, &TargetAddr::unspecified()).await?;

            let relay_addr = match bound {
                TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
                    SocketAddr::new(control.peer_addr()?.ip(), addr.port())
                }
                TargetAddr::Ip(addr) => addr,
                TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), port))
                    .await?
                    .next()
                    .ok_or_else(|| TunnelError::protocol(format!("relay {} did not resolve", host)))?,
            };

            let bind = if relay_addr.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            } else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(relay_addr).await?;
            debug!("SOCKS5 UDP ASSOCIATE via {} relay {}", self.endpoint, relay_addr);

            Ok(UdpAssociation {
                control,
                relay: UdpRelay { socket, relay_addr },
            })
        })
        .await
    }

    /// Open a control stream that carries datagrams as UDP-in-TCP frames.
    pub async fn udp_over_tcp(&self) -> Result<TcpStream> {
        self.with_timeout("FWD UDP", async {
            let mut stream = self.dial().await?;
            handshake(&mut stream, self.endpoint.credentials.as_ref()).await?;
            request(&mut stream, Command::FwdUdp, &TargetAddr::unspecified()).await?;
            debug!("SOCKS5 UDP-in-TCP via {}", self.endpoint);
            Ok(stream)
        })
        .await
    }

    async fn dial(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.endpoint.address.as_str(), self.endpoint.port))
            .await
            .map_err(|e| TunnelError::ProxyUnreachable(format!("{}: {}", self.endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay failed: {}", e);
        }
        Ok(stream)
    }

    async fn with_timeout<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TunnelError::ProxyUnreachable(format!(
                "{} via {} timed out after {:?}",
                what, self.endpoint, self.connect_timeout
            ))),
        }
    }
}

/// A live UDP association. The control stream must stay open for as long as
/// the relay is used; the server drops the association when it closes.
pub struct UdpAssociation {
    pub control: TcpStream,
    pub relay: UdpRelay,
}

pub struct UdpRelay {
    socket: UdpSocket,
    relay_addr: SocketAddr,
}

impl UdpRelay {
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Set SO_RCVBUF on the relay socket
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        use std::os::fd::AsRawFd;

        let size = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);
        // SAFETY: the descriptor is owned by `self.socket` and outlives the
        // call; the option value points at a live c_int of the given length.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub async fn send_to(&self, dst: &TargetAddr, payload: &[u8]) -> Result<()> {
        let datagram = encode_udp_datagram(dst, payload)?;
        self.socket.send(&datagram).await?;
        Ok(())
    }

    /// Receive one datagram from the relay. Malformed or fragmented
    /// datagrams surface as errors the caller may skip.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(TargetAddr, Bytes)> {
        let n = self.socket.recv(buf).await?;
        let (src, payload) = decode_udp_datagram(&buf[..n])?;
        Ok((src, Bytes::copy_from_slice(payload)))
    }
}

pub fn encode_udp_datagram(dst: &TargetAddr, payload: &[u8]) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(UDP_PREFIX_LEN + dst.encoded_len() + payload.len());
    buf.put_slice(&[0x00, 0x00, 0x00]);
    dst.write_to(&mut buf)?;
    buf.put_slice(payload);
    Ok(buf)
}

pub fn decode_udp_datagram(buf: &[u8]) -> Result<(TargetAddr, &[u8])> {
    if buf.len() < UDP_PREFIX_LEN {
        return Err(TunnelError::protocol("datagram shorter than header"));
    }
    if buf[2] != 0 {
        return Err(TunnelError::protocol(format!(
            "fragmented datagram (FRAG={}) not supported",
            buf[2]
        )));
    }
    let (addr, used) = TargetAddr::parse(&buf[UDP_PREFIX_LEN..])?;
    Ok((addr, &buf[UDP_PREFIX_LEN + used..]))
}

pub fn encode_udp_frame(dst: &TargetAddr, payload: &[u8]) -> Result<BytesMut> {
    if payload.len() > u16::MAX as usize {
        return Err(TunnelError::protocol(format!(
            "datagram of {} bytes does not fit a frame",
            payload.len()
        )));
    }
    let header_len = FRAME_PREFIX_LEN + dst.encoded_len();
    let mut buf = BytesMut::with_capacity(header_len + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_u8(header_len as u8);
    dst.write_to(&mut buf)?;
    buf.put_slice(payload);
    Ok(buf)
}

pub async fn read_udp_frame<R>(reader: &mut R) -> Result<(TargetAddr, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;
    let data_len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
    let header_len = prefix[2] as usize;

    let addr = TargetAddr::read_from(reader).await?;
    if FRAME_PREFIX_LEN + addr.encoded_len() != header_len {
        return Err(TunnelError::protocol(format!(
            "frame header length {} does not match address {}",
            header_len, addr
        )));
    }

    let mut data = vec![0u8; data_len];
    reader.read_exact(&mut data).await?;
    Ok((addr, Bytes::from(data)))
}
