//! Packet device abstraction for the tun descriptor
//!
//! The engine reads and writes whole IP packets through [`PacketDevice`].
//! [`TunDevice`] drives a real descriptor; [`ChannelDevice`] is an in-memory
//! stand-in used to script the engine.

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Source and sink of raw IP packets.
#[async_trait]
pub trait PacketDevice: Send {
    /// Read one packet into `buf`, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write one complete packet.
    async fn send(&mut self, packet: &[u8]) -> Result<()>;
}

/// Validated duplicate of a caller-owned tun descriptor.
///
/// Obtained at init time; turned into a [`TunDevice`] once a runtime exists.
#[derive(Debug)]
pub struct TunFd {
    fd: OwnedFd,
}

impl TunFd {
    /// Duplicate `fd`. The caller keeps ownership of the original.
    pub fn dup(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(TunnelError::InvalidDescriptor(fd));
        }
        // SAFETY: F_GETFL only queries descriptor flags.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(TunnelError::InvalidDescriptor(fd));
        }
        // SAFETY: fd was just checked to be open.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: dup is a fresh descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(dup) };
        debug!("duplicated tun descriptor as {}", dup);
        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Switch to non-blocking mode and register with the current runtime.
    pub fn into_device(self) -> Result<TunDevice> {
        let raw = self.fd.as_raw_fd();
        // SAFETY: raw stays open for the lifetime of self.fd.
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: as above; only O_NONBLOCK is added.
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let inner = AsyncFd::new(File::from(self.fd))?;
        Ok(TunDevice { inner })
    }
}

/// Tun descriptor driven by readiness notifications.
pub struct TunDevice {
    inner: AsyncFd<File>,
}

impl TunDevice {
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        TunFd::dup(fd)?.into_device()
    }
}

#[async_trait]
impl PacketDevice for TunDevice {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return Ok(result?),
                Err(_would_block) => continue,
            }
        }
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(packet)
            }) {
                Ok(Ok(n)) => {
                    if n != packet.len() {
                        warn!("short tun write: {} of {} bytes", n, packet.len());
                    }
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }
}

/// In-memory device backed by channels.
pub struct ChannelDevice {
    inbound: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The far end of a [`ChannelDevice`].
pub struct ChannelPeer {
    /// Packets the engine will read
    pub inject: mpsc::Sender<Vec<u8>>,
    /// Packets the engine wrote
    pub written: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn pair(capacity: usize) -> (Self, ChannelPeer) {
        let (inject, inbound) = mpsc::channel(capacity);
        let (outbound, written) = mpsc::unbounded_channel();
        (Self { inbound, outbound }, ChannelPeer { inject, written })
    }
}

#[async_trait]
impl PacketDevice for ChannelDevice {
    /// Pends forever once the injecting side is gone, like an idle interface.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inbound.recv().await {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => std::future::pending().await,
        }
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| TunnelError::ChannelClosed)
    }
}
