//! UDP endpoints.
//!
//! A thin wrapper around tokio's `UdpSocket` with configurable send/receive
//! buffer sizes. Endpoints are cheap to clone; clones share one socket, so a
//! service can keep sending while a dispatcher reads.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Largest datagram an endpoint will read.
pub const MAX_DATAGRAM: usize = 65_536;

/// Endpoint configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address to bind to
    pub bind: SocketAddr,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            sndbuf: 1024 * 1024, // 1MB
            rcvbuf: 1024 * 1024, // 1MB
        }
    }
}

impl TransportConfig {
    /// Default buffers, bound to `bind`.
    pub fn bind(bind: SocketAddr) -> Self {
        Self {
            bind,
            ..Default::default()
        }
    }

    /// Ephemeral port on the loopback interface.
    pub fn loopback() -> Self {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
    }
}

/// A bound UDP socket.
#[derive(Debug, Clone)]
pub struct Endpoint {
    socket: Arc<UdpSocket>,
}

impl Endpoint {
    /// Bind with the configured buffer sizes
    pub async fn bind(cfg: TransportConfig) -> anyhow::Result<Self> {
        let domain = if cfg.bind.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Set buffer sizes before binding
        socket.set_send_buffer_size(cfg.sndbuf)?;
        socket.set_recv_buffer_size(cfg.rcvbuf)?;
        socket.set_reuse_address(true)?;

        socket.bind(&cfg.bind.into())?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        tracing::info!(
            "UDP endpoint bound to {} (sndbuf={}, rcvbuf={})",
            socket.local_addr()?,
            cfg.sndbuf,
            cfg.rcvbuf
        );

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Send one datagram
    pub async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let sent = self.socket.send_to(data, addr).await?;
        if sent != data.len() {
            anyhow::bail!("short send to {addr}: {sent} of {} bytes", data.len());
        }
        Ok(())
    }

    /// Receive one datagram from any sender
    pub async fn recv_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        let (len, addr) = self.socket.recv_from(buf).await?;
        Ok((len, addr))
    }

    /// Receive one datagram, giving up after `timeout`
    pub async fn recv_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> anyhow::Result<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(received) => Ok(Some(received?)),
            Err(_) => Ok(None),
        }
    }

    /// Get the underlying socket
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Get the local address this endpoint is bound to
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
