//! Datagram Transport
//!
//! The protocol cores never touch sockets. Workers drive them through the
//! [`Transport`] trait:
//! - [`UdpTransport`]: dual-stack UDP. IPv4 is always bound; IPv6 on the same
//!   port when the host supports it.
//! - [`MemoryNetwork`] / [`MemoryTransport`]: in-process delivery for tests.
//!
//! `send_to` is synchronous so the application thread can send a game packet
//! without entering the runtime. A send that would block is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::constants::MAX_PACKET_BYTES;
use crate::metrics::Metrics;

pub trait Transport: Send + Sync + 'static {
    fn local_address(&self) -> Address;

    fn send_to(&self, to: &Address, data: &[u8]) -> Result<()>;

    fn recv_from(&self) -> impl Future<Output = Result<(Address, Vec<u8>)>> + Send;
}

/// Send a batch of datagrams. Failures are logged and the datagram dropped.
pub fn send_all<T: Transport>(
    transport: &T,
    datagrams: Vec<(Address, Vec<u8>)>,
    metrics: &Metrics,
) -> usize {
    let mut sent = 0;
    for (to, data) in datagrams {
        match transport.send_to(&to, &data) {
            Ok(()) => sent += 1,
            Err(e) => debug!("Dropping {} byte datagram to {}: {:#}", data.len(), to, e),
        }
    }
    metrics.add_packets_tx(sent as u64);
    sent
}

// ============================================================================
// UDP
// ============================================================================

pub struct UdpTransport {
    pconn4: Arc<UdpSocket>,
    pconn6: Option<Arc<UdpSocket>>,
    local_address: Address,
}

impl UdpTransport {
    /// Bind to `bind_address`. An unspecified IPv4 address also tries to
    /// bind IPv6 on the same port.
    pub async fn bind(bind_address: SocketAddr) -> Result<Self> {
        if bind_address.is_ipv6() {
            let socket = UdpSocket::bind(bind_address)
                .await
                .context("Failed to bind IPv6 socket")?;
            let local = socket.local_addr()?;
            info!("Bound IPv6 socket on {}", local);
            return Ok(Self {
                pconn4: Arc::new(socket),
                pconn6: None,
                local_address: Address::from(local),
            });
        }

        let pconn4 = UdpSocket::bind(bind_address)
            .await
            .context("Failed to bind IPv4 socket")?;
        let local4 = pconn4.local_addr()?;
        info!("Bound IPv4 socket on {}", local4);

        let pconn6 = if bind_address.ip() == IpAddr::V4(Ipv4Addr::UNSPECIFIED) {
            let addr6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), local4.port());
            match UdpSocket::bind(addr6).await {
                Ok(socket) => {
                    info!("Bound IPv6 socket on {}", addr6);
                    Some(Arc::new(socket))
                }
                Err(e) => {
                    warn!("IPv6 not available: {}. Running in IPv4-only mode.", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            pconn4: Arc::new(pconn4),
            pconn6,
            local_address: Address::from(local4),
        })
    }

    pub fn has_ipv6(&self) -> bool {
        self.pconn6.is_some()
    }

    /// `pconn4` holds the only socket when bound to an IPv6 address.
    fn socket_for(&self, to: &SocketAddr) -> Option<&UdpSocket> {
        let primary_is_v6 = matches!(self.local_address, Address::V6 { .. });
        match (to, &self.pconn6) {
            (SocketAddr::V6(_), Some(pconn6)) => Some(pconn6),
            (SocketAddr::V6(_), None) if primary_is_v6 => Some(&self.pconn4),
            (SocketAddr::V4(_), _) if !primary_is_v6 => Some(&self.pconn4),
            _ => None,
        }
    }
}

async fn recv_datagram(socket: &UdpSocket) -> Result<(Address, Vec<u8>)> {
    let mut buf = vec![0u8; MAX_PACKET_BYTES];
    let (len, from) = socket
        .recv_from(&mut buf)
        .await
        .context("Failed to receive datagram")?;
    buf.truncate(len);
    Ok((Address::from(from), buf))
}

impl Transport for UdpTransport {
    fn local_address(&self) -> Address {
        self.local_address
    }

    fn send_to(&self, to: &Address, data: &[u8]) -> Result<()> {
        let Some(addr) = to.to_socket_addr() else {
            bail!("Cannot send to {}", to);
        };
        let Some(socket) = self.socket_for(&addr) else {
            bail!("No socket for address family of {}", addr);
        };
        match socket.try_send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("Send buffer full, dropping packet to {}", addr);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to send to {}", addr)),
        }
    }

    fn recv_from(&self) -> impl Future<Output = Result<(Address, Vec<u8>)>> + Send {
        let pconn4 = self.pconn4.clone();
        let pconn6 = self.pconn6.clone();
        async move {
            match pconn6 {
                Some(pconn6) => tokio::select! {
                    result = recv_datagram(&pconn4) => result,
                    result = recv_datagram(&pconn6) => result,
                },
                None => recv_datagram(&pconn4).await,
            }
        }
    }
}

// ============================================================================
// In-memory network
// ============================================================================

type Datagram = (Address, Vec<u8>);

/// A switch connecting [`MemoryTransport`]s by address. Datagrams to an
/// address nobody bound are dropped, like UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<HashMap<Address, mpsc::UnboundedSender<Datagram>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, address: Address) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().insert(address, tx);
        MemoryTransport {
            address,
            network: self.clone(),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    fn deliver(&self, from: Address, to: &Address, data: &[u8]) {
        let endpoints = self.endpoints.lock();
        if let Some(tx) = endpoints.get(to) {
            let _ = tx.send((from, data.to_vec()));
        }
    }
}

pub struct MemoryTransport {
    address: Address,
    network: MemoryNetwork,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>>,
}

impl Transport for MemoryTransport {
    fn local_address(&self) -> Address {
        self.address
    }

    fn send_to(&self, to: &Address, data: &[u8]) -> Result<()> {
        self.network.deliver(self.address, to, data);
        Ok(())
    }

    fn recv_from(&self) -> impl Future<Output = Result<(Address, Vec<u8>)>> + Send {
        let receiver = self.receiver.clone();
        async move {
            receiver
                .lock()
                .await
                .recv()
                .await
                .context("Memory network closed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_delivery() {
        let network = MemoryNetwork::new();
        let a = network.bind("10.0.0.1:1000".parse().unwrap());
        let b = network.bind("10.0.0.2:2000".parse().unwrap());

        a.send_to(&b.local_address(), b"ping").unwrap();
        // Unbound destination is silently dropped.
        a.send_to(&"10.0.0.3:3000".parse().unwrap(), b"lost").unwrap();

        let (from, data) = b.recv_from().await.unwrap();
        assert_eq!(from, a.local_address());
        assert_eq!(data, b"ping");
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let a = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert!(!a.has_ipv6());

        a.send_to(&b.local_address(), b"hello").unwrap();
        let (from, data) = b.recv_from().await.unwrap();
        assert_eq!(from, a.local_address());
        assert_eq!(data, b"hello");
    }
}
