//! UDP transport for the direct peer path

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::protocol::{Packet, MAX_DATAGRAM_SIZE};

use super::error::NetworkError;

/// UDP transport for sending and receiving direct-path datagrams
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    pub async fn bind(addr: &str) -> Result<Self, NetworkError> {
        let parsed_addr: SocketAddr = addr.parse()?;

        let domain = if parsed_addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // SO_REUSEADDR allows quick rebind after an instance is torn down
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&parsed_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Borrow the underlying socket, for STUN discovery before the receive
    /// loop starts
    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send one framed packet to a remote address
    pub async fn send_to(&self, packet: &Packet, addr: SocketAddr) -> Result<(), NetworkError> {
        let data = packet.to_bytes();
        self.socket.send_to(&data, addr).await?;
        trace!("Sent {} bytes to {}", data.len(), addr);
        Ok(())
    }

    /// Receive one framed packet (with sender address). The buffer holds
    /// the largest possible datagram, so a read can never truncate.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), NetworkError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(len);

        let packet = Packet::from_bytes(&buf).ok_or(NetworkError::InvalidPacket)?;
        trace!("Received {} bytes from {}", len, addr);

        Ok((packet, addr))
    }

    /// Spawn a receive loop feeding parsed packets into a channel.
    /// Malformed datagrams are dropped, socket errors end the loop.
    pub fn start_receive_loop(
        self: Arc<Self>,
    ) -> (
        mpsc::Receiver<(Packet, SocketAddr)>,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(1024);
        let socket = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                match socket.recv_from().await {
                    Ok((packet, addr)) => {
                        if tx.send((packet, addr)).await.is_err() {
                            debug!("Receive channel closed, stopping receive loop");
                            break;
                        }
                    }
                    Err(NetworkError::InvalidPacket) => {
                        trace!("Dropped malformed datagram");
                    }
                    Err(e) => {
                        warn!("Receive error, stopping receive loop: {}", e);
                        break;
                    }
                }
            }
        });

        (rx, handle)
    }
}
