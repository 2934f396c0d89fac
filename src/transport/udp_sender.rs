use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::transport::{SendStatus, TransportError};


#[derive(Debug, Clone)]
pub struct UdpSenderConfig {
    /// The local interface multicast datagrams are sent through. `0.0.0.0` leaves the choice to
    ///  the OS routing table.
    pub multicast_interface: Ipv4Addr,
    pub multicast_ttl: u32,
}

impl Default for UdpSenderConfig {
    fn default() -> Self {
        UdpSenderConfig {
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
        }
    }
}

/// Sends datagrams to a fixed destination from an ephemeral local port.
pub struct UdpSender {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSender {
    /// This is the biggest payload that fits into a single IPv4 UDP datagram
    pub const MAX_PAYLOAD_LEN: usize = 65_507;

    pub async fn new(address: IpAddr, port: u16) -> Result<UdpSender, TransportError> {
        Self::with_config(address, port, &UdpSenderConfig::default()).await
    }

    pub async fn with_config(address: IpAddr, port: u16, config: &UdpSenderConfig) -> Result<UdpSender, TransportError> {
        let destination = SocketAddr::new(address, port);
        let socket = Self::bind_socket(destination, config)
            .map_err(|e| TransportError::unavailable(destination, e))?;

        info!("bound UDP send socket to {:?} for destination {:?}", socket.local_addr()?, destination);
        Ok(UdpSender {
            socket,
            destination,
        })
    }

    fn bind_socket(destination: SocketAddr, config: &UdpSenderConfig) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(destination), Type::DGRAM, Some(Protocol::UDP))?;

        let local_addr = match destination {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        socket.bind(&local_addr.into())?;

        if let IpAddr::V4(group) = destination.ip() {
            if group.is_multicast() {
                socket.set_multicast_loop_v4(true)?;
                socket.set_multicast_ttl_v4(config.multicast_ttl)?;
                if !config.multicast_interface.is_unspecified() {
                    socket.set_multicast_if_v4(&config.multicast_interface)?;
                }
            }
        }

        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// The local port datagrams are sent from, or `0` if it can not be determined
    pub fn send_from_port(&self) -> u16 {
        self.socket.local_addr()
            .map(|a| a.port())
            .unwrap_or(0)
    }

    pub async fn send(&self, data: &[u8]) -> SendStatus {
        self.try_send(data).await.into()
    }

    pub async fn try_send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if data.len() > Self::MAX_PAYLOAD_LEN {
            debug!("not sending datagram of {} bytes to {:?}: too large", data.len(), self.destination);
            return Err(TransportError::MessageTooLarge {
                len: data.len(),
                max: Self::MAX_PAYLOAD_LEN,
            });
        }

        trace!("sending datagram of {} bytes to {:?}", data.len(), self.destination);
        let bytes_sent = self.socket.send_to(data, self.destination).await
            .inspect_err(|e| debug!(error = ?e, "error sending datagram to {:?}", self.destination))?;
        Ok(bytes_sent)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_send_unicast() {
        let receiver = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = UdpSender::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port).await.unwrap();
        assert_ne!(sender.send_from_port(), 0);
        assert_eq!(sender.destination(), SocketAddr::from(([127, 0, 0, 1], port)));

        let status = sender.send(b"ping").await;
        assert_eq!(status, SendStatus { bytes_sent: 4, error_code: 0 });

        let mut buf = [0u8; 16];
        let (len, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), sender.send_from_port());
    }

    #[tokio::test]
    async fn test_send_too_large() {
        let sender = UdpSender::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9).await.unwrap();

        let status = sender.send(&vec![0u8; UdpSender::MAX_PAYLOAD_LEN + 1]).await;
        assert_eq!(status, SendStatus { bytes_sent: 0, error_code: libc::E2BIG });
    }
}
