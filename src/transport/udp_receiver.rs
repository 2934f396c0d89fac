use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::transport::TransportError;
use crate::util::callback::invoke_guarded;

/// Big enough for any UDP payload, so datagrams are never truncated
const RECEIVE_BUFFER_LEN: usize = 64 * 1024;


#[derive(Debug, Clone)]
pub struct UdpReceiverConfig {
    /// The local interface used for joining a multicast group. `0.0.0.0` lets the OS choose.
    pub multicast_interface: Ipv4Addr,

    /// If set, datagrams sent from this port by any of this host's addresses are dropped. This
    ///  is how a component avoids receiving its own multicast datagrams.
    pub local_send_from_port: Option<u16>,
}

impl Default for UdpReceiverConfig {
    fn default() -> Self {
        UdpReceiverConfig {
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            local_send_from_port: None,
        }
    }
}

/// Receives datagrams on a background task, passing each datagram's payload, sender and receive
///  time to a callback. The callback is invoked on that task, one datagram at a time.
///
/// For a multicast address, the receiver binds to the group address with address reuse and joins
///  the group, so that any number of receivers on a host can share the group, and groups on the
///  same port stay apart. Unicast receivers bind exclusively.
pub struct UdpReceiver {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    cancel_sender: broadcast::Sender<()>,
}

impl UdpReceiver {
    pub async fn new<F>(address: IpAddr, port: u16, on_data: F) -> Result<UdpReceiver, TransportError>
    where F: FnMut(&[u8], SocketAddr, SystemTime) + Send + 'static
    {
        Self::with_config(address, port, UdpReceiverConfig::default(), on_data).await
    }

    pub async fn with_config<F>(address: IpAddr, port: u16, config: UdpReceiverConfig, on_data: F) -> Result<UdpReceiver, TransportError>
    where F: FnMut(&[u8], SocketAddr, SystemTime) + Send + 'static
    {
        let endpoint = SocketAddr::new(address, port);
        let socket = bind_socket(endpoint, &config)
            .map_err(|e| TransportError::unavailable(endpoint, e))?;
        let local_addr = socket.local_addr()?;
        info!("bound UDP receive socket to {:?} for {:?}", local_addr, endpoint);

        let own_datagram_filter = config.local_send_from_port
            .map(|port| OwnDatagramFilter::new(port, config.multicast_interface));

        let running = Arc::new(AtomicBool::new(true));
        let (cancel_sender, cancel_receiver) = broadcast::channel(1);

        tokio::spawn(receive_loop(socket, own_datagram_filter, on_data, running.clone(), cancel_receiver));

        Ok(UdpReceiver {
            local_addr,
            running,
            cancel_sender,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        if self.cancel_sender.send(()).is_err() {
            trace!("UDP receive loop on {:?} had terminated already", self.local_addr);
        }
    }
}

fn bind_socket(endpoint: SocketAddr, config: &UdpReceiverConfig) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(endpoint), Type::DGRAM, Some(Protocol::UDP))?;

    match endpoint.ip() {
        IpAddr::V4(group) if group.is_multicast() => {
            socket.set_reuse_address(true)?;
            #[cfg(unix)]
            socket.set_reuse_port(true)?;

            // binding to the group address keeps out datagrams for other groups on the same port
            #[cfg(unix)]
            let bind_addr = endpoint;
            #[cfg(not(unix))]
            let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), endpoint.port());
            socket.bind(&bind_addr.into())?;
            socket.join_multicast_v4(&group, &config.multicast_interface)?;
            debug!("joined multicast group {} on interface {}", group, config.multicast_interface);
        }
        _ => socket.bind(&endpoint.into())?,
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[tracing::instrument(name = "udp_receive_loop", skip_all, fields(local_addr = ?socket.local_addr().ok()))]
async fn receive_loop<F>(
    socket: UdpSocket,
    own_datagram_filter: Option<OwnDatagramFilter>,
    mut on_data: F,
    running: Arc<AtomicBool>,
    mut cancel_receiver: broadcast::Receiver<()>,
)
where F: FnMut(&[u8], SocketAddr, SystemTime) + Send + 'static
{
    let mut buf = vec![0u8; RECEIVE_BUFFER_LEN];

    debug!("starting UDP receive loop");
    loop {
        select! {
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, from)) => {
                        let receive_time = SystemTime::now();
                        if own_datagram_filter.as_ref().is_some_and(|f| f.is_own(from)) {
                            trace!("dropping own datagram from {:?}", from);
                            continue;
                        }

                        trace!("received datagram of {} bytes from {:?}", len, from);
                        invoke_guarded("udp on_data", || on_data(&buf[..len], from, receive_time));
                    }
                    Err(e) => {
                        warn!(error = ?e, "error receiving from datagram socket");
                    }
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }

    running.store(false, Ordering::Release);
    debug!("UDP receive loop terminated");
}


struct OwnDatagramFilter {
    send_from_port: u16,
    local_ips: Vec<IpAddr>,
}

impl OwnDatagramFilter {
    fn new(send_from_port: u16, multicast_interface: Ipv4Addr) -> OwnDatagramFilter {
        let mut local_ips = local_ipv4_addresses();
        local_ips.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        local_ips.push(IpAddr::V4(multicast_interface));

        OwnDatagramFilter {
            send_from_port,
            local_ips,
        }
    }

    fn is_own(&self, from: SocketAddr) -> bool {
        from.port() == self.send_from_port && self.local_ips.contains(&from.ip())
    }
}

#[cfg(unix)]
fn local_ipv4_addresses() -> Vec<IpAddr> {
    let mut result = Vec::new();

    let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: on success, getifaddrs stores a list that is released by freeifaddrs below
    if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
        warn!(error = ?std::io::Error::last_os_error(), "could not determine local interface addresses");
        return result;
    }

    let mut cur = ifaddrs;
    while !cur.is_null() {
        // SAFETY: `cur` is a non-null element of the list returned by getifaddrs
        let entry = unsafe { &*cur };
        if !entry.ifa_addr.is_null() {
            // SAFETY: ifa_addr points to a sockaddr whose actual type is given by its family
            unsafe {
                if (*entry.ifa_addr).sa_family as i32 == libc::AF_INET {
                    let addr = &*(entry.ifa_addr as *const libc::sockaddr_in);
                    result.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))));
                }
            }
        }
        cur = entry.ifa_next;
    }

    // SAFETY: `ifaddrs` was allocated by getifaddrs and is not used afterwards
    unsafe { libc::freeifaddrs(ifaddrs) };
    result
}

#[cfg(not(unix))]
fn local_ipv4_addresses() -> Vec<IpAddr> {
    Vec::new()
}
