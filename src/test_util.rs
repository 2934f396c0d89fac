use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::session::SessionConfig;

/// A segment name that is unique for this process and test run
pub fn unique_segment_name() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!("/cluon-test-{}-{}", std::process::id(), COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// A currently unused UDP port
pub fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

/// A session config that works on hosts without a multicast route, using the loopback interface
pub fn localhost_session_config(group_id: u8) -> SessionConfig {
    SessionConfig {
        port: free_udp_port(),
        multicast_interface: Ipv4Addr::LOCALHOST,
        ..SessionConfig::new(group_id)
    }
}
