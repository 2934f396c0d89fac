use std::net::Ipv4Addr;

use anyhow::bail;

/// This is the UDP port all sessions use. Groups are distinguished by their multicast address.
pub const DEFAULT_PORT: u16 = 12175;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Selects the multicast group `225.0.0.{group_id}`
    pub group_id: u8,
    pub port: u16,

    /// The local interface for joining the group and sending to it. `0.0.0.0` leaves the choice
    ///  to the OS, which requires a multicast capable route. Tests and single-host setups can use
    ///  `127.0.0.1`.
    pub multicast_interface: Ipv4Addr,

    /// 1 keeps datagrams inside the local network segment
    pub multicast_ttl: u32,

    /// If set, a session does not receive the envelopes it sends itself
    pub drop_own_datagrams: bool,
}

impl SessionConfig {
    pub fn new(group_id: u8) -> SessionConfig {
        SessionConfig {
            group_id,
            port: DEFAULT_PORT,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 1,
            drop_own_datagrams: true,
        }
    }

    pub fn multicast_addr(&self) -> Ipv4Addr {
        Ipv4Addr::new(225, 0, 0, self.group_id)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            bail!("port must be set explicitly, all sessions of a group need to agree on it");
        }
        if !(1..=255).contains(&self.multicast_ttl) {
            bail!("multicast TTL must be in the range 1..=255, was {}", self.multicast_ttl);
        }
        if self.multicast_interface.is_multicast() {
            bail!("multicast interface must be a local interface address, was {}", self.multicast_interface);
        }
        Ok(())
    }
}
