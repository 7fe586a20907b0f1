//! Subnet broadcast of MAVC messages.
//!
//! A fresh UDP socket is opened for every broadcast and dropped afterwards;
//! oversized ACTION messages go out as ACTION_SEC sections, one after the other,
//! each send awaited before the next starts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use mavc_types::{split_into_sections, Message};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{ClusterError, Result};

/// True if the mask is a run of ones followed by a run of zeros.
pub fn is_contiguous_netmask(mask: Ipv4Addr) -> bool {
    let bits = u32::from(mask);
    bits.leading_ones() + bits.trailing_zeros() == 32
}

/// `address | !mask`, octet by octet.
pub fn broadcast_addr(address: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    let a = address.octets();
    let m = mask.octets();
    Ipv4Addr::new(a[0] | !m[0], a[1] | !m[1], a[2] | !m[2], a[3] | !m[3])
}

/// String form used by the UI layer: `("192.168.1.42", "255.255.255.0") -> "192.168.1.255"`.
pub fn get_broadcast_addr(address: &str, netmask: &str) -> Result<String> {
    let address: Ipv4Addr = address
        .parse()
        .map_err(|_| ClusterError::Config(format!("{address} is not an IPv4 address")))?;
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| ClusterError::Config(format!("{netmask} is not an IPv4 netmask")))?;
    if !is_contiguous_netmask(mask) {
        return Err(ClusterError::Config(format!("netmask {mask} is not contiguous")));
    }
    Ok(broadcast_addr(address, mask).to_string())
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    bind_ip: Ipv4Addr,
    target: SocketAddrV4,
    section_size: usize,
}

impl Broadcaster {
    pub fn new(bind_ip: Ipv4Addr, target: SocketAddrV4, section_size: usize) -> Self {
        Self { bind_ip, target, section_size }
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Broadcast `message`, fragmenting it if needed. Returns the number of
    /// datagrams sent.
    pub async fn send(&self, message: &Message) -> Result<usize> {
        let datagrams = split_into_sections(message, self.section_size)
            .iter()
            .map(Message::to_bytes)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let local = SocketAddr::V4(SocketAddrV4::new(self.bind_ip, 0));
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| ClusterError::Bind { kind: "UDP broadcast", addr: local, source })?;
        socket.set_broadcast(true)?;

        for (i, bytes) in datagrams.iter().enumerate() {
            socket.send_to(bytes, self.target).await?;
            debug!("MAVC: broadcast datagram {}/{} ({} bytes) → {}", i + 1, datagrams.len(), bytes.len(), self.target);
        }
        Ok(datagrams.len())
    }
}
