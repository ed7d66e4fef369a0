//! Socket address extraction.
//!
//! `sockaddr` structures come from user-space and may be truncated or only
//! partially mapped. Every field is read on its own: a failure leaves the
//! field zeroed and extraction goes on.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use probe_common::{MemoryReader, field_addr};
use serde::{Deserialize, Serialize};

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

pub const SOCK_STREAM: i16 = 1;
pub const SOCK_DGRAM: i16 = 2;

// sockaddr_in: family(2) port(2) addr(4)
const SIN_PORT_OFFSET: u64 = 2;
const SIN_ADDR_OFFSET: u64 = 4;
// sockaddr_in6: family(2) port(2) flowinfo(4) addr(16)
const SIN6_ADDR_OFFSET: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Protocol {
    Tcp = 6,
    Udp = 17,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Destination of a connection in a fixed width form.
///
/// IPv4 addresses use the first four bytes of `addr`, in network order, the
/// rest is zero. IPv6 addresses are stored as they are found in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressInfo {
    pub family: u16,
    pub addr: [u64; 2],
    /// Host byte order
    pub port: u16,
}

impl AddressInfo {
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        let mut bytes = [0; 16];
        bytes[..4].copy_from_slice(&ip.octets());
        Self {
            family: AF_INET,
            addr: words(bytes),
            port,
        }
    }

    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        Self {
            family: AF_INET6,
            addr: words(ip.octets()),
            port,
        }
    }

    pub fn octets(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        bytes[..8].copy_from_slice(&self.addr[0].to_ne_bytes());
        bytes[8..].copy_from_slice(&self.addr[1].to_ne_bytes());
        bytes
    }

    /// The address as a std type, `None` for unknown families.
    pub fn ip(&self) -> Option<IpAddr> {
        let bytes = self.octets();
        match self.family {
            AF_INET => Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).into()),
            AF_INET6 => Some(Ipv6Addr::from(bytes).into()),
            _ => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for AddressInfo {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v) => AddressInfo::ipv4(*v.ip(), v.port()),
            SocketAddr::V6(v) => AddressInfo::ipv6(*v.ip(), v.port()),
        }
    }
}

impl fmt::Display for AddressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{addr}"),
            None => write!(f, "<family {}>", self.family),
        }
    }
}

fn words(bytes: [u8; 16]) -> [u64; 2] {
    let mut low = [0; 8];
    let mut high = [0; 8];
    low.copy_from_slice(&bytes[..8]);
    high.copy_from_slice(&bytes[8..]);
    [u64::from_ne_bytes(low), u64::from_ne_bytes(high)]
}

/// Read the `sockaddr` at `sockaddr`.
///
/// `declared_len` is the length passed along with the pointer. When non-zero,
/// fields extending past it are not read.
pub fn extract<M: MemoryReader>(memory: &M, sockaddr: u64, declared_len: u32) -> AddressInfo {
    let fits = |offset: u64, len: u64| declared_len == 0 || offset + len <= declared_len as u64;

    let mut info = AddressInfo::default();
    if !fits(0, 2) {
        return info;
    }
    let Ok(family) = memory.read_u16(sockaddr) else {
        log::trace!("unreadable sockaddr at {sockaddr:#x}");
        return info;
    };
    info.family = family;

    let addr_len = match family {
        AF_INET => 4,
        AF_INET6 => 16,
        _ => return info,
    };

    if fits(SIN_PORT_OFFSET, 2) {
        let port =
            field_addr(sockaddr, SIN_PORT_OFFSET).and_then(|addr| memory.read_array::<2>(addr));
        if let Ok(port) = port {
            info.port = u16::from_be_bytes(port);
        }
    }

    let addr_offset = if family == AF_INET {
        SIN_ADDR_OFFSET
    } else {
        SIN6_ADDR_OFFSET
    };
    if fits(addr_offset, addr_len as u64) {
        let mut bytes = [0; 16];
        if field_addr(sockaddr, addr_offset)
            .and_then(|addr| memory.read_bytes(&mut bytes[..addr_len], addr))
            .is_ok()
        {
            info.addr = words(bytes);
        }
    }
    info
}

/// Location of the `type` field inside `struct socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketLayout {
    pub type_offset: u64,
}

impl Default for SocketLayout {
    fn default() -> Self {
        Self { type_offset: 4 }
    }
}

/// Transport protocol of the socket at `socket`.
pub fn socket_protocol<M: MemoryReader>(
    memory: &M,
    socket: u64,
    layout: &SocketLayout,
) -> Option<Protocol> {
    let addr = field_addr(socket, layout.type_offset).ok()?;
    match memory.read_i16(addr).ok()? {
        SOCK_STREAM => Some(Protocol::Tcp),
        SOCK_DGRAM => Some(Protocol::Udp),
        _ => None,
    }
}
