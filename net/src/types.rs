//! Address newtypes and the crate-wide error enum.
//!
//! Generalized from `drivers/src/net/types.rs`: the same
//! newtype-per-field-kind shape (`Ipv4Addr`, `Port`, `MacAddr`, `DevIndex`),
//! but `NetError` derives `thiserror::Error` rather than hand-writing
//! `Display`, since this crate targets hosted `std` rather than `no_std`.

use std::fmt;

use ustack_abi::SockAddrIn;

/// A 32-bit IPv4 address, stored in network-independent byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr([0, 0, 0, 0]);
    pub const BROADCAST: Ipv4Addr = Ipv4Addr([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    pub const fn is_unspecified(&self) -> bool {
        matches!(self.0, [0, 0, 0, 0])
    }

    pub const fn to_u32_be(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn from_u32_be(v: u32) -> Self {
        Ipv4Addr(v.to_be_bytes())
    }

    /// Whether `self` is the network/broadcast address of `self`'s own
    /// subnet under `netmask`, or the all-ones broadcast address.
    pub fn is_broadcast_for(&self, netmask: Ipv4Addr, broadcast: Ipv4Addr) -> bool {
        *self == Self::BROADCAST || *self == broadcast || netmask.to_u32_be() == 0
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A 16-bit transport port number, in host byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(pub u16);

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A 6-byte Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    pub const fn is_broadcast(&self) -> bool {
        matches!(self.0, [0xff, 0xff, 0xff, 0xff, 0xff, 0xff])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Index of a registered device within the device registry.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevIndex(pub usize);

impl fmt::Display for DevIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl fmt::Debug for DevIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// An IPv4 socket address (address + port).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub struct SockAddr {
    pub addr: Ipv4Addr,
    pub port: Port,
}

impl SockAddr {
    pub const UNSPECIFIED: SockAddr = SockAddr {
        addr: Ipv4Addr::UNSPECIFIED,
        port: Port(0),
    };

    /// Parse from a caller-facing [`SockAddrIn`], validating
    /// `family == AF_INET` and converting the big-endian (`htons`) port back
    /// to host order.
    pub fn from_user(raw: &SockAddrIn) -> Result<Self, NetError> {
        if raw.family != ustack_abi::AF_INET {
            return Err(NetError::UnsupportedFamily);
        }
        Ok(SockAddr {
            addr: Ipv4Addr(raw.addr),
            port: Port(u16::from_be(raw.port)),
        })
    }

    /// Serialize to the caller-facing [`SockAddrIn`] layout, storing the
    /// port as `htons(port)` per its big-endian contract.
    pub fn to_user(&self) -> SockAddrIn {
        SockAddrIn {
            family: ustack_abi::AF_INET,
            port: self.port.0.to_be(),
            addr: self.addr.0,
            _pad: [0; 8],
        }
    }
}

/// EtherType values the stack dispatches on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EtherType {
    Ipv4,
    Arp,
    Other(u16),
}

impl From<u16> for EtherType {
    fn from(v: u16) -> Self {
        match v {
            crate::ETHERTYPE_IPV4 => EtherType::Ipv4,
            crate::ETHERTYPE_ARP => EtherType::Arp,
            other => EtherType::Other(other),
        }
    }
}

impl From<EtherType> for u16 {
    fn from(v: EtherType) -> u16 {
        match v {
            EtherType::Ipv4 => crate::ETHERTYPE_IPV4,
            EtherType::Arp => crate::ETHERTYPE_ARP,
            EtherType::Other(v) => v,
        }
    }
}

/// IPv4 protocol numbers the stack dispatches on.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(v: u8) -> Self {
        match v {
            crate::IPPROTO_ICMP => IpProtocol::Icmp,
            crate::IPPROTO_TCP => IpProtocol::Tcp,
            crate::IPPROTO_UDP => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

/// The stack's single error type, crossing every crate boundary.
///
/// Matches the taxonomy in the error handling design: input validation
/// failures are dropped silently at the point of detection and never reach
/// this type; everything a caller can observe is represented here.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    #[error("unsupported address family")]
    UnsupportedFamily,
    #[error("no route to host")]
    NoRoute,
    #[error("address resolution pending, retry")]
    WouldBlock,
    #[error("neighbor cache or queue allocation failed")]
    NoBuffers,
    #[error("frame exceeds device MTU")]
    Oversize,
    #[error("device is not up")]
    DeviceDown,
    #[error("device I/O failure")]
    DeviceIo,
    #[error("address already in use")]
    AddrInUse,
    #[error("no such bound socket")]
    NotFound,
    #[error("operation invalid for current connection state")]
    InvalidState,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("operation timed out")]
    TimedOut,
    #[error("blocking call was interrupted")]
    Interrupted,
    #[error("connection table full")]
    TableFull,
    #[error("malformed or short frame")]
    Malformed,
}

impl NetError {
    /// POSIX-ish errno, kept for parity with socket-style callers; the
    /// stack's own control flow matches on variants directly and never uses
    /// this.
    pub fn to_errno(self) -> i32 {
        match self {
            NetError::UnsupportedFamily => libc_like::EAFNOSUPPORT,
            NetError::NoRoute => libc_like::EHOSTUNREACH,
            NetError::WouldBlock => libc_like::EAGAIN,
            NetError::NoBuffers => libc_like::ENOBUFS,
            NetError::Oversize => libc_like::EMSGSIZE,
            NetError::DeviceDown => libc_like::ENETDOWN,
            NetError::DeviceIo => libc_like::EIO,
            NetError::AddrInUse => libc_like::EADDRINUSE,
            NetError::NotFound => libc_like::ENOTCONN,
            NetError::InvalidState => libc_like::EINVAL,
            NetError::ConnectionReset => libc_like::ECONNRESET,
            NetError::ConnectionRefused => libc_like::ECONNREFUSED,
            NetError::TimedOut => libc_like::ETIMEDOUT,
            NetError::Interrupted => libc_like::EINTR,
            NetError::TableFull => libc_like::ENOBUFS,
            NetError::Malformed => libc_like::EINVAL,
        }
    }
}

/// Numeric values mirroring the POSIX errno constants `to_errno` reports.
/// Kept local rather than pulled from `libc` — this crate has no other need
/// for that dependency and the values are part of a stable external ABI.
mod libc_like {
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const EINVAL: i32 = 22;
    pub const ENOBUFS: i32 = 105;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECONNREFUSED: i32 = 111;
    pub const EHOSTUNREACH: i32 = 113;
    pub const EADDRINUSE: i32 = 98;
    pub const ENETDOWN: i32 = 100;
    pub const EMSGSIZE: i32 = 90;
    pub const EAFNOSUPPORT: i32 = 97;
    pub const ECONNRESET: i32 = 104;
    pub const ENOTCONN: i32 = 107;
    pub const EINTR: i32 = 4;
}

/// A borrowed scatter/gather read buffer list, mirroring `std::io::IoSlice`
/// but over a plain `&[u8]` for protocol-internal use without pulling in
/// `std::io` trait bounds.
pub type IoSlice<'a> = &'a [u8];
/// A borrowed scatter/gather write buffer list.
pub type IoSliceMut<'a> = &'a mut [u8];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_sockaddr_round_trips_through_big_endian_port() {
        let addr = SockAddr {
            addr: Ipv4Addr::new(10, 0, 0, 7),
            port: Port(8080),
        };
        let raw = addr.to_user();
        assert_eq!(raw.port, 8080u16.to_be());
        assert_eq!(SockAddr::from_user(&raw).unwrap(), addr);
    }

    #[test]
    fn from_user_rejects_non_inet_family() {
        let raw = SockAddrIn {
            family: ustack_abi::AF_INET + 1,
            port: 0,
            addr: [0; 4],
            _pad: [0; 8],
        };
        assert_eq!(SockAddr::from_user(&raw).unwrap_err(), NetError::UnsupportedFamily);
    }
}
