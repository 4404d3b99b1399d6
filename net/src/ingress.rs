//! Ethernet framing and the per-interface context shared by every protocol
//! engine.
//!
//! Grounded on `drivers/src/net/ingress.rs::net_rx`: validate
//! length, parse destination MAC and EtherType, filter by MAC, record the
//! L2/L3 offsets, and hand the stripped frame onward. The FIFO-per-protocol
//! queuing and softirq draining this feeds into is `ustack-core`'s
//! responsibility (§4.3) — this module only does the parsing a device's ISR
//! would do before it ever touches a queue.

use log::debug;

use crate::neighbor::NeighborCache;
use crate::netdev::DeviceHandle;
use crate::packetbuf::PacketBuf;
use crate::tcp::TcpTable;
use crate::types::{EtherType, Ipv4Addr, MacAddr, NetError};
use crate::udp::UdpTable;

/// The single `(device, IPv4)` interface this stack manages (Non-goals:
/// multi-interface routing). Holds everything ARP, IPv4, UDP, and TCP need
/// without reaching back into a global registry.
pub struct IfaceContext {
    pub dev: DeviceHandle,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub neighbors: NeighborCache,
    pub udp: UdpTable,
    pub tcp: TcpTable,
}

impl IfaceContext {
    pub fn new(dev: DeviceHandle, ipv4: Ipv4Addr, netmask: Ipv4Addr, broadcast: Ipv4Addr, cache_capacity: usize) -> Self {
        IfaceContext {
            dev,
            ipv4,
            netmask,
            broadcast,
            neighbors: NeighborCache::new(cache_capacity),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
        }
    }

    /// As [`new`](Self::new), but with non-default ARP cache expiry timing
    /// (wired through from `StackConfig`).
    pub fn with_arp_timing(
        dev: DeviceHandle,
        ipv4: Ipv4Addr,
        netmask: Ipv4Addr,
        broadcast: Ipv4Addr,
        cache_capacity: usize,
        arp_incomplete_ttl_ms: u64,
        arp_max_retransmits: u8,
    ) -> Self {
        IfaceContext {
            dev,
            ipv4,
            netmask,
            broadcast,
            neighbors: NeighborCache::with_timing(cache_capacity, arp_incomplete_ttl_ms, arp_max_retransmits),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
        }
    }

    pub fn is_ours(&self, addr: Ipv4Addr) -> bool {
        addr == self.ipv4
    }

    pub fn is_local_broadcast(&self, addr: Ipv4Addr) -> bool {
        addr == self.broadcast || addr == Ipv4Addr::BROADCAST
    }

    /// Caller-facing snapshot of this interface's configuration and device
    /// state, in the stable `ustack-abi` layout.
    pub fn info(&self) -> ustack_abi::InterfaceInfo {
        ustack_abi::InterfaceInfo {
            ipv4: self.ipv4.0,
            netmask: self.netmask.0,
            broadcast: self.broadcast.0,
            mac: self.dev.mac().0,
            mtu: self.dev.mtu(),
            link_up: self.dev.is_up(),
        }
    }
}

/// Strip the Ethernet header from `buf`, recording L2/L3 offsets.
fn strip_ethernet(buf: &mut PacketBuf) -> Result<(MacAddr, EtherType), NetError> {
    if buf.len() < crate::ETH_HEADER_LEN {
        return Err(NetError::Malformed);
    }
    buf.set_l2(buf.head());
    let hdr = buf.pull_header(crate::ETH_HEADER_LEN)?;
    let dst = MacAddr(hdr[0..6].try_into().expect("slice is exactly 6 bytes"));
    let ethertype = u16::from_be_bytes([hdr[12], hdr[13]]);
    buf.set_l3(buf.head());
    Ok((dst, EtherType::from(ethertype)))
}

/// The ISR-equivalent entry point: parse a raw frame, filter by destination
/// MAC, and return the stripped payload plus the EtherType to route it by.
/// Returns `None` for frames this interface should silently drop (too
/// short, or addressed to neither us nor the broadcast address).
pub fn demux(iface: &IfaceContext, raw: &[u8]) -> Option<(EtherType, PacketBuf)> {
    let mut buf = PacketBuf::from_raw_copy(raw)?;
    let (dst, ethertype) = match strip_ethernet(&mut buf) {
        Ok(v) => v,
        Err(_) => {
            debug!("ingress: frame shorter than an Ethernet header, dropping");
            return None;
        }
    };
    if dst != iface.dev.mac() && !dst.is_broadcast() {
        return None;
    }
    Some((ethertype, buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdev::{NetDevice, NetDeviceFeatures, NetDeviceRegistry, NetDeviceStats};
    use std::sync::Arc;

    struct StubDevice(MacAddr);
    impl NetDevice for StubDevice {
        fn tx(&self, _: PacketBuf) -> Result<(), NetError> {
            Ok(())
        }
        fn set_up(&self) {}
        fn set_down(&self) {}
        fn is_up(&self) -> bool {
            true
        }
        fn mtu(&self) -> u16 {
            1500
        }
        fn mac(&self) -> MacAddr {
            self.0
        }
        fn stats(&self) -> NetDeviceStats {
            NetDeviceStats::default()
        }
        fn features(&self) -> NetDeviceFeatures {
            NetDeviceFeatures::empty()
        }
    }

    fn iface() -> IfaceContext {
        let registry = NetDeviceRegistry::new();
        let handle = registry.register(Arc::new(StubDevice(MacAddr([2, 0, 0, 0, 0, 9]))));
        IfaceContext::new(
            handle,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 255),
            8,
        )
    }

    #[test]
    fn short_frame_is_dropped() {
        let iface = iface();
        assert!(demux(&iface, &[0u8; 4]).is_none());
    }

    #[test]
    fn frame_for_other_mac_is_dropped() {
        let iface = iface();
        let mut frame = vec![0u8; 18];
        frame[0..6].copy_from_slice(&[9, 9, 9, 9, 9, 9]);
        frame[12..14].copy_from_slice(&crate::ETHERTYPE_ARP.to_be_bytes());
        assert!(demux(&iface, &frame).is_none());
    }

    #[test]
    fn frame_for_us_is_accepted() {
        let iface = iface();
        let mut frame = vec![0u8; 18];
        frame[0..6].copy_from_slice(&iface.dev.mac().0);
        frame[12..14].copy_from_slice(&crate::ETHERTYPE_ARP.to_be_bytes());
        let (ethertype, buf) = demux(&iface, &frame).unwrap();
        assert_eq!(ethertype, EtherType::Arp);
        assert_eq!(buf.len(), 4);
    }
}
