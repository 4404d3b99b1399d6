//! IPv4 datagram engine: ingress validation/dispatch and egress framing.
//!
//! Grounded on `drivers/src/net/ipv4.rs`: the same
//! validate-then-dispatch `handle_rx` shape. Egress drops the
//! routing-table lookup and packet-queueing-while-ARP-resolves machinery —
//! this stack manages a single directly-connected interface (Non-goals:
//! multi-interface routing), so there is no route to look up, and a send
//! that needs ARP to resolve first simply fails with
//! [`NetError::WouldBlock`] for the caller to retry, exactly as described
//! for the egress data flow.

use log::debug;

use crate::ingress::IfaceContext;
use crate::packetbuf::PacketBuf;
use crate::types::{IpProtocol, Ipv4Addr, NetError};

const DEFAULT_TTL: u8 = 64;
/// "Don't fragment" + no flags, fragment offset 0 — the only flags/offset
/// word this engine ever produces or accepts (Non-goals: fragmentation).
const FLAGS_DF_NO_FRAG: u16 = 0x4000;

/// Handle an incoming IPv4 datagram, already stripped of its Ethernet
/// framing. Called from the ingress dispatch as frames drain off the
/// `ETHERTYPE_IPV4` queue.
pub fn handle_rx(iface: &IfaceContext, mut pkt: PacketBuf, now_ms: u64) {
    let (proto, src, dst, ihl) = {
        let data = pkt.payload();
        if data.len() < crate::IPV4_HEADER_LEN {
            debug!("ipv4: packet too short ({} bytes)", data.len());
            return;
        }
        let version = data[0] >> 4;
        if version != 4 {
            debug!("ipv4: bad version {version}");
            return;
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < crate::IPV4_HEADER_LEN || data.len() < ihl {
            debug!("ipv4: bad IHL {ihl} (packet len {})", data.len());
            return;
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if total_len > data.len() {
            debug!("ipv4: total_len {total_len} exceeds packet len {}", data.len());
            return;
        }
        let flags_frag = u16::from_be_bytes([data[6], data[7]]);
        let more_fragments = flags_frag & 0x2000 != 0;
        let frag_offset = flags_frag & 0x1FFF;
        if more_fragments || frag_offset != 0 {
            debug!("ipv4: fragmented datagram, dropping (unsupported)");
            return;
        }
        if crate::ipv4_header_checksum(&data[..ihl]) != 0 {
            debug!("ipv4: bad header checksum");
            return;
        }
        let ttl = data[8];
        if ttl == 0 {
            debug!("ipv4: TTL=0, dropping");
            return;
        }
        let proto = data[9];
        let src = Ipv4Addr(data[12..16].try_into().expect("slice is exactly 4 bytes"));
        let dst = Ipv4Addr(data[16..20].try_into().expect("slice is exactly 4 bytes"));
        (proto, src, dst, ihl)
    };

    if dst != iface.ipv4 && !iface.is_local_broadcast(dst) {
        debug!("ipv4: datagram for {dst}, not us, dropping");
        return;
    }

    pkt.set_l4(pkt.head() + ihl as u16);
    if pkt.pull_header(ihl).is_err() {
        return;
    }

    match IpProtocol::from(proto) {
        IpProtocol::Icmp => crate::icmp::handle_rx(iface, src, dst, pkt, now_ms),
        IpProtocol::Udp => crate::udp::handle_rx(&iface.udp, src, dst, &pkt),
        IpProtocol::Tcp => crate::tcp::handle_rx(&iface.tcp, iface, src, dst, &pkt, now_ms),
        IpProtocol::Other(n) => debug!("ipv4: unsupported protocol {n}, dropping"),
    }
}

/// Build a 20-byte IPv4 header (no options) into `buf`'s headroom and
/// compute its checksum.
fn write_header(buf: &mut PacketBuf, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8) -> Result<(), NetError> {
    let total_len = crate::IPV4_HEADER_LEN + buf.len();
    let hdr = buf.push_header(crate::IPV4_HEADER_LEN)?;
    hdr[0] = 0x45; // version 4, IHL 5
    hdr[1] = 0; // DSCP/ECN
    hdr[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    hdr[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    hdr[6..8].copy_from_slice(&FLAGS_DF_NO_FRAG.to_be_bytes());
    hdr[8] = DEFAULT_TTL;
    hdr[9] = protocol;
    hdr[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    hdr[12..16].copy_from_slice(&src.0);
    hdr[16..20].copy_from_slice(&dst.0);

    buf.set_l3(buf.head());
    buf.set_l4(buf.head() + crate::IPV4_HEADER_LEN as u16);
    let checksum = buf.compute_ipv4_checksum();
    let hdr = &mut buf.payload_mut()[0..crate::IPV4_HEADER_LEN];
    hdr[10..12].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Frame and send an IPv4 datagram whose L4 payload is already appended to
/// `pkt`. Resolves the next hop via ARP, failing with
/// [`NetError::WouldBlock`] if resolution is still pending.
pub fn send(iface: &IfaceContext, dst: Ipv4Addr, protocol: u8, mut pkt: PacketBuf, now_ms: u64) -> Result<(), NetError> {
    write_header(&mut pkt, iface.ipv4, dst, protocol)?;

    let dst_mac = if iface.is_local_broadcast(dst) {
        crate::types::MacAddr::BROADCAST
    } else {
        crate::arp::resolve(iface, dst, now_ms)?
    };

    write_eth_header(&mut pkt, dst_mac, iface.dev.mac())?;
    iface.dev.tx(pkt)
}

fn write_eth_header(buf: &mut PacketBuf, dst: crate::types::MacAddr, src: crate::types::MacAddr) -> Result<(), NetError> {
    let hdr = buf.push_header(crate::ETH_HEADER_LEN)?;
    hdr[0..6].copy_from_slice(&dst.0);
    hdr[6..12].copy_from_slice(&src.0);
    hdr[12..14].copy_from_slice(&crate::ETHERTYPE_IPV4.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::NeighborCache;
    use crate::netdev::{DeviceHandle, NetDevice, NetDeviceFeatures, NetDeviceRegistry, NetDeviceStats};
    use crate::types::MacAddr;
    use std::sync::{Arc, Mutex};

    struct MockDevice {
        mac: MacAddr,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl NetDevice for MockDevice {
        fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
            self.sent.lock().unwrap().push(pkt.payload().to_vec());
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
            self.mac
        }
        fn stats(&self) -> NetDeviceStats {
            NetDeviceStats::default()
        }
        fn features(&self) -> NetDeviceFeatures {
            NetDeviceFeatures::empty()
        }
    }

    fn mock_iface() -> IfaceContext {
        let dev = Arc::new(MockDevice {
            mac: MacAddr([2, 0, 0, 0, 0, 1]),
            sent: Mutex::new(Vec::new()),
        });
        let registry = NetDeviceRegistry::new();
        let handle: DeviceHandle = registry.register(dev);
        IfaceContext {
            dev: handle,
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 0, 0, 255),
            neighbors: NeighborCache::new(8),
            udp: crate::udp::UdpTable::new(),
            tcp: crate::tcp::TcpTable::new(),
        }
    }

    #[test]
    fn send_without_resolved_neighbor_returns_would_block() {
        let iface = mock_iface();
        let pkt = PacketBuf::alloc().unwrap();
        let err = send(&iface, Ipv4Addr::new(10, 0, 0, 77), crate::IPPROTO_UDP, pkt, 0).unwrap_err();
        assert_eq!(err, NetError::WouldBlock);
    }

    #[test]
    fn send_broadcast_needs_no_resolution() {
        let iface = mock_iface();
        let pkt = PacketBuf::alloc().unwrap();
        send(&iface, Ipv4Addr::new(10, 0, 0, 255), crate::IPPROTO_UDP, pkt, 0).unwrap();
    }

    #[test]
    fn handle_rx_drops_bad_checksum() {
        let iface = mock_iface();
        let mut pkt = PacketBuf::alloc().unwrap();
        let mut header = [0u8; 20];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&20u16.to_be_bytes());
        header[8] = 64;
        header[9] = crate::IPPROTO_UDP;
        header[10..12].copy_from_slice(&0xdeadu16.to_be_bytes());
        header[12..16].copy_from_slice(&[10, 0, 0, 2]);
        header[16..20].copy_from_slice(&[10, 0, 0, 1]);
        pkt.append(&header).unwrap();
        handle_rx(&iface, pkt, 0);
    }
}
