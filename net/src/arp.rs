//! ARP (RFC 826) protocol handler and egress resolver.
//!
//! Grounded on `drivers/src/net/arp.rs`: the same
//! validate → extract → merge-or-insert → conditionally-reply shape, built
//! atop this crate's [`NeighborCache`](crate::neighbor::NeighborCache)
//! instead of a priority-eviction cache.

use log::{debug, trace, warn};

use crate::ingress::IfaceContext;
use crate::neighbor::{NeighborAction, ResolveOutcome};
use crate::netdev::DeviceHandle;
use crate::packetbuf::PacketBuf;
use crate::types::{Ipv4Addr, MacAddr, NetError};
use crate::{ARP_HTYPE_ETHERNET, ARP_OPER_REPLY, ARP_OPER_REQUEST, ARP_PACKET_LEN, ETHERTYPE_ARP};

const ARP_PLEN_IPV4: u8 = 4;
const ARP_HLEN_ETHERNET: u8 = 6;

/// `resolve(iface, protocol_addr) -> {FOUND, INCOMPLETE, ERROR}` (§4.4),
/// performing whatever I/O the cache's decision requires before returning.
pub fn resolve(iface: &IfaceContext, pa: Ipv4Addr, now_ms: u64) -> Result<MacAddr, NetError> {
    let (outcome, action) = iface.neighbors.resolve(pa, now_ms);
    if let NeighborAction::SendRequest(pa) = action {
        if let Err(e) = send_request(iface, pa) {
            warn!("arp: failed to emit request for {pa}: {e}");
        }
    }
    match outcome {
        ResolveOutcome::Found(mac) => Ok(mac),
        ResolveOutcome::Incomplete => Err(NetError::WouldBlock),
        ResolveOutcome::Error => Err(NetError::NoBuffers),
    }
}

fn write_eth_header(buf: &mut PacketBuf, dst: MacAddr, src: MacAddr) -> Result<(), NetError> {
    let hdr = buf.push_header(crate::ETH_HEADER_LEN)?;
    hdr[0..6].copy_from_slice(&dst.0);
    hdr[6..12].copy_from_slice(&src.0);
    hdr[12..14].copy_from_slice(&u16::from(ETHERTYPE_ARP).to_be_bytes());
    Ok(())
}

fn write_arp_body(
    buf: &mut PacketBuf,
    oper: u16,
    sha: MacAddr,
    spa: Ipv4Addr,
    tha: MacAddr,
    tpa: Ipv4Addr,
) -> Result<(), NetError> {
    buf.append(&ARP_HTYPE_ETHERNET.to_be_bytes())?;
    buf.append(&crate::ETHERTYPE_IPV4.to_be_bytes())?;
    buf.append(&[ARP_HLEN_ETHERNET, ARP_PLEN_IPV4])?;
    buf.append(&oper.to_be_bytes())?;
    buf.append(&sha.0)?;
    buf.append(&spa.0)?;
    buf.append(&tha.0)?;
    buf.append(&tpa.0)?;
    Ok(())
}

/// Broadcast an ARP request for `tpa`.
pub fn send_request(iface: &IfaceContext, tpa: Ipv4Addr) -> Result<(), NetError> {
    let mut buf = PacketBuf::alloc().ok_or(NetError::NoBuffers)?;
    write_arp_body(
        &mut buf,
        ARP_OPER_REQUEST,
        iface.dev.mac(),
        iface.ipv4,
        MacAddr::ZERO,
        tpa,
    )?;
    write_eth_header(&mut buf, MacAddr::BROADCAST, iface.dev.mac())?;
    trace!("arp: request for {tpa}");
    iface.dev.tx(buf)
}

/// Reply to a request for our own address.
fn send_reply(iface: &IfaceContext, target_ha: MacAddr, target_pa: Ipv4Addr) -> Result<(), NetError> {
    let mut buf = PacketBuf::alloc().ok_or(NetError::NoBuffers)?;
    write_arp_body(
        &mut buf,
        ARP_OPER_REPLY,
        iface.dev.mac(),
        iface.ipv4,
        target_ha,
        target_pa,
    )?;
    write_eth_header(&mut buf, target_ha, iface.dev.mac())?;
    trace!("arp: reply to {target_pa} at {target_ha}");
    iface.dev.tx(buf)
}

/// The ARP protocol handler, registered under [`crate::ETHERTYPE_ARP`] and
/// invoked on the event thread as frames drain from the ingress queue.
pub fn handle_rx(iface: &IfaceContext, mut buf: PacketBuf, now_ms: u64) {
    if buf.len() < ARP_PACKET_LEN {
        debug!("arp: short packet ({} bytes), dropping", buf.len());
        return;
    }
    let body = match buf.pull_header(ARP_PACKET_LEN) {
        Ok(b) => b,
        Err(_) => return,
    };

    let htype = u16::from_be_bytes([body[0], body[1]]);
    let ptype = u16::from_be_bytes([body[2], body[3]]);
    let hlen = body[4];
    let plen = body[5];
    if htype != ARP_HTYPE_ETHERNET
        || ptype != crate::ETHERTYPE_IPV4
        || hlen != ARP_HLEN_ETHERNET
        || plen != ARP_PLEN_IPV4
    {
        debug!("arp: unsupported hardware/protocol combination, dropping");
        return;
    }

    let oper = u16::from_be_bytes([body[6], body[7]]);
    let sha = MacAddr(body[8..14].try_into().expect("slice is exactly 6 bytes"));
    let spa = Ipv4Addr(body[14..18].try_into().expect("slice is exactly 4 bytes"));
    let tpa = Ipv4Addr(body[24..28].try_into().expect("slice is exactly 4 bytes"));

    let merged = iface.neighbors.update(spa, sha, now_ms);

    if tpa != iface.ipv4 {
        return;
    }

    if !merged {
        iface.neighbors.insert_resolved(spa, sha, now_ms);
    }

    if oper == ARP_OPER_REQUEST
        && let Err(e) = send_reply(iface, sha, spa)
    {
        warn!("arp: failed to send reply to {spa}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::NeighborCache;
    use crate::netdev::{DeviceHandle, NetDevice, NetDeviceFeatures, NetDeviceStats};
    use std::sync::{Arc, Mutex};

    struct MockDevice {
        mac: MacAddr,
        up: std::sync::atomic::AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl NetDevice for MockDevice {
        fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
            self.sent.lock().unwrap().push(pkt.payload().to_vec());
            Ok(())
        }
        fn set_up(&self) {
            self.up.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        fn set_down(&self) {
            self.up.store(false, std::sync::atomic::Ordering::SeqCst);
        }
        fn is_up(&self) -> bool {
            self.up.load(std::sync::atomic::Ordering::SeqCst)
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
            up: std::sync::atomic::AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });
        let registry = crate::netdev::NetDeviceRegistry::new();
        let handle = registry.register(dev);
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
    fn request_to_us_is_answered_and_cached() {
        let iface = mock_iface();
        let mut buf = PacketBuf::alloc().unwrap();
        write_arp_body(
            &mut buf,
            ARP_OPER_REQUEST,
            MacAddr([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            Ipv4Addr::new(10, 0, 0, 5),
            MacAddr::ZERO,
            Ipv4Addr::new(10, 0, 0, 1),
        )
        .unwrap();
        handle_rx(&iface, buf, 0);

        let snap = iface.neighbors.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].0, Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn unsolicited_reply_for_foreign_target_does_not_insert() {
        let iface = mock_iface();
        let mut buf = PacketBuf::alloc().unwrap();
        write_arp_body(
            &mut buf,
            ARP_OPER_REPLY,
            MacAddr([9, 9, 9, 9, 9, 9]),
            Ipv4Addr::new(10, 0, 0, 77),
            iface.dev.mac(),
            Ipv4Addr::new(10, 0, 0, 254),
        )
        .unwrap();
        handle_rx(&iface, buf, 0);
        assert!(iface.neighbors.snapshot().is_empty());
    }
}
