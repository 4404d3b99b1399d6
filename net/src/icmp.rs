//! ICMPv4 engine: Echo Request/Reply only.
//!
//! Grounded on `drivers/src/net/ipv4.rs`'s ICMP stub (which only
//! logged and dropped); this stack actually answers Echo Requests, but
//! stays just as thin a consumer of the IPv4 interface — no Destination
//! Unreachable, no Time Exceeded, no other ICMP type originated.

use log::debug;

use crate::ingress::IfaceContext;
use crate::packetbuf::PacketBuf;
use crate::types::{Ipv4Addr, NetError};

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_ECHO_REQUEST: u8 = 8;
const ICMP_HEADER_LEN: usize = 8;

/// Handle an incoming ICMPv4 message, already stripped of IPv4 framing.
/// Registered as the `IPPROTO_ICMP` handler for [`super::ipv4::handle_rx`].
pub fn handle_rx(iface: &IfaceContext, src: Ipv4Addr, dst: Ipv4Addr, pkt: PacketBuf, now_ms: u64) {
    let data = pkt.payload();
    if data.len() < ICMP_HEADER_LEN {
        debug!("icmp: short message ({} bytes), dropping", data.len());
        return;
    }
    let icmp_type = data[0];
    if icmp_type != TYPE_ECHO_REQUEST {
        debug!("icmp: type {icmp_type} unsupported, dropping");
        return;
    }
    if dst != iface.ipv4 && !iface.is_local_broadcast(dst) {
        return;
    }

    let identifier = u16::from_be_bytes([data[4], data[5]]);
    let sequence = u16::from_be_bytes([data[6], data[7]]);
    let echo_payload = data[ICMP_HEADER_LEN..].to_vec();

    if let Err(e) = send_echo_reply(iface, src, identifier, sequence, &echo_payload, now_ms) {
        debug!("icmp: failed to send echo reply to {src}: {e}");
    }
}

fn send_echo_reply(
    iface: &IfaceContext,
    dst: Ipv4Addr,
    identifier: u16,
    sequence: u16,
    payload: &[u8],
    now_ms: u64,
) -> Result<(), NetError> {
    let mut buf = PacketBuf::alloc().ok_or(NetError::NoBuffers)?;
    buf.append(payload)?;
    let hdr = buf.push_header(ICMP_HEADER_LEN)?;
    hdr[0] = TYPE_ECHO_REPLY;
    hdr[1] = 0; // code
    hdr[2..4].copy_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    hdr[4..6].copy_from_slice(&identifier.to_be_bytes());
    hdr[6..8].copy_from_slice(&sequence.to_be_bytes());

    let checksum = crate::fold_checksum(crate::ones_complement_sum(buf.payload()));
    buf.payload_mut()[2..4].copy_from_slice(&checksum.to_be_bytes());

    crate::ipv4::send(iface, dst, crate::IPPROTO_ICMP, buf, now_ms)
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
    fn echo_request_to_us_is_answered() {
        let iface = mock_iface();
        // Pre-seed a static neighbor so the reply's ARP resolution succeeds
        // without needing to drain a request/reply round trip.
        iface
            .neighbors
            .insert_static(Ipv4Addr::new(10, 0, 0, 50), MacAddr([1, 1, 1, 1, 1, 1]), 0);

        let mut pkt = PacketBuf::alloc().unwrap();
        let mut msg = vec![TYPE_ECHO_REQUEST, 0, 0, 0, 0, 1, 0, 7];
        msg.extend_from_slice(b"ping");
        let checksum = crate::fold_checksum(crate::ones_complement_sum(&msg));
        msg[2..4].copy_from_slice(&checksum.to_be_bytes());
        pkt.append(&msg).unwrap();

        handle_rx(&iface, Ipv4Addr::new(10, 0, 0, 50), iface.ipv4, pkt, 0);
    }

    #[test]
    fn non_echo_types_are_dropped() {
        let iface = mock_iface();
        let mut pkt = PacketBuf::alloc().unwrap();
        pkt.append(&[3, 0, 0, 0, 0, 0, 0, 0]).unwrap(); // Destination Unreachable
        handle_rx(&iface, Ipv4Addr::new(10, 0, 0, 50), iface.ipv4, pkt, 0);
    }
}
