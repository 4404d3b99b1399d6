//! EtherType-keyed protocol registry and ingress FIFOs.
//!
//! Grounded on `drivers/src/net/ingress.rs`'s hand-off into
//! `core`'s dispatch, generalized from a fixed protocol-number switch to an
//! append-only registry so a test harness can register a stub protocol
//! without touching this crate. Mirrors the data flow called out for
//! ingress: the device side (here, [`ustack_net::ingress::demux`]) strips
//! Ethernet framing and determines the EtherType; [`ProtocolRegistry::input`]
//! is the ISR-equivalent call that queues the frame; [`ProtocolRegistry::drain`]
//! is the softirq-equivalent call the event thread makes once per
//! `Notification::Softirq`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ustack_net::ingress::IfaceContext;
use ustack_net::packetbuf::PacketBuf;
use ustack_net::types::EtherType;

use crate::error::CoreError;

/// A protocol handler: invoked on the event thread with no stack locks held.
/// Matches the signature [`ustack_net::arp::handle_rx`] and
/// [`ustack_net::ipv4::handle_rx`] already share.
pub type ProtocolHandler = Box<dyn Fn(&IfaceContext, PacketBuf, u64) + Send + Sync>;

struct ProtocolEntry {
    ethertype: EtherType,
    handler: ProtocolHandler,
    queue: Mutex<VecDeque<PacketBuf>>,
}

/// The per-stack table of registered EtherType handlers and their ingress
/// FIFOs. Registration is append-only and forbidden once the event thread
/// has started (§4.2/§4.3).
#[derive(Default)]
pub struct ProtocolRegistry {
    entries: Mutex<Vec<Arc<ProtocolEntry>>>,
    running: AtomicBool,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `ethertype`. Legal only before the event
    /// thread starts.
    pub fn register(&self, ethertype: EtherType, handler: ProtocolHandler) -> Result<(), CoreError> {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyRunning);
        }
        self.entries.lock().expect("protocol registry poisoned").push(Arc::new(ProtocolEntry {
            ethertype,
            handler,
            queue: Mutex::new(VecDeque::new()),
        }));
        Ok(())
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// The ISR-equivalent entry point: queue an already-demultiplexed frame
    /// for its protocol and return. Unknown EtherTypes are silently dropped:
    /// no protocol handler means the frame is discarded.
    pub fn input(&self, ethertype: EtherType, pkt: PacketBuf) {
        let entries = self.entries.lock().expect("protocol registry poisoned");
        if let Some(entry) = entries.iter().find(|e| e.ethertype == ethertype) {
            entry.queue.lock().expect("protocol queue poisoned").push_back(pkt);
        }
    }

    /// Softirq drain: for each registered protocol, in registration order,
    /// pop and process every queued frame before moving to the next
    /// protocol. Invoked on the event thread in response to
    /// `Notification::Softirq`.
    pub fn drain(&self, iface: &IfaceContext, now_ms: u64) {
        let entries = self.entries.lock().expect("protocol registry poisoned").clone();
        for entry in &entries {
            loop {
                let pkt = entry.queue.lock().expect("protocol queue poisoned").pop_front();
                match pkt {
                    Some(pkt) => (entry.handler)(iface, pkt, now_ms),
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ustack_net::neighbor::NeighborCache;
    use ustack_net::netdev::{DeviceHandle, NetDevice, NetDeviceFeatures, NetDeviceRegistry, NetDeviceStats};
    use ustack_net::tcp::TcpTable;
    use ustack_net::types::{Ipv4Addr, MacAddr, NetError};
    use ustack_net::udp::UdpTable;

    struct StubDevice;
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
            MacAddr([2, 0, 0, 0, 0, 1])
        }
        fn stats(&self) -> NetDeviceStats {
            NetDeviceStats::default()
        }
        fn features(&self) -> NetDeviceFeatures {
            NetDeviceFeatures::empty()
        }
    }

    pub(crate) fn mock_iface() -> IfaceContext {
        let registry = NetDeviceRegistry::new();
        let handle: DeviceHandle = registry.register(Arc::new(StubDevice));
        IfaceContext {
            dev: handle,
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 0, 0, 255),
            neighbors: NeighborCache::new(4),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
        }
    }

    #[test]
    fn unregistered_ethertype_is_dropped_silently() {
        let registry = ProtocolRegistry::new();
        let pkt = PacketBuf::alloc().unwrap();
        registry.input(EtherType::Arp, pkt);
        let iface = mock_iface();
        registry.drain(&iface, 0);
    }

    #[test]
    fn queued_frames_reach_the_handler_in_order() {
        let registry = ProtocolRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .register(
                EtherType::Arp,
                Box::new(move |_iface, pkt, _now| {
                    seen_clone.lock().unwrap().push(pkt.len());
                }),
            )
            .unwrap();
        registry.input(EtherType::Arp, {
            let mut b = PacketBuf::alloc().unwrap();
            b.append(&[1, 2, 3]).unwrap();
            b
        });
        registry.input(EtherType::Arp, {
            let mut b = PacketBuf::alloc().unwrap();
            b.append(&[1, 2, 3, 4]).unwrap();
            b
        });
        let iface = mock_iface();
        registry.drain(&iface, 0);
        assert_eq!(*seen.lock().unwrap(), vec![3, 4]);
    }

    #[test]
    fn register_after_start_is_rejected() {
        let registry = ProtocolRegistry::new();
        registry.start();
        let err = registry
            .register(EtherType::Ipv4, Box::new(|_, _, _| {}))
            .unwrap_err();
        assert_eq!(err, CoreError::AlreadyRunning);
    }

    #[test]
    fn drain_order_is_registration_order() {
        let registry = ProtocolRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        registry
            .register(EtherType::Arp, Box::new(move |_, _, _| o1.lock().unwrap().push("arp")))
            .unwrap();
        let o2 = order.clone();
        registry
            .register(EtherType::Ipv4, Box::new(move |_, _, _| o2.lock().unwrap().push("ipv4")))
            .unwrap();
        registry.input(EtherType::Ipv4, PacketBuf::alloc().unwrap());
        registry.input(EtherType::Arp, PacketBuf::alloc().unwrap());
        let iface = mock_iface();
        registry.drain(&iface, 0);
        assert_eq!(*order.lock().unwrap(), vec!["arp", "ipv4"]);
    }
}

#[cfg(test)]
mod proptests {
    //! P6: for a single protocol, frames queued via `input` are delivered to
    //! its handler in the same order, for any interleaving of queued frame
    //! sizes.

    use super::*;
    use crate::protocol::tests::mock_iface;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn p6_ordering_is_preserved(lens in prop::collection::vec(1usize..64, 1..32)) {
            let registry = ProtocolRegistry::new();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = seen.clone();
            registry
                .register(EtherType::Arp, Box::new(move |_iface, pkt, _now| {
                    seen_clone.lock().unwrap().push(pkt.len());
                }))
                .unwrap();
            for &len in &lens {
                let mut b = PacketBuf::alloc().unwrap();
                b.append(&vec![0u8; len]).unwrap();
                registry.input(EtherType::Arp, b);
            }
            let iface = mock_iface();
            registry.drain(&iface, 0);
            prop_assert_eq!(&*seen.lock().unwrap(), &lens);
        }
    }
}
