//! UDP engine: demultiplexing table plus datagram send/receive framing.
//!
//! Grounded on `drivers/src/net/udp.rs`: a flat table of
//! `(local addr-or-wildcard, local port) -> socket` entries, wildcard
//! addresses matched only after an exact match misses, and the same
//! push-header-three-times egress shape. A fixed-size
//! `[Option<_>; MAX_SOCKETS]` array becomes a `Vec` guarded by a plain
//! `Mutex` — this crate has no interrupt context to keep a lock-free array
//! safe from, so a growable table is simpler and just as correct.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::ingress::IfaceContext;
use crate::packetbuf::PacketBuf;
use crate::types::{Ipv4Addr, NetError, Port, SockAddr};
use crate::UDP_HEADER_LEN;

/// Per-socket receive queue and synchronization, shared between the
/// registry (written from the event thread) and the owning `UdpSocket`
/// handle (read from a user thread).
pub struct UdpEndpoint {
    local: Mutex<SockAddr>,
    rx_queue: Mutex<VecDeque<(SockAddr, Vec<u8>)>>,
    sched: ustack_sync::SchedulerContext,
}

/// Bound datagrams queued per socket before the application drains them.
const RX_QUEUE_CAPACITY: usize = 64;

impl UdpEndpoint {
    fn new(local: SockAddr) -> Arc<Self> {
        Arc::new(UdpEndpoint {
            local: Mutex::new(local),
            rx_queue: Mutex::new(VecDeque::new()),
            sched: ustack_sync::SchedulerContext::new(),
        })
    }

    pub fn local(&self) -> SockAddr {
        *self.local.lock().expect("udp endpoint poisoned")
    }

    fn deliver(&self, from: SockAddr, payload: &[u8]) {
        let mut q = self.rx_queue.lock().expect("udp endpoint poisoned");
        if q.len() >= RX_QUEUE_CAPACITY {
            debug!("udp: rx queue full for {}, dropping datagram", self.local());
            return;
        }
        q.push_back((from, payload.to_vec()));
        drop(q);
        self.sched.wakeup();
    }

    /// Block until a datagram arrives, or `deadline` passes.
    pub fn recv_from(&self, deadline: Option<std::time::Instant>) -> Result<(SockAddr, Vec<u8>), NetError> {
        loop {
            if let Some(item) = self.rx_queue.lock().expect("udp endpoint poisoned").pop_front() {
                return Ok(item);
            }
            match self.sched.sleep(deadline) {
                ustack_sync::WaitOutcome::Woken => continue,
                ustack_sync::WaitOutcome::TimedOut => return Err(NetError::TimedOut),
                ustack_sync::WaitOutcome::Interrupted => return Err(NetError::Interrupted),
            }
        }
    }

    pub fn interrupt(&self) {
        self.sched.interrupt();
    }
}

struct TableEntry {
    local: SockAddr,
    endpoint: Arc<UdpEndpoint>,
}

/// The UDP demultiplexing table: one per stack.
#[derive(Default)]
pub struct UdpTable {
    entries: Mutex<Vec<TableEntry>>,
}

impl UdpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new endpoint to `local`. Fails with [`NetError::AddrInUse`] if
    /// another socket already owns the exact `(addr, port)` pair.
    pub fn bind(&self, local: SockAddr) -> Result<Arc<UdpEndpoint>, NetError> {
        let mut entries = self.entries.lock().expect("udp table poisoned");
        if entries.iter().any(|e| e.local == local) {
            return Err(NetError::AddrInUse);
        }
        let endpoint = UdpEndpoint::new(local);
        entries.push(TableEntry {
            local,
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    pub fn unbind(&self, local: SockAddr) {
        let mut entries = self.entries.lock().expect("udp table poisoned");
        entries.retain(|e| e.local != local);
    }

    /// Exact match first, then wildcard-address match on port alone — a
    /// two-pass lookup.
    fn lookup(&self, dst: SockAddr) -> Option<Arc<UdpEndpoint>> {
        let entries = self.entries.lock().expect("udp table poisoned");
        if let Some(e) = entries.iter().find(|e| e.local == dst) {
            return Some(e.endpoint.clone());
        }
        entries
            .iter()
            .find(|e| e.local.addr == Ipv4Addr::UNSPECIFIED && e.local.port == dst.port)
            .map(|e| e.endpoint.clone())
    }
}

/// Parse a UDP header, returning `(src_port, dst_port, payload)`.
fn parse_header(data: &[u8]) -> Option<(Port, Port, &[u8])> {
    if data.len() < UDP_HEADER_LEN {
        return None;
    }
    let src_port = Port(u16::from_be_bytes([data[0], data[1]]));
    let dst_port = Port(u16::from_be_bytes([data[2], data[3]]));
    let len = u16::from_be_bytes([data[4], data[5]]) as usize;
    if len < UDP_HEADER_LEN || len > data.len() {
        return None;
    }
    Some((src_port, dst_port, &data[UDP_HEADER_LEN..len]))
}

/// Handle an incoming UDP datagram, already stripped of IPv4 framing.
/// Registered as the `IPPROTO_UDP` handler for [`super::ipv4::handle_rx`].
pub fn handle_rx(table: &UdpTable, src_ip: Ipv4Addr, dst_ip: Ipv4Addr, pkt: &PacketBuf) {
    let Some((src_port, dst_port, payload)) = parse_header(pkt.payload()) else {
        debug!("udp: malformed datagram, dropping");
        return;
    };

    let dst = SockAddr { addr: dst_ip, port: dst_port };
    match table.lookup(dst) {
        Some(endpoint) => endpoint.deliver(SockAddr { addr: src_ip, port: src_port }, payload),
        None => debug!("udp: no bound socket for {dst}, dropping"),
    }
}

/// Maximum UDP payload this engine will send in one datagram (MTU 1500 minus
/// Ethernet/IPv4/UDP headers).
pub const MAX_PAYLOAD: usize = 1472;

/// Build and frame a UDP datagram and hand it to the IPv4 engine for egress.
pub fn send_to(iface: &IfaceContext, local_port: Port, dst: SockAddr, payload: &[u8], now_ms: u64) -> Result<usize, NetError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(NetError::Oversize);
    }
    let mut pkt = PacketBuf::alloc().ok_or(NetError::NoBuffers)?;
    pkt.append(payload)?;

    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    let hdr = pkt.push_header(UDP_HEADER_LEN)?;
    hdr[0..2].copy_from_slice(&local_port.0.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst.port.0.to_be_bytes());
    hdr[4..6].copy_from_slice(&udp_len.to_be_bytes());
    hdr[6..8].copy_from_slice(&0u16.to_be_bytes());

    let l4_offset = pkt.head();
    pkt.set_l4(l4_offset);
    let checksum = pkt.compute_udp_checksum(iface.ipv4, dst.addr);
    pkt.payload_mut()[6..8].copy_from_slice(&checksum.to_be_bytes());

    crate::ipv4::send(iface, dst.addr, crate::IPPROTO_UDP, pkt, now_ms)?;
    Ok(payload.len())
}
