//! TCP engine: RFC 793 state machine, 4-tuple connection demultiplexing,
//! retransmission with exponential backoff, and TIME_WAIT expiry.
//!
//! Grounded on `drivers/src/net/tcp.rs`: the same header layout, state
//! names, sequence-number arithmetic, and table-of-connections shape. Two
//! deliberate simplifications for a teaching-grade engine (no congestion
//! control, no sliding-window pipelining per the design notes): each
//! connection keeps at most one unacknowledged segment in flight
//! (`PendingSegment`) rather than a send buffer, so `send` is synchronous —
//! it blocks until its segment is acknowledged or the connection gives up
//! retransmitting. A static `[TcpConnection; MAX_CONNECTIONS]` array and
//! free-standing `static TCP_TABLE` become an instance-owned
//! `Vec<Arc<TcpShared>>` — this crate runs as an ordinary library, not
//! linked singleton kernel code, so the table belongs to the `IfaceContext`
//! that owns it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::debug;

use crate::ingress::IfaceContext;
use crate::packetbuf::PacketBuf;
use crate::types::{Ipv4Addr, NetError, Port, SockAddr};
use ustack_sync::{SchedulerContext, WaitOutcome};

pub const TCP_HEADER_LEN: usize = 20;
const DEFAULT_MSS: u16 = 1460;
const DEFAULT_WINDOW_SIZE: u16 = 16384;
const INITIAL_RTO_MS: u32 = 1000;
const MAX_RTO_MS: u32 = 60_000;
/// 2×MSL (MSL = 30s), per RFC 793 §3.5.
pub const TIME_WAIT_MS: u64 = 60_000;
const MAX_RETRANSMITS: u8 = 8;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;
const FLAG_PSH: u8 = 0x08;
const FLAG_ACK: u8 = 0x10;

#[inline]
fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}
static ISN_COUNTER: AtomicU32 = AtomicU32::new(0x1234_5678);
fn generate_isn() -> u32 {
    ISN_COUNTER.fetch_add(64_000, Ordering::Relaxed)
}

static EPHEMERAL_PORT: AtomicU16 = AtomicU16::new(49152);
fn alloc_ephemeral_port() -> Port {
    loop {
        let port = EPHEMERAL_PORT.fetch_add(1, Ordering::Relaxed);
        if port >= 49152 {
            return Port(port);
        }
        EPHEMERAL_PORT.store(49152, Ordering::Relaxed);
    }
}

/// RFC 793 §3.2 connection states, named exactly as the protocol does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// The four-tuple identifying a connection. `remote` is the all-zero
/// [`SockAddr::UNSPECIFIED`] for a LISTEN socket (wildcard match on
/// incoming SYNs).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local: SockAddr,
    pub remote: SockAddr,
}

struct TcpHeader {
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
}

fn parse_header(data: &[u8]) -> Option<(TcpHeader, usize)> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = (data[12] >> 4) as usize;
    if data_offset < 5 || data_offset > 15 {
        return None;
    }
    let header_len = data_offset * 4;
    if data.len() < header_len {
        return None;
    }
    let hdr = TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13] & 0x3F,
        window: u16::from_be_bytes([data[14], data[15]]),
    };
    Some((hdr, header_len))
}

fn write_header(buf: &mut [u8], src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8, window: u16) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = 5 << 4;
    buf[13] = flags;
    buf[14..16].copy_from_slice(&window.to_be_bytes());
    buf[16..18].copy_from_slice(&0u16.to_be_bytes());
    buf[18..20].copy_from_slice(&0u16.to_be_bytes());
}

/// The single outstanding unacknowledged segment for a connection — covers
/// the initial SYN/SYN-ACK, a FIN, or one data segment. Retransmitted with
/// exponential backoff until acknowledged or `MAX_RETRANSMITS` is reached.
struct PendingSegment {
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
    sent_at_ms: u64,
}

struct TcpConn {
    tuple: TcpTuple,
    state: TcpState,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u16,
    rcv_nxt: u32,
    rcv_wnd: u16,
    peer_mss: u16,
    rto_ms: u32,
    retransmits: u8,
    pending: Option<PendingSegment>,
    time_wait_deadline_ms: Option<u64>,
    rx_buffer: VecDeque<u8>,
    accept_queue: VecDeque<Arc<TcpShared>>,
    /// The listener this connection was spawned from, if any. Set only on
    /// children created by [`handle_listen`], so [`handle_syn_received`] has
    /// somewhere to deliver itself once the handshake completes.
    listener: Option<Arc<TcpShared>>,
    error: Option<NetError>,
}

impl TcpConn {
    fn listen(local: SockAddr) -> Self {
        TcpConn {
            tuple: TcpTuple {
                local,
                remote: SockAddr::UNSPECIFIED,
            },
            state: TcpState::Listen,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW_SIZE,
            peer_mss: DEFAULT_MSS,
            rto_ms: INITIAL_RTO_MS,
            retransmits: 0,
            pending: None,
            time_wait_deadline_ms: None,
            rx_buffer: VecDeque::new(),
            accept_queue: VecDeque::new(),
            listener: None,
            error: None,
        }
    }
}

/// A TCP connection's shared state, reachable from both the event thread
/// (ingress processing, timers) and whichever user thread owns the socket.
pub struct TcpShared {
    inner: Mutex<TcpConn>,
    sched: SchedulerContext,
}

impl TcpShared {
    pub fn state(&self) -> TcpState {
        self.inner.lock().expect("tcp connection poisoned").state
    }

    pub fn tuple(&self) -> TcpTuple {
        self.inner.lock().expect("tcp connection poisoned").tuple
    }

    pub fn interrupt(&self) {
        self.sched.interrupt();
    }
}

/// The per-stack TCP connection table.
#[derive(Default)]
pub struct TcpTable {
    connections: Mutex<Vec<Arc<TcpShared>>>,
}

impl TcpTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, conn: Arc<TcpShared>) {
        self.connections.lock().expect("tcp table poisoned").push(conn);
    }

    /// Exact 4-tuple match first, then a LISTEN socket bound to the same
    /// local address/port (wildcard on the remote half) — a two-pass
    /// lookup.
    fn find(&self, tuple: TcpTuple) -> Option<Arc<TcpShared>> {
        let conns = self.connections.lock().expect("tcp table poisoned");
        if let Some(c) = conns.iter().find(|c| c.tuple() == tuple) {
            return Some(c.clone());
        }
        conns
            .iter()
            .find(|c| c.state() == TcpState::Listen && c.tuple().local == tuple.local)
            .cloned()
    }

    fn port_in_use(&self, local: SockAddr) -> bool {
        self.connections
            .lock()
            .expect("tcp table poisoned")
            .iter()
            .any(|c| c.tuple().local == local)
    }

    /// Drive retransmission and TIME_WAIT expiry for every connection.
    /// Intended to be called periodically by the timer subsystem.
    pub fn timer_tick(&self, iface: &IfaceContext, now_ms: u64) {
        let conns = self.connections.lock().expect("tcp table poisoned").clone();
        for conn in &conns {
            tick_one(conn, iface, now_ms);
        }
        self.connections
            .lock()
            .expect("tcp table poisoned")
            .retain(|c| c.state() != TcpState::Closed);
    }
}

fn tick_one(conn: &Arc<TcpShared>, iface: &IfaceContext, now_ms: u64) {
    let mut inner = conn.inner.lock().expect("tcp connection poisoned");
    if let Some(deadline) = inner.time_wait_deadline_ms
        && now_ms >= deadline
    {
        inner.state = TcpState::Closed;
        return;
    }
    let Some(pending) = &inner.pending else { return };
    if now_ms.saturating_sub(pending.sent_at_ms) < inner.rto_ms as u64 {
        return;
    }
    if inner.retransmits >= MAX_RETRANSMITS {
        debug!("tcp: {:?} giving up after {} retransmits", inner.tuple, inner.retransmits);
        inner.error = Some(NetError::TimedOut);
        inner.state = TcpState::Closed;
        drop(inner);
        conn.sched.wakeup();
        return;
    }
    let seq = pending.seq;
    let flags = pending.flags;
    let payload = pending.payload.clone();
    inner.retransmits += 1;
    inner.rto_ms = (inner.rto_ms * 2).min(MAX_RTO_MS);
    let ack = inner.rcv_nxt;
    let window = inner.rcv_wnd;
    let tuple = inner.tuple;
    inner.pending = Some(PendingSegment {
        seq,
        flags,
        payload: payload.clone(),
        sent_at_ms: now_ms,
    });
    drop(inner);
    let _ = emit(iface, tuple, seq, ack, flags, window, &payload, now_ms);
}

fn emit(
    iface: &IfaceContext,
    tuple: TcpTuple,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
    now_ms: u64,
) -> Result<(), NetError> {
    let mut buf = PacketBuf::alloc().ok_or(NetError::NoBuffers)?;
    buf.append(payload)?;
    let hdr = buf.push_header(TCP_HEADER_LEN)?;
    write_header(hdr, tuple.local.port.0, tuple.remote.port.0, seq, ack, flags, window);
    buf.set_l4(buf.head());
    let checksum = buf.compute_tcp_checksum(tuple.local.addr, tuple.remote.addr);
    buf.payload_mut()[16..18].copy_from_slice(&checksum.to_be_bytes());
    crate::ipv4::send(iface, tuple.remote.addr, crate::IPPROTO_TCP, buf, now_ms)
}

fn send_control(iface: &IfaceContext, conn: &Arc<TcpShared>, seq: u32, flags: u8, now_ms: u64) -> Result<(), NetError> {
    let (tuple, ack, window) = {
        let inner = conn.inner.lock().expect("tcp connection poisoned");
        (inner.tuple, inner.rcv_nxt, inner.rcv_wnd)
    };
    emit(iface, tuple, seq, ack, flags, window, &[], now_ms)
}

/// Register a LISTEN socket bound to `local`.
pub fn listen(table: &TcpTable, local: SockAddr) -> Result<Arc<TcpShared>, NetError> {
    if table.port_in_use(local) {
        return Err(NetError::AddrInUse);
    }
    let shared = Arc::new(TcpShared {
        inner: Mutex::new(TcpConn::listen(local)),
        sched: SchedulerContext::new(),
    });
    table.insert(shared.clone());
    Ok(shared)
}

/// Block until a LISTEN socket's accept queue yields a newly-established
/// connection.
pub fn accept(conn: &Arc<TcpShared>, deadline: Option<Instant>) -> Result<Arc<TcpShared>, NetError> {
    loop {
        {
            let mut inner = conn.inner.lock().expect("tcp connection poisoned");
            if inner.state != TcpState::Listen {
                return Err(NetError::InvalidState);
            }
            if let Some(child) = inner.accept_queue.pop_front() {
                return Ok(child);
            }
        }
        match conn.sched.sleep(deadline) {
            WaitOutcome::Woken => continue,
            WaitOutcome::TimedOut => return Err(NetError::TimedOut),
            WaitOutcome::Interrupted => return Err(NetError::Interrupted),
        }
    }
}

/// Active open: allocate an ephemeral local port, send the initial SYN, and
/// block until the handshake completes or fails.
pub fn connect(table: &TcpTable, iface: &IfaceContext, remote: SockAddr, now_ms: u64) -> Result<Arc<TcpShared>, NetError> {
    let local = SockAddr {
        addr: iface.ipv4,
        port: alloc_ephemeral_port(),
    };
    let iss = generate_isn();
    let tuple = TcpTuple { local, remote };

    let shared = Arc::new(TcpShared {
        inner: Mutex::new(TcpConn {
            tuple,
            state: TcpState::SynSent,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_wnd: 0,
            rcv_nxt: 0,
            rcv_wnd: DEFAULT_WINDOW_SIZE,
            peer_mss: DEFAULT_MSS,
            rto_ms: INITIAL_RTO_MS,
            retransmits: 0,
            pending: Some(PendingSegment {
                seq: iss,
                flags: FLAG_SYN,
                payload: Vec::new(),
                sent_at_ms: now_ms,
            }),
            time_wait_deadline_ms: None,
            rx_buffer: VecDeque::new(),
            accept_queue: VecDeque::new(),
            listener: None,
            error: None,
        }),
        sched: SchedulerContext::new(),
    });
    table.insert(shared.clone());
    emit(iface, tuple, iss, 0, FLAG_SYN, DEFAULT_WINDOW_SIZE, &[], now_ms)?;

    loop {
        {
            let inner = shared.inner.lock().expect("tcp connection poisoned");
            if inner.state == TcpState::Established {
                return Ok(shared.clone());
            }
            if let Some(e) = inner.error {
                return Err(e);
            }
        }
        match shared.sched.sleep(None) {
            WaitOutcome::Woken => continue,
            WaitOutcome::TimedOut => return Err(NetError::TimedOut),
            WaitOutcome::Interrupted => return Err(NetError::Interrupted),
        }
    }
}

/// Send `payload` as one segment (Non-goals: no send-buffer pipelining) and
/// block until it is acknowledged.
pub fn send(iface: &IfaceContext, conn: &Arc<TcpShared>, payload: &[u8], now_ms: u64) -> Result<usize, NetError> {
    let n = payload.len().min(DEFAULT_MSS as usize);
    let (tuple, seq, ack, window) = {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        if !matches!(inner.state, TcpState::Established | TcpState::CloseWait) {
            return Err(NetError::InvalidState);
        }
        if inner.pending.is_some() {
            return Err(NetError::WouldBlock);
        }
        let seq = inner.snd_nxt;
        inner.snd_nxt = inner.snd_nxt.wrapping_add(n as u32);
        inner.pending = Some(PendingSegment {
            seq,
            flags: FLAG_ACK | FLAG_PSH,
            payload: payload[..n].to_vec(),
            sent_at_ms: now_ms,
        });
        (inner.tuple, seq, inner.rcv_nxt, inner.rcv_wnd)
    };
    emit(iface, tuple, seq, ack, FLAG_ACK | FLAG_PSH, window, &payload[..n], now_ms)?;

    loop {
        {
            let inner = conn.inner.lock().expect("tcp connection poisoned");
            if inner.pending.is_none() {
                return Ok(n);
            }
            if let Some(e) = inner.error {
                return Err(e);
            }
        }
        match conn.sched.sleep(None) {
            WaitOutcome::Woken => continue,
            WaitOutcome::TimedOut => return Err(NetError::TimedOut),
            WaitOutcome::Interrupted => return Err(NetError::Interrupted),
        }
    }
}

/// Block until received bytes are available, the peer has sent FIN (`Ok(0)`),
/// or an error occurs.
pub fn recv(conn: &Arc<TcpShared>, out: &mut [u8], deadline: Option<Instant>) -> Result<usize, NetError> {
    loop {
        {
            let mut inner = conn.inner.lock().expect("tcp connection poisoned");
            if !inner.rx_buffer.is_empty() {
                let n = out.len().min(inner.rx_buffer.len());
                for slot in out.iter_mut().take(n) {
                    *slot = inner.rx_buffer.pop_front().expect("checked len above");
                }
                return Ok(n);
            }
            if matches!(inner.state, TcpState::CloseWait | TcpState::Closing | TcpState::TimeWait | TcpState::Closed) {
                return Ok(0);
            }
            if let Some(e) = inner.error {
                return Err(e);
            }
        }
        match conn.sched.sleep(deadline) {
            WaitOutcome::Woken => continue,
            WaitOutcome::TimedOut => return Err(NetError::TimedOut),
            WaitOutcome::Interrupted => return Err(NetError::Interrupted),
        }
    }
}

/// Initiate an active close. Non-blocking: sends the FIN (or schedules it
/// behind a still-pending segment is not supported — Non-goals) and
/// advances local state; the rest of teardown happens via `handle_rx` and
/// `timer_tick`.
pub fn close(iface: &IfaceContext, conn: &Arc<TcpShared>, now_ms: u64) -> Result<(), NetError> {
    let (tuple, seq, ack, window, next_state) = {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        let next_state = match inner.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            TcpState::SynSent | TcpState::Listen => {
                inner.state = TcpState::Closed;
                return Ok(());
            }
            _ => return Err(NetError::InvalidState),
        };
        let seq = inner.snd_nxt;
        inner.snd_nxt = inner.snd_nxt.wrapping_add(1);
        inner.state = next_state;
        inner.pending = Some(PendingSegment {
            seq,
            flags: FLAG_FIN | FLAG_ACK,
            payload: Vec::new(),
            sent_at_ms: now_ms,
        });
        (inner.tuple, seq, inner.rcv_nxt, inner.rcv_wnd, next_state)
    };
    let _ = next_state;
    emit(iface, tuple, seq, ack, FLAG_FIN | FLAG_ACK, window, &[], now_ms)
}

/// Handle an incoming TCP segment, already stripped of IPv4 framing.
/// Registered as the `IPPROTO_TCP` handler for [`super::ipv4::handle_rx`].
pub fn handle_rx(table: &TcpTable, iface: &IfaceContext, src: Ipv4Addr, dst: Ipv4Addr, pkt: &PacketBuf, now_ms: u64) {
    let Some((hdr, header_len)) = parse_header(pkt.payload()) else {
        debug!("tcp: malformed segment, dropping");
        return;
    };
    let remote = SockAddr {
        addr: src,
        port: Port(hdr.src_port),
    };
    let local = SockAddr {
        addr: dst,
        port: Port(hdr.dst_port),
    };
    let payload = &pkt.payload()[header_len..];

    let Some(conn) = table.find(TcpTuple { local, remote }) else {
        debug!("tcp: no connection for {local} <- {remote}, dropping");
        return;
    };

    if conn.tuple().remote == SockAddr::UNSPECIFIED {
        handle_listen(table, iface, &conn, local, remote, &hdr, now_ms);
        return;
    }

    let state = conn.state();
    match state {
        TcpState::SynSent => handle_syn_sent(iface, &conn, &hdr, now_ms),
        TcpState::SynReceived => handle_syn_received(&conn, &hdr),
        TcpState::Established
        | TcpState::FinWait1
        | TcpState::FinWait2
        | TcpState::CloseWait
        | TcpState::Closing
        | TcpState::LastAck => handle_open(iface, &conn, &hdr, payload, now_ms),
        TcpState::TimeWait => {
            if hdr.flags & FLAG_FIN != 0 {
                let seq = conn.inner.lock().expect("tcp connection poisoned").snd_nxt;
                let _ = send_control(iface, &conn, seq, FLAG_ACK, now_ms);
            }
        }
        TcpState::Listen | TcpState::Closed => {}
    }
}

fn handle_listen(
    table: &TcpTable,
    iface: &IfaceContext,
    listener: &Arc<TcpShared>,
    local: SockAddr,
    remote: SockAddr,
    hdr: &TcpHeader,
    now_ms: u64,
) {
    if hdr.flags & FLAG_RST != 0 {
        return;
    }
    if hdr.flags & FLAG_SYN == 0 {
        return;
    }
    let iss = generate_isn();
    let child = Arc::new(TcpShared {
        inner: Mutex::new(TcpConn {
            tuple: TcpTuple { local, remote },
            state: TcpState::SynReceived,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            snd_wnd: hdr.window,
            rcv_nxt: hdr.seq.wrapping_add(1),
            rcv_wnd: DEFAULT_WINDOW_SIZE,
            peer_mss: DEFAULT_MSS,
            rto_ms: INITIAL_RTO_MS,
            retransmits: 0,
            pending: Some(PendingSegment {
                seq: iss,
                flags: FLAG_SYN | FLAG_ACK,
                payload: Vec::new(),
                sent_at_ms: now_ms,
            }),
            time_wait_deadline_ms: None,
            rx_buffer: VecDeque::new(),
            accept_queue: VecDeque::new(),
            listener: Some(listener.clone()),
            error: None,
        }),
        sched: SchedulerContext::new(),
    });
    table.insert(child.clone());
    let _ = emit(
        iface,
        TcpTuple { local, remote },
        iss,
        hdr.seq.wrapping_add(1),
        FLAG_SYN | FLAG_ACK,
        DEFAULT_WINDOW_SIZE,
        &[],
        now_ms,
    );
}

fn handle_syn_sent(iface: &IfaceContext, conn: &Arc<TcpShared>, hdr: &TcpHeader, now_ms: u64) {
    if hdr.flags & FLAG_RST != 0 {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        inner.state = TcpState::Closed;
        inner.error = Some(NetError::ConnectionRefused);
        drop(inner);
        conn.sched.wakeup();
        return;
    }
    if hdr.flags & FLAG_SYN == 0 || hdr.flags & FLAG_ACK == 0 {
        return;
    }
    let (tuple, seq, ack);
    {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        if hdr.ack != inner.snd_nxt {
            return;
        }
        inner.snd_una = hdr.ack;
        inner.rcv_nxt = hdr.seq.wrapping_add(1);
        inner.snd_wnd = hdr.window;
        inner.state = TcpState::Established;
        inner.pending = None;
        inner.retransmits = 0;
        tuple = inner.tuple;
        seq = inner.snd_nxt;
        ack = inner.rcv_nxt;
    }
    let _ = emit(iface, tuple, seq, ack, FLAG_ACK, DEFAULT_WINDOW_SIZE, &[], now_ms);
    conn.sched.wakeup();
}

fn handle_syn_received(conn: &Arc<TcpShared>, hdr: &TcpHeader) {
    if hdr.flags & FLAG_RST != 0 {
        conn.inner.lock().expect("tcp connection poisoned").state = TcpState::Closed;
        return;
    }
    if hdr.flags & FLAG_ACK == 0 {
        return;
    }
    let listener = {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        if hdr.ack != inner.snd_nxt {
            return;
        }
        inner.snd_una = hdr.ack;
        inner.state = TcpState::Established;
        inner.pending = None;
        inner.retransmits = 0;
        inner.listener.take()
    };
    if let Some(listener) = listener {
        listener
            .inner
            .lock()
            .expect("tcp connection poisoned")
            .accept_queue
            .push_back(conn.clone());
        listener.sched.wakeup();
    }
}

fn handle_open(iface: &IfaceContext, conn: &Arc<TcpShared>, hdr: &TcpHeader, payload: &[u8], now_ms: u64) {
    if hdr.flags & FLAG_RST != 0 {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");
        inner.state = TcpState::Closed;
        inner.error = Some(NetError::ConnectionReset);
        drop(inner);
        conn.sched.wakeup();
        return;
    }

    let mut woke = false;
    let (reply_seq, reply_ack, window, tuple);
    {
        let mut inner = conn.inner.lock().expect("tcp connection poisoned");

        // A segment occupies one sequence number per byte of payload, plus
        // one for a bare SYN/FIN control segment.
        let pending_end = inner
            .pending
            .as_ref()
            .map(|p| p.seq.wrapping_add(p.payload.len().max(1) as u32));
        if hdr.flags & FLAG_ACK != 0
            && let Some(end) = pending_end
            && !seq_lt(hdr.ack, end)
        {
            inner.snd_una = hdr.ack;
            inner.pending = None;
            inner.retransmits = 0;
            inner.rto_ms = INITIAL_RTO_MS;
            woke = true;
        }

        if !payload.is_empty() && hdr.seq == inner.rcv_nxt {
            inner.rx_buffer.extend(payload.iter().copied());
            inner.rcv_nxt = inner.rcv_nxt.wrapping_add(payload.len() as u32);
            woke = true;
        }

        if hdr.flags & FLAG_FIN != 0 && hdr.seq.wrapping_add(payload.len() as u32) == inner.rcv_nxt {
            inner.rcv_nxt = inner.rcv_nxt.wrapping_add(1);
            inner.state = match inner.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                TcpState::FinWait2 => {
                    inner.time_wait_deadline_ms = Some(now_ms + TIME_WAIT_MS);
                    TcpState::TimeWait
                }
                other => other,
            };
            woke = true;
        }

        if hdr.flags & FLAG_ACK != 0 && inner.state == TcpState::FinWait1 && inner.pending.is_none() {
            inner.state = TcpState::FinWait2;
        }
        if hdr.flags & FLAG_ACK != 0 && inner.state == TcpState::Closing && inner.pending.is_none() {
            inner.time_wait_deadline_ms = Some(now_ms + TIME_WAIT_MS);
            inner.state = TcpState::TimeWait;
        }
        if hdr.flags & FLAG_ACK != 0 && inner.state == TcpState::LastAck && inner.pending.is_none() {
            inner.state = TcpState::Closed;
        }

        reply_seq = inner.snd_nxt;
        reply_ack = inner.rcv_nxt;
        window = inner.rcv_wnd;
        tuple = inner.tuple;
    }

    if !payload.is_empty() || hdr.flags & FLAG_FIN != 0 {
        let _ = emit(iface, tuple, reply_seq, reply_ack, FLAG_ACK, window, &[], now_ms);
    }
    if woke {
        conn.sched.wakeup();
    }
}
