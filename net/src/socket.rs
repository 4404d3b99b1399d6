//! The blocking socket-like surface applications use to talk to the stack:
//! [`UdpSocket`], [`TcpSocket`], and [`TcpListener`].
//!
//! Grounded on `drivers/src/udp_socket_tests.rs` /
//! `userland/src/apps/nc` call pattern (bind-then-sendto/recvfrom,
//! connect-then-send/recv) but built directly on this crate's
//! [`SchedulerContext`](ustack_sync::SchedulerContext)-backed blocking
//! primitives instead of a syscall boundary — there is no kernel/userland
//! split here, so the socket type *is* the blocking call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::ingress::IfaceContext;
use crate::tcp::{self, TcpShared};
use crate::types::{NetError, Port, SockAddr};
use crate::udp::{self, UdpEndpoint};

/// A bound UDP endpoint.
pub struct UdpSocket {
    iface: Arc<IfaceContext>,
    endpoint: Arc<UdpEndpoint>,
}

impl UdpSocket {
    /// Bind to `local`. `local.port == 0` is not auto-assigned by this
    /// engine — callers pick a concrete port (Non-goals: no ephemeral UDP
    /// port allocator, unlike TCP's active-open path).
    pub fn bind(iface: Arc<IfaceContext>, local: SockAddr) -> Result<Self, NetError> {
        let endpoint = iface.udp.bind(local)?;
        Ok(UdpSocket { iface, endpoint })
    }

    pub fn local_addr(&self) -> SockAddr {
        self.endpoint.local()
    }

    pub fn send_to(&self, payload: &[u8], dst: SockAddr, now_ms: u64) -> Result<usize, NetError> {
        udp::send_to(&self.iface, self.local_addr().port, dst, payload, now_ms)
    }

    /// Block until a datagram arrives, optionally bounded by `timeout`.
    pub fn recv_from(&self, timeout: Option<Duration>) -> Result<(SockAddr, Vec<u8>), NetError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        self.endpoint.recv_from(deadline)
    }

    /// Wake a thread blocked in `recv_from` without data being available.
    pub fn interrupt(&self) {
        self.endpoint.interrupt();
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.iface.udp.unbind(self.endpoint.local());
    }
}

/// An established (or in-progress) TCP connection.
pub struct TcpSocket {
    iface: Arc<IfaceContext>,
    shared: Arc<TcpShared>,
}

impl TcpSocket {
    /// Active open: block until the three-way handshake completes.
    pub fn connect(iface: Arc<IfaceContext>, remote: SockAddr, now_ms: u64) -> Result<Self, NetError> {
        let shared = tcp::connect(&iface.tcp, &iface, remote, now_ms)?;
        Ok(TcpSocket { iface, shared })
    }

    pub fn local_addr(&self) -> SockAddr {
        self.shared.tuple().local
    }

    pub fn peer_addr(&self) -> SockAddr {
        self.shared.tuple().remote
    }

    pub fn state(&self) -> tcp::TcpState {
        self.shared.state()
    }

    /// Send `payload` as a single segment; blocks until acknowledged.
    pub fn send(&self, payload: &[u8], now_ms: u64) -> Result<usize, NetError> {
        tcp::send(&self.iface, &self.shared, payload, now_ms)
    }

    /// Block until data is available, the peer half-closes (`Ok(0)`), or an
    /// error occurs.
    pub fn recv(&self, out: &mut [u8], timeout: Option<Duration>) -> Result<usize, NetError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        tcp::recv(&self.shared, out, deadline)
    }

    /// Initiate an active close (sends FIN). Non-blocking.
    pub fn close(&self, now_ms: u64) -> Result<(), NetError> {
        tcp::close(&self.iface, &self.shared, now_ms)
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

/// A passive-open TCP socket bound to a local address, accepting inbound
/// connections.
pub struct TcpListener {
    iface: Arc<IfaceContext>,
    shared: Arc<TcpShared>,
}

impl TcpListener {
    pub fn bind(iface: Arc<IfaceContext>, local: SockAddr) -> Result<Self, NetError> {
        let shared = tcp::listen(&iface.tcp, local)?;
        Ok(TcpListener { iface, shared })
    }

    pub fn local_addr(&self) -> SockAddr {
        self.shared.tuple().local
    }

    /// Block until an inbound connection completes its handshake.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<TcpSocket, NetError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let shared = tcp::accept(&self.shared, deadline)?;
        Ok(TcpSocket {
            iface: self.iface.clone(),
            shared,
        })
    }

    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

/// Bind to the next free ephemeral port (49152-65535) on `addr`. For UDP
/// callers that don't care which source port they get, unlike TCP's active
/// open this has no internal counter to hand out ports without contention —
/// it just retries `bind` linearly, which is fine at this engine's scale.
pub fn bind_ephemeral(iface: Arc<IfaceContext>, addr: crate::types::Ipv4Addr) -> Result<UdpSocket, NetError> {
    for candidate in 49152..=65535u16 {
        let local = SockAddr {
            addr,
            port: Port(candidate),
        };
        match UdpSocket::bind(iface.clone(), local) {
            Ok(socket) => return Ok(socket),
            Err(NetError::AddrInUse) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(NetError::AddrInUse)
}
