//! TAP device driver: the one "thin wrapper around host APIs" this stack
//! needs to actually run.
//!
//! Grounded on the VirtIO network driver
//! (`drivers/src/net/virtio_net.rs`) insofar as the shape is the same — a
//! device struct implementing `NetDevice`, plus a reader loop that feeds
//! frames into the core's ingress path — but the transport is a host
//! `/dev/net/tun` character device opened with `IFF_TAP | IFF_NO_PI` via
//! raw `ioctl`, not a virtqueue.

use std::ffi::CString;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, warn};

use ustack_core::event::Notification;
use ustack_core::stack::StackContext;
use ustack_net::ingress::{demux, IfaceContext};
use ustack_net::netdev::{NetDevice, NetDeviceFeatures, NetDeviceStats};
use ustack_net::packetbuf::PacketBuf;
use ustack_net::types::{MacAddr, NetError};

const IFNAMSIZ: usize = 16;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
/// `TUNSETIFF`, as defined by `linux/if_tun.h` for the common Linux ABIs
/// this crate targets. Not present in the `libc` crate, which only defines
/// the generic BSD/POSIX ioctl surface.
const TUNSETIFF: u64 = 0x4004_54CA;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

fn open_tun_clone() -> Result<RawFd, NetError> {
    let path = CString::new("/dev/net/tun").expect("path has no interior nul");
    // SAFETY: `path` is a valid, nul-terminated C string; `open` is called
    // with a well-formed flags argument per its documented contract.
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(NetError::DeviceIo);
    }
    Ok(fd)
}

fn configure_tap(fd: RawFd, name: &str) -> Result<String, NetError> {
    let mut req = IfReq {
        name: [0u8; IFNAMSIZ],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0u8; 22],
    };
    let bytes = name.as_bytes();
    if bytes.len() >= IFNAMSIZ {
        return Err(NetError::UnsupportedFamily);
    }
    req.name[..bytes.len()].copy_from_slice(bytes);
    // SAFETY: `fd` is a freshly opened `/dev/net/tun` descriptor and `req`
    // is a valid, correctly sized `ifreq` for `TUNSETIFF`.
    let rc = unsafe { libc::ioctl(fd, TUNSETIFF, &req as *const IfReq) };
    if rc < 0 {
        return Err(NetError::DeviceIo);
    }
    let end = req.name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
    Ok(String::from_utf8_lossy(&req.name[..end]).into_owned())
}

/// A host TAP interface, opened and configured via `ioctl(TUNSETIFF)`.
pub struct TapDevice {
    fd: RawFd,
    name: String,
    mac: MacAddr,
    mtu: u16,
    up: AtomicBool,
    stats: Mutex<NetDeviceStats>,
}

impl TapDevice {
    /// Open and configure `/dev/net/tun` as a TAP interface named
    /// `requested_name` (the kernel may append a numeric suffix if the
    /// exact name is unavailable; the resolved name is recorded).
    pub fn open(requested_name: &str, mac: MacAddr, mtu: u16) -> Result<Self, NetError> {
        let fd = open_tun_clone()?;
        let name = configure_tap(fd, requested_name).inspect_err(|_| {
            // SAFETY: `fd` was opened above and configuration failed before
            // any ownership was handed elsewhere.
            unsafe {
                libc::close(fd);
            }
        })?;
        debug!("tap: opened {name} (requested {requested_name})");
        Ok(TapDevice {
            fd,
            name,
            mac,
            mtu,
            up: AtomicBool::new(false),
            stats: Mutex::new(NetDeviceStats::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocking read of one frame into a fresh [`PacketBuf`]. Returns `Ok(None)`
    /// on a short read that does not otherwise indicate an error (should not
    /// occur for a TAP fd in practice, but is not treated as fatal).
    fn read_frame(&self) -> Result<Option<PacketBuf>, NetError> {
        let mut raw = vec![0u8; self.mtu as usize + ustack_net::ETH_HEADER_LEN + 64];
        // SAFETY: `raw` is a valid, writable buffer of the given length and
        // `self.fd` is a valid, open file descriptor for the lifetime of
        // this call.
        let n = unsafe { libc::read(self.fd, raw.as_mut_ptr() as *mut libc::c_void, raw.len()) };
        if n < 0 {
            return Err(NetError::DeviceIo);
        }
        if n == 0 {
            return Ok(None);
        }
        raw.truncate(n as usize);
        Ok(PacketBuf::from_raw_copy(&raw))
    }
}

impl NetDevice for TapDevice {
    fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
        let bytes = pkt.payload();
        // SAFETY: `bytes` is a valid, readable slice for its stated length
        // and `self.fd` is a valid, open file descriptor.
        let n = unsafe { libc::write(self.fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 || n as usize != bytes.len() {
            let mut stats = self.stats.lock().expect("tap stats poisoned");
            stats.tx_errors += 1;
            return Err(NetError::DeviceIo);
        }
        let mut stats = self.stats.lock().expect("tap stats poisoned");
        stats.tx_packets += 1;
        stats.tx_bytes += bytes.len() as u64;
        Ok(())
    }

    fn set_up(&self) {
        self.up.store(true, Ordering::Release);
    }

    fn set_down(&self) {
        self.up.store(false, Ordering::Release);
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn stats(&self) -> NetDeviceStats {
        *self.stats.lock().expect("tap stats poisoned")
    }

    fn features(&self) -> NetDeviceFeatures {
        NetDeviceFeatures::empty()
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        // SAFETY: `self.fd` was opened by this struct and is not shared
        // past this point.
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl AsRawFd for TapDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// Spawn the blocking-read driver thread: reads frames off `dev`,
/// demultiplexes them against `iface`, queues them on the matching
/// protocol's ingress FIFO, and raises a softirq notification for the
/// event thread to drain. Runs until a read error terminates the loop.
pub fn spawn_reader(dev: Arc<TapDevice>, iface: Arc<IfaceContext>, stack: Arc<StackContext>) -> JoinHandle<()> {
    let notifier = stack.notifier();
    std::thread::Builder::new()
        .name("ustack-tap-rx".into())
        .spawn(move || loop {
            let pkt = match dev.read_frame() {
                Ok(Some(pkt)) => pkt,
                Ok(None) => continue,
                Err(err) => {
                    error!("tap: read failed on {}: {err}", dev.name());
                    break;
                }
            };
            let raw = pkt.payload().to_vec();
            match demux(&iface, &raw) {
                Some((ethertype, frame)) => {
                    stack.protocols().input(ethertype, frame);
                    notifier.send(Notification::Softirq);
                }
                None => warn!("tap: dropped undeliverable frame on {}", dev.name()),
            }
        })
        .expect("failed to spawn tap reader thread")
}
