//! Network device abstraction: the `NetDevice` trait, device registry, and
//! stable device handles.
//!
//! Grounded on `drivers/src/net/netdev.rs`, with the
//! registry's raw-pointer-into-a-fixed-array discipline (needed there to
//! avoid allocation on a data path that may run from interrupt context)
//! replaced by `Arc<dyn NetDevice>` — this crate's data path runs on the
//! event thread, an ordinary OS thread, so reference counting is the
//! idiomatic choice and removes the `unsafe` entirely.

use std::fmt;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::packetbuf::PacketBuf;
use crate::types::{DevIndex, MacAddr, NetError};

/// Abstraction for a network device (TAP interface, loopback, …).
///
/// Implementations use interior mutability for their internal state; every
/// method takes `&self` so a device can be shared behind an `Arc` and
/// driven from both the event thread (`tx`) and its own reader thread
/// (`poll_rx`, if the driver chooses to poll rather than push).
pub trait NetDevice: Send + Sync {
    /// Transmit one packet. The packet is consumed.
    fn tx(&self, pkt: PacketBuf) -> Result<(), NetError>;

    /// Bring the link up.
    fn set_up(&self);

    /// Bring the link down. Must be called before the device is dropped.
    fn set_down(&self);

    /// Whether the device is currently up.
    fn is_up(&self) -> bool;

    /// Maximum transmission unit (payload bytes, excluding the Ethernet
    /// header).
    fn mtu(&self) -> u16;

    /// Hardware MAC address.
    fn mac(&self) -> MacAddr;

    /// Read-only snapshot of device statistics.
    fn stats(&self) -> NetDeviceStats;

    /// Capability/feature flags advertised by the driver.
    fn features(&self) -> NetDeviceFeatures;
}

/// Read-only snapshot of network device statistics. Counters are
/// monotonically increasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, err: {}/{}, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_errors,
            self.tx_errors,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

bitflags! {
    /// Capability flags advertised by a network device.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NetDeviceFeatures: u32 {
        /// Driver computes TX checksums itself; the stack may skip software checksumming.
        const CHECKSUM_TX = 1 << 0;
        /// Driver has verified RX checksums; the stack can skip verification.
        const CHECKSUM_RX = 1 << 1;
    }
}

/// Stable, cheaply-cloneable reference to a registered device, scoped to
/// one `(device, IPv4)` interface.
#[derive(Clone)]
pub struct DeviceHandle {
    dev: Arc<dyn NetDevice>,
    index: DevIndex,
}

impl DeviceHandle {
    pub fn tx(&self, pkt: PacketBuf) -> Result<(), NetError> {
        if !self.dev.is_up() {
            return Err(NetError::DeviceDown);
        }
        if pkt.len() > self.dev.mtu() as usize + crate::ETH_HEADER_LEN {
            return Err(NetError::Oversize);
        }
        self.dev.tx(pkt)
    }

    #[inline]
    pub fn index(&self) -> DevIndex {
        self.index
    }

    pub fn mac(&self) -> MacAddr {
        self.dev.mac()
    }

    pub fn mtu(&self) -> u16 {
        self.dev.mtu()
    }

    pub fn is_up(&self) -> bool {
        self.dev.is_up()
    }

    pub fn stats(&self) -> NetDeviceStats {
        self.dev.stats()
    }

    pub fn features(&self) -> NetDeviceFeatures {
        self.dev.features()
    }

    pub fn set_up(&self) {
        self.dev.set_up();
    }

    pub fn set_down(&self) {
        self.dev.set_down();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle({})", self.index)
    }
}

/// Control-plane storage for registered network devices. Each `(device,
/// family)` pair admits at most one interface (§6); this stack speaks only
/// IPv4, so one device registration is one interface.
#[derive(Default)]
pub struct NetDeviceRegistry {
    devices: Mutex<Vec<Arc<dyn NetDevice>>>,
}

impl NetDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device and obtain a stable handle. Legal only before
    /// `run()` per the lifecycle API.
    pub fn register(&self, dev: Arc<dyn NetDevice>) -> DeviceHandle {
        let mut devices = self.devices.lock().expect("device registry poisoned");
        let index = DevIndex(devices.len());
        devices.push(dev.clone());
        DeviceHandle { dev, index }
    }

    pub fn get(&self, index: DevIndex) -> Option<DeviceHandle> {
        let devices = self.devices.lock().expect("device registry poisoned");
        devices.get(index.0).cloned().map(|dev| DeviceHandle { dev, index })
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().expect("device registry poisoned").len()
    }

    /// Bring every registered device up, as `run()` does at startup.
    pub fn open_all(&self) {
        for dev in self.devices.lock().expect("device registry poisoned").iter() {
            dev.set_up();
        }
    }

    /// Bring every registered device down, as `shutdown()` does at teardown.
    pub fn close_all(&self) {
        for dev in self.devices.lock().expect("device registry poisoned").iter() {
            dev.set_down();
        }
    }
}
