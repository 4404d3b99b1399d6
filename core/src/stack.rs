//! Stack configuration and lifecycle: `StackContext::new` / `init` / `run`
//! / `shutdown`.
//!
//! Grounded on the boot sequence in `kernel/src/main.rs` (bring up
//! subsystems, then hand control to the scheduler) translated to userspace:
//! `init()` wires the built-in protocol handlers, `run()` spawns the sole
//! event thread and blocks until it has reached its loop, `shutdown()` posts
//! a `Notification::Shutdown` and joins it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use log::{debug, info};

use ustack_net::ingress::IfaceContext;
use ustack_net::netdev::{DeviceHandle, NetDevice, NetDeviceRegistry};
use ustack_net::types::{EtherType, Ipv4Addr};

use crate::error::CoreError;
use crate::event::{EventSubscriptions, Notification, NotificationSink};
use crate::irq::{IrqHandler, IrqTable};
use crate::protocol::{ProtocolHandler, ProtocolRegistry};
use crate::timer::TimerList;

/// Depth of the event thread's notification channel. A sender blocks once
/// this many notifications are outstanding, rather than dropping one.
const NOTIFICATION_CHANNEL_DEPTH: usize = 256;

/// How often the built-in housekeeping timer drives ARP cache expiry and TCP
/// retransmission/TIME_WAIT expiry. Independent of how often the ticker
/// thread posts `Notification::Timer`; a tick that arrives sooner than this
/// is a no-op.
const HOUSEKEEPING_INTERVAL_MS: u64 = 200;

/// Everything needed to bring up the one interface this stack manages.
#[derive(Clone, Debug)]
pub struct StackConfig {
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub arp_cache_capacity: usize,
    pub arp_incomplete_ttl_ms: u64,
    pub arp_max_retransmits: u8,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            ipv4: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            broadcast: Ipv4Addr::new(10, 0, 0, 255),
            arp_cache_capacity: 64,
            arp_incomplete_ttl_ms: 1_000,
            arp_max_retransmits: 3,
        }
    }
}

/// Owns the one interface, protocol/timer/irq/event registries, and the
/// sole event thread. Registration methods (`register_protocol`,
/// `register_timer`, `subscribe_event`, `request_irq`) are legal only
/// before [`run`](Self::run).
pub struct StackContext {
    config: StackConfig,
    devices: NetDeviceRegistry,
    iface: OnceLock<Arc<IfaceContext>>,
    protocols: ProtocolRegistry,
    irqs: IrqTable,
    timers: TimerList,
    events: EventSubscriptions,
    running: AtomicBool,
    sender: Mutex<Option<std::sync::mpsc::SyncSender<Notification>>>,
    receiver: Mutex<Option<Receiver<Notification>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl StackContext {
    pub fn new(config: StackConfig) -> Self {
        let (tx, rx) = sync_channel(NOTIFICATION_CHANNEL_DEPTH);
        StackContext {
            config,
            devices: NetDeviceRegistry::new(),
            iface: OnceLock::new(),
            protocols: ProtocolRegistry::new(),
            irqs: IrqTable::new(),
            timers: TimerList::new(),
            events: EventSubscriptions::new(),
            running: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            thread: Mutex::new(None),
        }
    }

    /// Register the (single) network device and build its `IfaceContext`.
    /// Legal only once; a second call is a configuration error.
    pub fn register_device(&self, dev: Arc<dyn NetDevice>) -> Result<DeviceHandle, CoreError> {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyRunning);
        }
        let handle = self.devices.register(dev);
        let iface = IfaceContext::with_arp_timing(
            handle.clone(),
            self.config.ipv4,
            self.config.netmask,
            self.config.broadcast,
            self.config.arp_cache_capacity,
            self.config.arp_incomplete_ttl_ms,
            self.config.arp_max_retransmits,
        );
        self.iface.set(Arc::new(iface)).map_err(|_| CoreError::AlreadyRunning)?;
        Ok(handle)
    }

    /// The registered interface, once [`register_device`](Self::register_device) has run.
    pub fn iface(&self) -> Option<Arc<IfaceContext>> {
        self.iface.get().cloned()
    }

    /// Wire the built-in ARP and IPv4 handlers into the protocol registry,
    /// and the housekeeping timer that drives ARP cache expiry and TCP
    /// retransmission/TIME_WAIT expiry. ICMP, UDP, and TCP are dispatched by
    /// IP protocol number from inside the IPv4 handler rather than at the
    /// Ethernet-framing layer, so they have no separate EtherType
    /// registration here.
    pub fn init(self: &Arc<Self>) -> Result<(), CoreError> {
        self.register_protocol(EtherType::Arp, Box::new(ustack_net::arp::handle_rx))?;
        self.register_protocol(EtherType::Ipv4, Box::new(ustack_net::ipv4::handle_rx))?;

        let weak = Arc::downgrade(self);
        self.register_timer(HOUSEKEEPING_INTERVAL_MS, move |now_ms| {
            let Some(this) = weak.upgrade() else { return };
            let Some(iface) = this.iface() else { return };
            iface.neighbors.expire_incomplete(now_ms);
            iface.tcp.timer_tick(&iface, now_ms);
        })?;
        Ok(())
    }

    pub fn register_protocol(&self, ethertype: EtherType, handler: ProtocolHandler) -> Result<(), CoreError> {
        self.protocols.register(ethertype, handler)
    }

    pub fn register_timer(&self, interval_ms: u64, callback: impl FnMut(u64) + Send + 'static) -> Result<(), CoreError> {
        self.timers.register(interval_ms, callback)
    }

    pub fn subscribe_event(&self, callback: Box<dyn Fn() + Send + Sync>) -> Result<(), CoreError> {
        self.events.subscribe(callback)
    }

    pub fn request_irq(&self, irq: u32, shared: bool, handler: IrqHandler) -> Result<(), CoreError> {
        self.irqs.request_irq(irq, shared, handler)
    }

    /// A cheaply-clonable handle external threads use to post notifications.
    pub fn notifier(&self) -> NotificationSink {
        let guard = self.sender.lock().expect("stack context poisoned");
        NotificationSink::new(guard.as_ref().expect("notifier requested after shutdown").clone())
    }

    /// Access to the protocol registry's ingress entry point, for a device
    /// driver's reader thread to call once it has demultiplexed a frame.
    pub fn protocols(&self) -> &ProtocolRegistry {
        &self.protocols
    }

    /// Spawn the sole event thread and block until it has reached its main
    /// loop. Returns `Err(CoreError::AlreadyStarted)` if already running.
    pub fn run(self: &Arc<Self>) -> Result<(), CoreError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(CoreError::AlreadyStarted);
        }
        self.protocols.start();
        self.irqs.start();
        self.timers.start();
        self.events.start();
        self.devices.open_all();

        let rx = self
            .receiver
            .lock()
            .expect("stack context poisoned")
            .take()
            .expect("run() called more than once");

        let (ready_tx, ready_rx) = sync_channel::<()>(0);
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("ustack-event".into())
            .spawn(move || this.event_loop(rx, ready_tx))
            .expect("failed to spawn event thread");
        *self.thread.lock().expect("stack context poisoned") = Some(handle);

        ready_rx.recv().expect("event thread died before signaling readiness");
        info!("stack: event thread running");
        Ok(())
    }

    fn event_loop(self: Arc<Self>, rx: Receiver<Notification>, ready: std::sync::mpsc::SyncSender<()>) {
        let _ = ready.send(());
        while let Ok(tag) = rx.recv() {
            match tag {
                Notification::Shutdown => break,
                Notification::Softirq => {
                    if let Some(iface) = self.iface() {
                        self.protocols.drain(&iface, ustack_sync::clock::uptime_ms());
                    }
                }
                Notification::Event => self.events.dispatch(),
                Notification::Timer => self.timers.tick(ustack_sync::clock::uptime_ms()),
                Notification::Irq(n) => self.irqs.dispatch(n),
            }
        }
        debug!("stack: event thread exiting");
    }

    /// Post `Notification::Shutdown` and join the event thread. Idempotent:
    /// calling twice is a no-op after the first call has taken the thread
    /// handle.
    pub fn shutdown(&self) {
        if let Some(sender) = self.sender.lock().expect("stack context poisoned").as_ref() {
            let _ = sender.send(Notification::Shutdown);
        }
        if let Some(handle) = self.thread.lock().expect("stack context poisoned").take() {
            let _ = handle.join();
        }
        self.devices.close_all();
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use ustack_net::netdev::{NetDeviceFeatures, NetDeviceStats};
    use ustack_net::packetbuf::PacketBuf;
    use ustack_net::types::{MacAddr, NetError};

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

    #[test]
    fn run_then_shutdown_is_clean() {
        let stack = Arc::new(StackContext::new(StackConfig::default()));
        stack.register_device(Arc::new(StubDevice)).unwrap();
        stack.init().unwrap();
        stack.run().unwrap();
        stack.shutdown();
    }

    #[test]
    fn double_run_is_rejected() {
        let stack = Arc::new(StackContext::new(StackConfig::default()));
        stack.register_device(Arc::new(StubDevice)).unwrap();
        stack.init().unwrap();
        stack.run().unwrap();
        let err = stack.run().unwrap_err();
        assert_eq!(err, CoreError::AlreadyStarted);
        stack.shutdown();
    }

    #[test]
    fn event_notification_dispatches_subscriber() {
        let stack = Arc::new(StackContext::new(StackConfig::default()));
        stack.register_device(Arc::new(StubDevice)).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        stack
            .subscribe_event(Box::new(move || {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        stack.run().unwrap();
        stack.notifier().send(Notification::Event);
        // give the event thread a moment to process before shutdown drains it
        std::thread::sleep(std::time::Duration::from_millis(20));
        stack.shutdown();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn housekeeping_timer_expires_stale_incomplete_neighbor() {
        let config = StackConfig {
            arp_incomplete_ttl_ms: 1,
            arp_max_retransmits: 255,
            ..StackConfig::default()
        };
        let stack = Arc::new(StackContext::new(config));
        stack.register_device(Arc::new(StubDevice)).unwrap();
        stack.init().unwrap();
        let iface = stack.iface().unwrap();
        iface.neighbors.resolve(Ipv4Addr::new(10, 0, 0, 2), 0);
        assert_eq!(iface.neighbors.snapshot().len(), 1);

        stack.run().unwrap();
        // HOUSEKEEPING_INTERVAL_MS has to actually elapse before the first
        // tick is anything but a no-op.
        std::thread::sleep(std::time::Duration::from_millis(250));
        stack.notifier().send(Notification::Timer);
        std::thread::sleep(std::time::Duration::from_millis(50));
        stack.shutdown();

        assert_eq!(iface.neighbors.snapshot().len(), 0);
    }

    #[test]
    fn registering_device_twice_fails() {
        let stack = StackContext::new(StackConfig::default());
        stack.register_device(Arc::new(StubDevice)).unwrap();
        let err = stack.register_device(Arc::new(StubDevice)).unwrap_err();
        assert_eq!(err, CoreError::AlreadyRunning);
    }
}
