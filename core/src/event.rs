//! The event thread's notification channel and event-subscriber list.
//!
//! `Notification` is the tag carried on the bounded channel that every
//! external thread (TAP reader, timer ticker) uses to wake the sole event
//! thread — grounded on the driver-hooks model of a single context
//! dispatching on an interrupt tag, generalized here to a `std::sync::mpsc`
//! channel since there is no hardware vector to trap on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Mutex;

use crate::error::CoreError;

/// What woke the event thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    /// Stop the event loop.
    Shutdown,
    /// Drain the protocol registry's ingress FIFOs.
    Softirq,
    /// Dispatch registered event subscribers.
    Event,
    /// Tick the timer subsystem.
    Timer,
    /// Dispatch the numbered IRQ line.
    Irq(u32),
}

/// A handle external threads hold to post notifications onto the event
/// thread's channel. Cheap to clone; sending blocks if the channel is full,
/// mirroring a real interrupt controller's backpressure.
#[derive(Clone)]
pub struct NotificationSink(SyncSender<Notification>);

impl NotificationSink {
    pub(crate) fn new(tx: SyncSender<Notification>) -> Self {
        NotificationSink(tx)
    }

    /// Post a notification. Blocks if the channel is at capacity rather than
    /// dropping it.
    pub fn send(&self, tag: Notification) {
        let _ = self.0.send(tag);
    }
}

type EventCallback = Box<dyn Fn() + Send + Sync>;

/// Subscribers invoked on every `Notification::Event`, in registration
/// order. Registration is forbidden once the event thread has started.
#[derive(Default)]
pub struct EventSubscriptions {
    subscribers: Mutex<Vec<EventCallback>>,
    running: AtomicBool,
}

impl EventSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: EventCallback) -> Result<(), CoreError> {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyRunning);
        }
        self.subscribers.lock().expect("event subscriptions poisoned").push(callback);
        Ok(())
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub fn dispatch(&self) {
        for callback in self.subscribers.lock().expect("event subscriptions poisoned").iter() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn subscribers_dispatch_in_registration_order() {
        let subs = EventSubscriptions::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        subs.subscribe(Box::new(move || o1.lock().unwrap().push(1))).unwrap();
        let o2 = order.clone();
        subs.subscribe(Box::new(move || o2.lock().unwrap().push(2))).unwrap();
        subs.dispatch();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn registration_after_start_is_rejected() {
        let subs = EventSubscriptions::new();
        subs.start();
        let err = subs.subscribe(Box::new(|| {})).unwrap_err();
        assert_eq!(err, CoreError::AlreadyRunning);
    }

    #[test]
    fn notification_sink_delivers_tags() {
        let (tx, rx) = std::sync::mpsc::sync_channel(4);
        let sink = NotificationSink::new(tx);
        sink.send(Notification::Timer);
        sink.send(Notification::Irq(9));
        assert_eq!(rx.recv().unwrap(), Notification::Timer);
        assert_eq!(rx.recv().unwrap(), Notification::Irq(9));
    }

    #[test]
    fn dispatch_counts_hits() {
        let subs = EventSubscriptions::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        subs.subscribe(Box::new(move || { hits_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();
        subs.dispatch();
        subs.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
