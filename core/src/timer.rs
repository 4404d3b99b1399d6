//! Timer subsystem: periodic callbacks driven by the event thread's
//! `Notification::Timer` tag rather than a hardware timer IRQ.
//!
//! Grounded on the periodic-callback list shape in
//! `core/src/driver_hooks.rs`; the wall-clock source is
//! [`ustack_sync::clock::uptime_ms`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::CoreError;

type TimerCallback = Mutex<Box<dyn FnMut(u64) + Send>>;

struct TimerEntry {
    interval_ms: u64,
    last_ms: AtomicU64,
    callback: TimerCallback,
}

/// The per-stack set of registered periodic timers. Registration is
/// append-only and forbidden once the event thread has started.
#[derive(Default)]
pub struct TimerList {
    entries: Mutex<Vec<Arc<TimerEntry>>>,
    running: AtomicBool,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a periodic callback firing no more often than every
    /// `interval_ms`. `callback` receives the current uptime in
    /// milliseconds each time it fires.
    pub fn register(
        &self,
        interval_ms: u64,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> Result<(), CoreError> {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyRunning);
        }
        self.entries.lock().expect("timer list poisoned").push(Arc::new(TimerEntry {
            interval_ms,
            last_ms: AtomicU64::new(0),
            callback: Mutex::new(Box::new(callback)),
        }));
        Ok(())
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Fire every timer whose interval has elapsed since its last fire. A
    /// missed tick does not fire a callback twice: if work overran, the next
    /// tick still fires the callback exactly once.
    pub fn tick(&self, now_ms: u64) {
        let entries = self.entries.lock().expect("timer list poisoned").clone();
        for entry in &entries {
            let last = entry.last_ms.load(Ordering::Acquire);
            if now_ms.saturating_sub(last) >= entry.interval_ms {
                entry.last_ms.store(now_ms, Ordering::Release);
                (entry.callback.lock().expect("timer callback poisoned"))(now_ms);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_once_interval_elapsed() {
        let timers = TimerList::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        timers.register(100, move |_now| { hits_clone.fetch_add(1, Ordering::SeqCst); }).unwrap();
        timers.tick(50);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        timers.tick(100);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        timers.tick(150);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        timers.tick(201);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registration_after_start_is_rejected() {
        let timers = TimerList::new();
        timers.start();
        let err = timers.register(10, |_| {}).unwrap_err();
        assert_eq!(err, CoreError::AlreadyRunning);
    }
}
