//! IRQ table: numbered handler registration and dispatch.
//!
//! Grounded on `core/src/irq.rs::IrqEntry` (handler, name,
//! count, masked) — the array-of-16-fixed-lines discipline there exists
//! because the hardware only has 16 legacy lines to route; here any `u32`
//! tag not otherwise claimed by the event thread (§4.2) is treated as an IRQ
//! number, so the table is a growable, append-only sequence instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::error::CoreError;

/// An IRQ handler: invoked with no arguments — the tag itself already told
/// the event thread which line fired.
pub type IrqHandler = Box<dyn Fn() + Send + Sync>;

struct IrqEntry {
    irq: u32,
    shared: bool,
    handler: IrqHandler,
    count: AtomicU64,
}

/// The per-stack IRQ table. Registration (`request_irq`) is append-only and
/// forbidden once the event thread has started.
#[derive(Default)]
pub struct IrqTable {
    entries: Mutex<Vec<IrqEntry>>,
    running: AtomicBool,
}

impl IrqTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `irq`. `shared` must agree with every other
    /// handler already registered on the same line — a mismatch is a
    /// registration error, not silently tolerated.
    pub fn request_irq(&self, irq: u32, shared: bool, handler: IrqHandler) -> Result<(), CoreError> {
        if self.running.load(Ordering::Acquire) {
            return Err(CoreError::AlreadyRunning);
        }
        let mut entries = self.entries.lock().expect("irq table poisoned");
        let conflicting = entries.iter().any(|e| e.irq == irq && (!shared || !e.shared));
        if conflicting {
            return Err(CoreError::IrqConflict(irq));
        }
        entries.push(IrqEntry {
            irq,
            shared,
            handler,
            count: AtomicU64::new(0),
        });
        Ok(())
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Invoke every handler registered on `irq`, in registration order.
    /// Unhandled lines are logged and otherwise ignored.
    pub fn dispatch(&self, irq: u32) {
        let entries = self.entries.lock().expect("irq table poisoned");
        let mut handled = false;
        for entry in entries.iter().filter(|e| e.irq == irq) {
            entry.count.fetch_add(1, Ordering::Relaxed);
            (entry.handler)();
            handled = true;
        }
        if !handled {
            debug!("core: unhandled irq {irq}");
        }
    }

    /// Number of times `irq` has been dispatched. Diagnostics and tests.
    pub fn count(&self, irq: u32) -> u64 {
        self.entries
            .lock()
            .expect("irq table poisoned")
            .iter()
            .filter(|e| e.irq == irq)
            .map(|e| e.count.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn dispatch_invokes_matching_handler() {
        let table = IrqTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        table.request_irq(7, false, Box::new(move || { hits_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();
        table.dispatch(7);
        table.dispatch(3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(table.count(7), 1);
        assert_eq!(table.count(3), 0);
    }

    #[test]
    fn mixed_shared_declarations_are_rejected() {
        let table = IrqTable::new();
        table.request_irq(4, false, Box::new(|| {})).unwrap();
        let err = table.request_irq(4, true, Box::new(|| {})).unwrap_err();
        assert_eq!(err, CoreError::IrqConflict(4));
    }

    #[test]
    fn shared_handlers_on_same_line_both_run() {
        let table = IrqTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let hits_clone = hits.clone();
            table.request_irq(4, true, Box::new(move || { hits_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();
        }
        table.dispatch(4);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registration_after_start_is_rejected() {
        let table = IrqTable::new();
        table.start();
        let err = table.request_irq(1, false, Box::new(|| {})).unwrap_err();
        assert_eq!(err, CoreError::AlreadyRunning);
    }
}
