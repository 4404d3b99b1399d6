//! Host-facing primitives shared by `ustack-core` and `ustack-net`.
//!
//! Generalizes the `slopos-lib` crate (`IrqMutex`, `clock`, `klog`)
//! from a `#![no_std]` kernel idiom to a hosted, threaded `std` program: a
//! mutex + condvar takes the place of the ticket-lock-plus-IRQ-disable, a
//! `std::time::Instant` epoch takes the place of the HPET reader, and the
//! `log` crate's facade macros take the place of the `klog` backend registry.

pub mod clock;
pub mod scheduler;

pub use scheduler::{SchedulerContext, WaitOutcome};
