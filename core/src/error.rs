//! The stack lifecycle's own error type. Protocol-level failures once the
//! stack is running are [`ustack_net::NetError`]; this one covers
//! registration and lifecycle misuse, which has no equivalent in a crate
//! that only ever sees a single already-running kernel.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("registration attempted after the event thread started")]
    AlreadyRunning,
    #[error("operation requires the event thread to be running")]
    NotRunning,
    #[error("the event thread is already running")]
    AlreadyStarted,
    #[error("irq {0} already has a non-shared handler registered")]
    IrqConflict(u32),
}
