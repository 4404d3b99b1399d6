//! Wire-adjacent POD types shared across the stack's crate boundaries.
//!
//! Everything in here is a plain, `#[repr(C)]`-stable struct meant to cross
//! a public API boundary (the socket-like surface, interface queries). The
//! address/port *newtypes* used internally by the protocol engines live in
//! `ustack-net::types` instead — this crate only holds the shapes that a
//! caller on the other side of the socket surface actually sees.

pub mod net;

pub use net::{AF_INET, InterfaceInfo, SockAddrIn};
