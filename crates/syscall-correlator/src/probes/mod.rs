//! Hooks of the monitored calls.
//!
//! Each module extends [`Correlator`](crate::engine::Correlator) with the
//! entry, intermediate and exit hooks of a call kind.

pub mod connect;
pub mod mprotect;
pub mod ptrace;
