//! Correlation and enrichment of monitored system calls.
//!
//! Entry, intermediate and exit hooks of `connect`, `ptrace` and `mprotect`
//! are fed to a [`Correlator`], which pairs them per thread and emits a
//! [`NormalizedEvent`] for every completed call through an
//! [`EventSender`](probe_common::EventSender).

pub mod address;
pub mod config;
pub mod context;
pub mod engine;
pub mod event;
pub mod kind;
pub mod namespace;
pub mod probes;
pub mod rate_limiter;
pub mod record;
pub mod sampling;
pub mod slot_store;

pub use config::{CorrelatorConfig, MODULE_NAME};
pub use engine::{Correlator, HookContext};
pub use event::{EventFlags, EventPayload, NormalizedEvent};
pub use kind::CallKind;
