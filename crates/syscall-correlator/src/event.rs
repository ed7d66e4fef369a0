use std::fmt;

use probe_common::{ProbeEvent, ThreadId, time::Timestamp};
use serde::Serialize;

use crate::{
    address::{AddressInfo, Protocol},
    context::{ContainerId, ProcessContext, SpanContext},
    kind::CallKind,
    record::{CallRecord, ConnectRecord, MprotectRecord, PtraceRecord},
};

/// Event emitted when a monitored call returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedEvent {
    pub kind: CallKind,
    pub timestamp: Timestamp,
    pub thread: ThreadId,
    /// Return value of the call
    pub retval: i64,
    pub payload: EventPayload,
    pub process: Option<ProcessContext>,
    pub container: Option<ContainerId>,
    pub span: Option<SpanContext>,
    pub flags: EventFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "content")]
pub enum EventPayload {
    Connect {
        family: u16,
        addr: [u64; 2],
        port: u16,
        protocol: Option<Protocol>,
    },
    Ptrace {
        request: u32,
        /// Target pid in the root namespace, 0 if unresolved
        pid: u32,
        /// Target pid as seen by the tracer
        ns_pid: u32,
        addr: u64,
    },
    Mprotect {
        vm_protection: u64,
        req_protection: u64,
        vm_start: u64,
        vm_end: u64,
    },
}

impl From<CallRecord> for EventPayload {
    fn from(record: CallRecord) -> Self {
        match record {
            CallRecord::Connect(ConnectRecord { address, protocol }) => EventPayload::Connect {
                family: address.family,
                addr: address.addr,
                port: address.port,
                protocol,
            },
            CallRecord::Ptrace(PtraceRecord {
                request,
                pid,
                ns_pid,
                addr,
            }) => EventPayload::Ptrace {
                request,
                pid,
                ns_pid,
                addr,
            },
            CallRecord::Mprotect(MprotectRecord {
                vm_protection,
                req_protection,
                vm_start,
                vm_end,
            }) => EventPayload::Mprotect {
                vm_protection,
                req_protection,
                vm_start,
                vm_end,
            },
        }
    }
}

/// Bit set of event flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EventFlags(u32);

impl EventFlags {
    /// The event is part of an activity dump
    pub const SAMPLED: EventFlags = EventFlags(1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }
}

impl ProbeEvent for NormalizedEvent {
    type Payload = EventPayload;

    fn payload(&self) -> &EventPayload {
        &self.payload
    }

    fn thread(&self) -> ThreadId {
        self.thread
    }
}

impl fmt::Display for EventPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            EventPayload::Connect {
                family,
                addr,
                port,
                protocol,
            } => {
                let destination = AddressInfo { family, addr, port };
                write!(f, "connect -> {destination}")?;
                if let Some(protocol) = protocol {
                    write!(f, " ({protocol})")?;
                }
                Ok(())
            }
            EventPayload::Ptrace {
                request,
                pid,
                ns_pid,
                addr,
            } => write!(f, "ptrace request {request} pid {pid} (ns {ns_pid}) addr {addr:#x}"),
            EventPayload::Mprotect {
                vm_protection,
                req_protection,
                vm_start,
                vm_end,
            } => write!(
                f,
                "mprotect {vm_start:#x}-{vm_end:#x} {vm_protection:#x} -> {req_protection:#x}"
            ),
        }
    }
}

impl fmt::Display for NormalizedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.payload, self.retval)
    }
}
