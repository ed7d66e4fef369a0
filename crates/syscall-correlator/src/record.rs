//! In-flight call records.
//!
//! A record is created when a call enters, may be completed by intermediate
//! hooks and is consumed when the call exits. It only holds what is needed to
//! rebuild the call semantics once the result is known.

use crate::{
    address::{AddressInfo, Protocol},
    kind::CallKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRecord {
    Connect(ConnectRecord),
    Ptrace(PtraceRecord),
    Mprotect(MprotectRecord),
}

/// Filled by `security_socket_connect`, empty at syscall entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectRecord {
    pub address: AddressInfo,
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtraceRecord {
    pub request: u32,
    /// Target pid in the root namespace, 0 until resolved
    pub pid: u32,
    /// Target pid as passed by the caller, relative to its pid namespace
    pub ns_pid: u32,
    pub addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MprotectRecord {
    pub vm_protection: u64,
    pub req_protection: u64,
    pub vm_start: u64,
    pub vm_end: u64,
}

impl CallRecord {
    pub fn kind(&self) -> CallKind {
        match self {
            CallRecord::Connect(_) => CallKind::Connect,
            CallRecord::Ptrace(_) => CallKind::Ptrace,
            CallRecord::Mprotect(_) => CallKind::Mprotect,
        }
    }

    pub fn as_connect_mut(&mut self) -> Option<&mut ConnectRecord> {
        match self {
            CallRecord::Connect(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_ptrace_mut(&mut self) -> Option<&mut PtraceRecord> {
        match self {
            CallRecord::Ptrace(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_mprotect_mut(&mut self) -> Option<&mut MprotectRecord> {
        match self {
            CallRecord::Mprotect(record) => Some(record),
            _ => None,
        }
    }
}

impl From<ConnectRecord> for CallRecord {
    fn from(record: ConnectRecord) -> Self {
        CallRecord::Connect(record)
    }
}

impl From<PtraceRecord> for CallRecord {
    fn from(record: PtraceRecord) -> Self {
        CallRecord::Ptrace(record)
    }
}

impl From<MprotectRecord> for CallRecord {
    fn from(record: MprotectRecord) -> Self {
        CallRecord::Mprotect(record)
    }
}
