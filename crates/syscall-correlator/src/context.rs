//! Process, container and span context attached to emitted events.
//!
//! The caches behind these lookups are filled by other components and only
//! read here. A lookup never waits: a missing entry, or a cache being
//! updated at the same time, simply leaves the context empty.

use std::{collections::HashMap, fmt, sync::RwLock};

use probe_common::{Pid, ThreadId};
use serde::{Serialize, Serializer};

pub const MAX_LINEAGE_DEPTH: usize = 8;
pub const CONTAINER_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

/// Ancestors of a process, closest first.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Lineage {
    pids: [u32; MAX_LINEAGE_DEPTH],
    len: usize,
}

impl Lineage {
    /// Build a lineage from the given ancestors. Anything past
    /// `MAX_LINEAGE_DEPTH` is ignored.
    pub fn new(ancestors: impl IntoIterator<Item = u32>) -> Self {
        let mut lineage = Self::default();
        for pid in ancestors.into_iter().take(MAX_LINEAGE_DEPTH) {
            lineage.pids[lineage.len] = pid;
            lineage.len += 1;
        }
        lineage
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.pids[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl Serialize for Lineage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.as_slice())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProcessContext {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub lineage: Lineage,
    pub credentials: Credentials,
    /// Control group of the process, used to find its container. 0 if unknown.
    pub cgroup_id: u64,
}

impl ProcessContext {
    pub fn process(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }
}

/// Container identifier, usually the 64 hex characters long id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId([u8; CONTAINER_ID_LEN]);

impl ContainerId {
    /// `None` if `id` is empty or longer than `CONTAINER_ID_LEN`.
    pub fn new(id: &str) -> Option<Self> {
        if id.is_empty() || id.len() > CONTAINER_ID_LEN {
            return None;
        }
        let mut bytes = [0; CONTAINER_ID_LEN];
        bytes[..id.len()].copy_from_slice(id.as_bytes());
        Some(Self(bytes))
    }

    pub fn as_str(&self) -> &str {
        let len = self
            .0
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(CONTAINER_ID_LEN);
        // built from a `&str` and cut on a NUL, always valid
        std::str::from_utf8(&self.0[..len]).unwrap_or_default()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.as_str())
    }
}

impl Serialize for ContainerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Distributed tracing context of the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

/// Read-only access to the context caches.
pub trait ContextResolver: Send + Sync {
    fn resolve_process(&self, thread: ThreadId) -> Option<ProcessContext>;

    fn resolve_container(&self, process: &ProcessContext) -> Option<ContainerId>;

    fn resolve_span(&self, thread: ThreadId) -> Option<SpanContext>;
}

/// Resolver which knows nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContext;

impl ContextResolver for NoContext {
    fn resolve_process(&self, _thread: ThreadId) -> Option<ProcessContext> {
        None
    }

    fn resolve_container(&self, _process: &ProcessContext) -> Option<ContainerId> {
        None
    }

    fn resolve_span(&self, _thread: ThreadId) -> Option<SpanContext> {
        None
    }
}

impl<R: ContextResolver + ?Sized> ContextResolver for std::sync::Arc<R> {
    fn resolve_process(&self, thread: ThreadId) -> Option<ProcessContext> {
        (**self).resolve_process(thread)
    }

    fn resolve_container(&self, process: &ProcessContext) -> Option<ContainerId> {
        (**self).resolve_container(process)
    }

    fn resolve_span(&self, thread: ThreadId) -> Option<SpanContext> {
        (**self).resolve_span(thread)
    }
}

/// In-memory context caches filled by their owner.
///
/// Processes are indexed by process id, containers by cgroup id and spans
/// by thread.
#[derive(Debug, Default)]
pub struct ContextCache {
    processes: RwLock<HashMap<u32, ProcessContext>>,
    containers: RwLock<HashMap<u64, ContainerId>>,
    spans: RwLock<HashMap<ThreadId, SpanContext>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_process(&self, process: ProcessContext) {
        if let Ok(mut processes) = self.processes.write() {
            processes.insert(process.pid, process);
        }
    }

    pub fn remove_process(&self, pid: Pid) -> Option<ProcessContext> {
        self.processes
            .write()
            .ok()
            .and_then(|mut processes| processes.remove(&(pid.as_raw() as u32)))
    }

    pub fn insert_container(&self, cgroup_id: u64, container: ContainerId) {
        if let Ok(mut containers) = self.containers.write() {
            containers.insert(cgroup_id, container);
        }
    }

    pub fn insert_span(&self, thread: ThreadId, span: SpanContext) {
        if let Ok(mut spans) = self.spans.write() {
            spans.insert(thread, span);
        }
    }

    pub fn remove_span(&self, thread: ThreadId) -> Option<SpanContext> {
        self.spans
            .write()
            .ok()
            .and_then(|mut spans| spans.remove(&thread))
    }
}

impl ContextResolver for ContextCache {
    fn resolve_process(&self, thread: ThreadId) -> Option<ProcessContext> {
        let processes = self.processes.try_read().ok()?;
        processes.get(&thread.tgid()).map(|process| ProcessContext {
            tid: thread.tid(),
            ..*process
        })
    }

    fn resolve_container(&self, process: &ProcessContext) -> Option<ContainerId> {
        if process.cgroup_id == 0 {
            return None;
        }
        self.containers
            .try_read()
            .ok()?
            .get(&process.cgroup_id)
            .copied()
    }

    fn resolve_span(&self, thread: ThreadId) -> Option<SpanContext> {
        self.spans.try_read().ok()?.get(&thread).copied()
    }
}
