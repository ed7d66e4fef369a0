mod sender;
pub mod config;
pub mod memory;
#[cfg(feature = "test-utils")]
pub mod test_runner;
#[cfg(feature = "test-utils")]
pub mod test_utils;
pub mod time;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{ConfigError, ModuleConfig};
pub use memory::{MemoryReader, ReadError, field_addr};
pub use sender::{EventSender, EventSenderWrapper};

pub use nix::unistd::Pid;

/// Identifier of the thread which triggered a hook.
///
/// It has the same layout of the value returned by `bpf_get_current_pid_tgid`:
/// the thread group id (what user-space calls the process id) lives in the
/// upper 32 bits, the kernel thread id in the lower 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(u64);

impl ThreadId {
    pub const fn new(tgid: u32, tid: u32) -> Self {
        Self(((tgid as u64) << 32) | tid as u64)
    }

    pub const fn from_raw(pid_tgid: u64) -> Self {
        Self(pid_tgid)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Process id of the thread.
    pub const fn tgid(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Kernel thread id.
    pub const fn tid(self) -> u32 {
        self.0 as u32
    }

    pub fn process(self) -> Pid {
        Pid::from_raw(self.tgid() as i32)
    }
}

/// An event emitted by a probe on behalf of a thread.
pub trait ProbeEvent: fmt::Debug {
    type Payload;

    fn payload(&self) -> &Self::Payload;

    fn thread(&self) -> ThreadId;
}

impl From<u64> for ThreadId {
    fn from(pid_tgid: u64) -> Self {
        Self(pid_tgid)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tgid(), self.tid())
    }
}
