use nix::libc;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, EnumString, IntoEnumIterator};

/// Category of monitored call. It keys correlation state and selects the
/// kind-specific logic.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumCount,
    EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CallKind {
    Connect = 0,
    Ptrace = 1,
    Mprotect = 2,
}

impl CallKind {
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Bit of this kind inside an event mask.
    pub const fn mask(self) -> u64 {
        1 << self as u64
    }

    /// Syscall number of this kind on the running architecture.
    pub const fn syscall_nr(self) -> i64 {
        match self {
            CallKind::Connect => libc::SYS_connect as i64,
            CallKind::Ptrace => libc::SYS_ptrace as i64,
            CallKind::Mprotect => libc::SYS_mprotect as i64,
        }
    }

    /// Map a raw syscall number to the monitored kind, if any.
    pub fn from_syscall_nr(nr: i64) -> Option<Self> {
        CallKind::iter().find(|kind| kind.syscall_nr() == nr)
    }
}
