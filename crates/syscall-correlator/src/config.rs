use std::{fmt, path::Path, str::FromStr};

use nix::libc;
use probe_common::{ConfigError, ModuleConfig};

use crate::{
    address::SocketLayout,
    namespace::TaskLayout,
    probes::{
        mprotect::VmaLayout,
        ptrace::{
            PTRACE_ATTACH, PTRACE_DETACH, PTRACE_KILL, PTRACE_SEIZE, PTRACE_SETOPTIONS,
            PTRACE_TRACEME,
        },
    },
    rate_limiter::{DEFAULT_BUCKETS, Limits},
    slot_store::DEFAULT_SLOT_CAPACITY,
};

pub const MODULE_NAME: &str = "syscall-correlator";

/// Ptrace requests never rate limited, unless configured otherwise.
pub const DEFAULT_IMPORTANT_PTRACE_REQUESTS: [u32; 6] = [
    PTRACE_ATTACH,
    PTRACE_DETACH,
    PTRACE_TRACEME,
    PTRACE_SEIZE,
    PTRACE_KILL,
    PTRACE_SETOPTIONS,
];

/// Failed connect calls still reported.
pub const DEFAULT_CONNECT_ALLOWED_ERRORS: [i32; 3] =
    [libc::EACCES, libc::EPERM, libc::EINPROGRESS];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatorConfig {
    pub slot_capacity: usize,
    pub rate_limiter_buckets: usize,
    pub ptrace_limits: Limits,
    pub ptrace_important_requests: Vec<u32>,
    /// Positive errno values
    pub connect_allowed_errors: Vec<i32>,
    pub task_layout: TaskLayout,
    pub socket_layout: SocketLayout,
    pub vma_layout: VmaLayout,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            slot_capacity: DEFAULT_SLOT_CAPACITY,
            rate_limiter_buckets: DEFAULT_BUCKETS,
            ptrace_limits: Limits {
                capacity: 100,
                rate: 100,
            },
            ptrace_important_requests: DEFAULT_IMPORTANT_PTRACE_REQUESTS.to_vec(),
            connect_allowed_errors: DEFAULT_CONNECT_ALLOWED_ERRORS.to_vec(),
            task_layout: TaskLayout::default(),
            socket_layout: SocketLayout::default(),
            vma_layout: VmaLayout::default(),
        }
    }
}

impl CorrelatorConfig {
    /// Load the `[syscall-correlator]` section of an INI file.
    pub fn from_ini_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let config = ModuleConfig::from_ini_file(path, MODULE_NAME)?;
        Ok(Self::try_from(&config)?)
    }

    /// Is `retval` a connect result worth reporting?
    pub fn connect_result_allowed(&self, retval: i64) -> bool {
        retval >= 0
            || self
                .connect_allowed_errors
                .iter()
                .any(|errno| -(*errno as i64) == retval)
    }
}

impl TryFrom<&ModuleConfig> for CorrelatorConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let default = CorrelatorConfig::default();
        let default_task = default.task_layout;

        let offset = |name: &str, default: u64| -> Result<u64, ConfigError> {
            config.with_default(name, Offset(default)).map(|o| o.0)
        };

        Ok(Self {
            slot_capacity: positive(config, "slot_capacity", default.slot_capacity)?,
            rate_limiter_buckets: positive(
                config,
                "rate_limiter_buckets",
                default.rate_limiter_buckets,
            )?,
            ptrace_limits: Limits {
                capacity: positive(
                    config,
                    "ptrace_rate_capacity",
                    default.ptrace_limits.capacity,
                )?,
                rate: config.with_default("ptrace_rate_limit", default.ptrace_limits.rate)?,
            },
            ptrace_important_requests: config
                .get_list_with_default::<Offset>(
                    "ptrace_important_requests",
                    default
                        .ptrace_important_requests
                        .iter()
                        .map(|r| Offset(*r as u64))
                        .collect(),
                )?
                .into_iter()
                .map(|request| u32::try_from(request.0))
                .collect::<Result<_, _>>()
                .map_err(|err| invalid("ptrace_important_requests", config, err))?,
            connect_allowed_errors: config
                .get_list_with_default("connect_allowed_errors", default.connect_allowed_errors)?
                .into_iter()
                .map(|errno: i32| errno.checked_abs())
                .collect::<Option<_>>()
                .ok_or_else(|| invalid("connect_allowed_errors", config, "errno out of range"))?,
            task_layout: TaskLayout {
                task_pid_offset: config.optional::<Offset>("task_pid_offset")?.map(|o| o.0),
                pid_level_offset: offset("pid_level_offset", default_task.pid_level_offset)?,
                pid_numbers_offset: offset("pid_numbers_offset", default_task.pid_numbers_offset)?,
                upid_size: offset("upid_size", default_task.upid_size)?,
                upid_nr_offset: offset("upid_nr_offset", default_task.upid_nr_offset)?,
                upid_ns_offset: offset("upid_ns_offset", default_task.upid_ns_offset)?,
                pid_ns_level_offset: offset(
                    "pid_ns_level_offset",
                    default_task.pid_ns_level_offset,
                )?,
                pid_ns_parent_offset: offset(
                    "pid_ns_parent_offset",
                    default_task.pid_ns_parent_offset,
                )?,
            },
            socket_layout: SocketLayout {
                type_offset: offset("socket_type_offset", default.socket_layout.type_offset)?,
            },
            vma_layout: VmaLayout {
                flags_offset: offset("vma_flags_offset", default.vma_layout.flags_offset)?,
                start_offset: offset("vma_start_offset", default.vma_layout.start_offset)?,
                end_offset: offset("vma_end_offset", default.vma_layout.end_offset)?,
            },
        })
    }
}

fn invalid(field: &str, config: &ModuleConfig, err: impl fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: config.get_raw(field).unwrap_or_default().to_string(),
        err: err.to_string(),
    }
}

fn positive<T>(config: &ModuleConfig, field: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
    <T as FromStr>::Err: fmt::Display,
{
    let value = config.with_default(field, default)?;
    if value == T::default() {
        Err(invalid(field, config, "must be greater than zero"))
    } else {
        Ok(value)
    }
}

/// Structure offset or request code, decimal or `0x` prefixed hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Offset(u64);

impl FromStr for Offset {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        }
        .map(Offset)
    }
}
