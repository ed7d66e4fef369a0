//! Selection of the events captured by activity dumps.

use std::{collections::HashMap, sync::RwLock};

use probe_common::{ThreadId, time::Timestamp};

use crate::kind::CallKind;

/// Set of call kinds, one bit per [`CallKind::mask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(pub u64);

impl EventMask {
    pub fn contains(self, kind: CallKind) -> bool {
        self.0 & kind.mask() != 0
    }
}

impl FromIterator<CallKind> for EventMask {
    fn from_iter<I: IntoIterator<Item = CallKind>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |mask, kind| mask | kind.mask()))
    }
}

/// Capture session of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    pub event_mask: EventMask,
    /// The session stops capturing at this time
    pub end: Timestamp,
}

/// Source of the per process capture sessions.
pub trait SamplingConfigs: Send + Sync {
    fn lookup(&self, tgid: u32) -> Option<SamplingConfig>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSampling;

impl SamplingConfigs for NoSampling {
    fn lookup(&self, _tgid: u32) -> Option<SamplingConfig> {
        None
    }
}

impl<S: SamplingConfigs + ?Sized> SamplingConfigs for std::sync::Arc<S> {
    fn lookup(&self, tgid: u32) -> Option<SamplingConfig> {
        (**self).lookup(tgid)
    }
}

/// In-memory table of capture sessions.
#[derive(Debug, Default)]
pub struct SamplingTable {
    configs: RwLock<HashMap<u32, SamplingConfig>>,
}

impl SamplingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tgid: u32, config: SamplingConfig) {
        if let Ok(mut configs) = self.configs.write() {
            configs.insert(tgid, config);
        }
    }

    pub fn remove(&self, tgid: u32) -> Option<SamplingConfig> {
        self.configs
            .write()
            .ok()
            .and_then(|mut configs| configs.remove(&tgid))
    }
}

impl SamplingConfigs for SamplingTable {
    fn lookup(&self, tgid: u32) -> Option<SamplingConfig> {
        self.configs.try_read().ok()?.get(&tgid).copied()
    }
}

/// Kinds which take part in activity dumps.
pub fn is_sampled_kind(kind: CallKind) -> bool {
    matches!(kind, CallKind::Connect)
}

pub struct SamplingPolicy<S> {
    configs: S,
}

impl<S: SamplingConfigs> SamplingPolicy<S> {
    pub fn new(configs: S) -> Self {
        Self { configs }
    }

    pub fn configs(&self) -> &S {
        &self.configs
    }

    /// Should the `kind` event of `thread` be captured?
    pub fn should_sample(&self, thread: ThreadId, kind: CallKind, now: Timestamp) -> bool {
        if !is_sampled_kind(kind) {
            return false;
        }
        match self.configs.lookup(thread.tgid()) {
            Some(config) => now < config.end && config.event_mask.contains(kind),
            None => false,
        }
    }
}
