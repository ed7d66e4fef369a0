//! Entry/exit correlation of monitored calls.
//!
//! Every call goes through the same stages:
//! - the entry hook builds a [`CallRecord`] and stores it in the slot store;
//! - intermediate hooks (see the `probes` modules) complete the record in
//!   place;
//! - the exit hook retrieves the record, filters the result code, attaches
//!   process, container and span context and emits a [`NormalizedEvent`].
//!
//! Hooks never fail: any problem results in less information, or no event
//! at all.

use probe_common::{
    EventSender, MemoryReader, ThreadId,
    time::{Clock, MonotonicClock, Timestamp},
};

use crate::{
    config::CorrelatorConfig,
    context::ContextResolver,
    event::{EventFlags, NormalizedEvent},
    kind::CallKind,
    rate_limiter::{AdmissionGate, RateLimiter},
    record::CallRecord,
    sampling::{SamplingConfigs, SamplingPolicy},
    slot_store::{SlotGuard, SlotStore},
};

/// What a hook knows about the invocation that triggered it.
pub struct HookContext<'a, M> {
    pub thread: ThreadId,
    pub timestamp: Timestamp,
    /// Memory of the traced thread and of the kernel
    pub memory: &'a M,
}

impl<'a, M: MemoryReader> HookContext<'a, M> {
    pub fn new(thread: ThreadId, timestamp: Timestamp, memory: &'a M) -> Self {
        Self {
            thread,
            timestamp,
            memory,
        }
    }
}

pub struct Correlator<R, P, S, K = MonotonicClock> {
    pub(crate) config: CorrelatorConfig,
    pub(crate) slots: SlotStore,
    pub(crate) ptrace_gate: AdmissionGate<K>,
    resolver: R,
    sampling: SamplingPolicy<P>,
    sender: S,
}

impl<R, P, S> Correlator<R, P, S>
where
    R: ContextResolver,
    P: SamplingConfigs,
    S: EventSender<NormalizedEvent>,
{
    pub fn new(config: CorrelatorConfig, resolver: R, sampling: P, sender: S) -> Self {
        Self::with_clock(config, resolver, sampling, sender, MonotonicClock)
    }
}

impl<R, P, S, K> Correlator<R, P, S, K>
where
    R: ContextResolver,
    P: SamplingConfigs,
    S: EventSender<NormalizedEvent>,
    K: Clock,
{
    /// Build a correlator whose rate limiter reads time from `clock`.
    pub fn with_clock(
        config: CorrelatorConfig,
        resolver: R,
        sampling: P,
        sender: S,
        clock: K,
    ) -> Self {
        let limiter = RateLimiter::with_clock(
            config.ptrace_limits,
            config.rate_limiter_buckets,
            clock,
        );
        let ptrace_gate =
            AdmissionGate::new(limiter, config.ptrace_important_requests.iter().copied());
        log::debug!(
            "correlator: {} slots, ptrace limits {:?}",
            config.slot_capacity,
            config.ptrace_limits
        );
        Self {
            slots: SlotStore::with_capacity(config.slot_capacity),
            ptrace_gate,
            resolver,
            sampling: SamplingPolicy::new(sampling),
            sender,
            config,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn sampling_configs(&self) -> &P {
        self.sampling.configs()
    }

    /// Number of calls waiting for their exit.
    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    /// Start tracking a call of the current thread.
    pub(crate) fn enter<M>(&self, ctx: &HookContext<'_, M>, record: CallRecord) {
        if let Some(seq) = self.slots.put(ctx.thread, record) {
            log::trace!("{} #{} entered by {}", record.kind(), seq, ctx.thread);
        }
    }

    /// Record of the pending `kind` call of the current thread, if any.
    pub(crate) fn pending_call<M>(
        &self,
        ctx: &HookContext<'_, M>,
        kind: CallKind,
    ) -> Option<SlotGuard<'_>> {
        self.slots.peek(ctx.thread, kind)
    }

    /// Complete the pending `kind` call of the current thread and emit its
    /// event.
    pub fn exit<M>(&self, ctx: &HookContext<'_, M>, kind: CallKind, retval: i64) {
        let Some(record) = self.slots.pop(ctx.thread, kind) else {
            return;
        };
        if !self.result_allowed(kind, retval) {
            log::trace!("{kind} of {} failed with {retval}, ignoring", ctx.thread);
            return;
        }

        let process = self.resolver.resolve_process(ctx.thread);
        let container = process
            .as_ref()
            .and_then(|process| self.resolver.resolve_container(process));
        let span = self.resolver.resolve_span(ctx.thread);

        let mut flags = EventFlags::empty();
        if self.sampling.should_sample(ctx.thread, kind, ctx.timestamp) {
            flags.insert(EventFlags::SAMPLED);
        }

        let event = NormalizedEvent {
            kind,
            timestamp: ctx.timestamp,
            thread: ctx.thread,
            retval,
            payload: record.into(),
            process,
            container,
            span,
            flags,
        };
        log::trace!("{}: {}", ctx.thread, event);
        self.sender.send(event);
    }

    /// Exit of any syscall, as seen by the raw `sys_exit` tracepoint.
    pub fn on_raw_sys_exit<M>(&self, ctx: &HookContext<'_, M>, nr: i64, retval: i64) {
        if let Some(kind) = CallKind::from_syscall_nr(nr) {
            self.exit(ctx, kind, retval);
        }
    }

    fn result_allowed(&self, kind: CallKind, retval: i64) -> bool {
        match kind {
            CallKind::Connect => self.config.connect_result_allowed(retval),
            CallKind::Ptrace | CallKind::Mprotect => true,
        }
    }
}
