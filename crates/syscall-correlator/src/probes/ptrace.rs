use probe_common::{EventSender, MemoryReader, time::Clock};

use crate::{
    context::ContextResolver,
    engine::{Correlator, HookContext},
    event::NormalizedEvent,
    kind::CallKind,
    namespace,
    record::PtraceRecord,
    sampling::SamplingConfigs,
};

pub const PTRACE_TRACEME: u32 = 0;
pub const PTRACE_PEEKTEXT: u32 = 1;
pub const PTRACE_PEEKDATA: u32 = 2;
pub const PTRACE_POKETEXT: u32 = 4;
pub const PTRACE_POKEDATA: u32 = 5;
pub const PTRACE_CONT: u32 = 7;
pub const PTRACE_KILL: u32 = 8;
pub const PTRACE_ATTACH: u32 = 16;
pub const PTRACE_DETACH: u32 = 17;
pub const PTRACE_SETOPTIONS: u32 = 0x4200;
pub const PTRACE_SEIZE: u32 = 0x4206;

impl<R, P, S, K> Correlator<R, P, S, K>
where
    R: ContextResolver,
    P: SamplingConfigs,
    S: EventSender<NormalizedEvent>,
    K: Clock,
{
    /// `ptrace(2)` entry.
    ///
    /// Requests which aren't important are rate limited per process: when the
    /// caller is over its budget the call is not tracked at all.
    pub fn sys_enter_ptrace<M: MemoryReader>(
        &self,
        ctx: &HookContext<'_, M>,
        request: u32,
        pid: u32,
        addr: u64,
    ) {
        if !self.ptrace_gate.admit(request, ctx.thread.tgid() as u64) {
            log::trace!("ptrace request {request} of {} rate limited", ctx.thread);
            return;
        }
        let record = PtraceRecord {
            request,
            pid: 0,
            ns_pid: pid,
            addr,
        };
        self.enter(ctx, record.into());
    }

    /// `ptrace_check_attach`, reached by requests acting on an attached
    /// tracee.
    pub fn ptrace_check_attach<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, child: u64) {
        self.resolve_tracee(ctx, child);
    }

    /// `arch_ptrace`, reached by architecture specific requests.
    pub fn arch_ptrace<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, child: u64) {
        self.resolve_tracee(ctx, child);
    }

    pub fn sys_exit_ptrace<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, retval: i64) {
        self.exit(ctx, CallKind::Ptrace, retval);
    }

    /// Store the root namespace pid of the tracee, once.
    fn resolve_tracee<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, child: u64) {
        let Some(mut call) = self.pending_call(ctx, CallKind::Ptrace) else {
            return;
        };
        let Some(record) = call.as_ptrace_mut() else {
            return;
        };
        if record.pid != 0 {
            return;
        }
        record.pid = namespace::resolve_root_pid(ctx.memory, child, &self.config.task_layout);
    }
}
