use probe_common::{EventSender, MemoryReader, field_addr, time::Clock};

use crate::{
    context::ContextResolver,
    engine::{Correlator, HookContext},
    event::NormalizedEvent,
    kind::CallKind,
    record::MprotectRecord,
    sampling::SamplingConfigs,
};

/// Offsets inside `struct vm_area_struct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaLayout {
    pub flags_offset: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl Default for VmaLayout {
    fn default() -> Self {
        Self {
            flags_offset: 0x50,
            start_offset: 0,
            end_offset: 8,
        }
    }
}

impl<R, P, S, K> Correlator<R, P, S, K>
where
    R: ContextResolver,
    P: SamplingConfigs,
    S: EventSender<NormalizedEvent>,
    K: Clock,
{
    pub fn sys_enter_mprotect<M: MemoryReader>(&self, ctx: &HookContext<'_, M>) {
        self.enter(ctx, MprotectRecord::default().into());
    }

    /// `security_file_mprotect` LSM hook, called once the target mapping is
    /// known. Unreadable fields of the mapping are left to zero.
    pub fn security_file_mprotect<M: MemoryReader>(
        &self,
        ctx: &HookContext<'_, M>,
        vma: u64,
        reqprot: u64,
    ) {
        let Some(mut call) = self.pending_call(ctx, CallKind::Mprotect) else {
            return;
        };
        let Some(record) = call.as_mprotect_mut() else {
            return;
        };
        let layout = &self.config.vma_layout;
        let read = |offset: u64| {
            if vma == 0 {
                return 0;
            }
            field_addr(vma, offset)
                .and_then(|addr| ctx.memory.read_u64(addr))
                .unwrap_or_default()
        };
        record.vm_protection = read(layout.flags_offset);
        record.vm_start = read(layout.start_offset);
        record.vm_end = read(layout.end_offset);
        record.req_protection = reqprot;
    }

    pub fn sys_exit_mprotect<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, retval: i64) {
        self.exit(ctx, CallKind::Mprotect, retval);
    }
}
