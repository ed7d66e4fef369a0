use probe_common::{EventSender, MemoryReader, time::Clock};

use crate::{
    address,
    context::ContextResolver,
    engine::{Correlator, HookContext},
    event::NormalizedEvent,
    kind::CallKind,
    record::ConnectRecord,
    sampling::SamplingConfigs,
};

impl<R, P, S, K> Correlator<R, P, S, K>
where
    R: ContextResolver,
    P: SamplingConfigs,
    S: EventSender<NormalizedEvent>,
    K: Clock,
{
    /// `connect(2)` entry. Calls without a destination are ignored.
    pub fn sys_enter_connect<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, sockaddr: u64) {
        if sockaddr == 0 {
            return;
        }
        self.enter(ctx, ConnectRecord::default().into());
    }

    /// `security_socket_connect` LSM hook: the destination address has been
    /// copied to kernel memory and the socket is known.
    pub fn security_socket_connect<M: MemoryReader>(
        &self,
        ctx: &HookContext<'_, M>,
        socket: u64,
        sockaddr: u64,
        addrlen: u32,
    ) {
        let Some(mut call) = self.pending_call(ctx, CallKind::Connect) else {
            return;
        };
        let Some(record) = call.as_connect_mut() else {
            return;
        };
        record.address = address::extract(ctx.memory, sockaddr, addrlen);
        record.protocol =
            address::socket_protocol(ctx.memory, socket, &self.config.socket_layout);
    }

    pub fn sys_exit_connect<M: MemoryReader>(&self, ctx: &HookContext<'_, M>, retval: i64) {
        self.exit(ctx, CallKind::Connect, retval);
    }
}
