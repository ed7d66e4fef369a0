use std::{net::Ipv4Addr, sync::Arc};

use nix::libc;
use probe_common::{
    ThreadId, event_check,
    test_runner::{TestRunner, TestSender},
    test_utils::FakeMemory,
    time::{ManualClock, Timestamp},
};
use syscall_correlator::{
    CallKind, Correlator, CorrelatorConfig, EventFlags, EventPayload, HookContext,
    NormalizedEvent,
    address::{AF_INET, AddressInfo, Protocol, SOCK_DGRAM, SOCK_STREAM},
    context::{ContainerId, ContextCache, Lineage, ProcessContext, SpanContext},
    probes::ptrace::{PTRACE_ATTACH, PTRACE_PEEKTEXT, PTRACE_SEIZE},
    sampling::{SamplingConfig, SamplingTable},
};

type TestCorrelator = Correlator<
    Arc<ContextCache>,
    Arc<SamplingTable>,
    TestSender<NormalizedEvent>,
    Arc<ManualClock>,
>;

const SOCKADDR: u64 = 0x7ffd_4000_0000;
const SOCKET: u64 = 0xffff_8881_0000_0000;
const TASK: u64 = 0xffff_8882_0000_0000;
const PID: u64 = 0xffff_8883_0000_0000;
const NS_BASE: u64 = 0xffff_8884_0000_0000;
const VMA: u64 = 0xffff_8885_0000_0000;
const TASK_PID_OFFSET: u64 = 0x9a8;

struct Fixture {
    contexts: Arc<ContextCache>,
    sampling: Arc<SamplingTable>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            contexts: Arc::new(ContextCache::new()),
            sampling: Arc::new(SamplingTable::new()),
            clock: Arc::new(ManualClock::new(Timestamp::from(1_000))),
        }
    }

    fn correlator(&self, runner: &TestRunner<NormalizedEvent>) -> TestCorrelator {
        let mut config = CorrelatorConfig::default();
        config.task_layout.task_pid_offset = Some(TASK_PID_OFFSET);
        Correlator::with_clock(
            config,
            self.contexts.clone(),
            self.sampling.clone(),
            runner.sender(),
            self.clock.clone(),
        )
    }
}

fn ctx(thread: ThreadId, memory: &FakeMemory) -> HookContext<'_, FakeMemory> {
    HookContext::new(thread, Timestamp::from(5_000), memory)
}

fn connect_memory(ip: Ipv4Addr, port: u16, socket_type: i16) -> FakeMemory {
    let mut memory = FakeMemory::new();
    memory
        .write_u16(SOCKADDR, AF_INET)
        .write(SOCKADDR + 2, &port.to_be_bytes())
        .write(SOCKADDR + 4, &ip.octets())
        .write(SOCKADDR + 8, &[0; 8])
        .write_i16(SOCKET + 4, socket_type);
    memory
}

/// Task whose pid is `nrs[i]` at namespace level `i`.
fn task_memory(nrs: &[u32]) -> FakeMemory {
    let layout = CorrelatorConfig::default().task_layout;
    let mut memory = FakeMemory::new();
    memory
        .write_u64(TASK + TASK_PID_OFFSET, PID)
        .write_u32(PID + layout.pid_level_offset, nrs.len() as u32 - 1);
    for (level, nr) in nrs.iter().enumerate() {
        let upid = PID + layout.pid_numbers_offset + level as u64 * layout.upid_size;
        let ns = NS_BASE + level as u64 * 0x100;
        let parent = if level == 0 { 0 } else { ns - 0x100 };
        memory
            .write_u32(upid + layout.upid_nr_offset, *nr)
            .write_u64(upid + layout.upid_ns_offset, ns)
            .write_u32(ns + layout.pid_ns_level_offset, level as u32)
            .write_u64(ns + layout.pid_ns_parent_offset, parent);
    }
    memory
}

#[test]
fn connect_ipv4() {
    let thread = ThreadId::new(42, 42);
    let memory = connect_memory(Ipv4Addr::new(93, 184, 216, 34), 443, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);
    let destination = AddressInfo::ipv4(Ipv4Addr::new(93, 184, 216, 34), 443);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx, 0);
        })
        .expect_count(1)
        .expect_event_from(
            thread,
            event_check!(
                EventPayload::Connect,
                (family, AF_INET, "address family"),
                (addr, destination.addr, "destination address"),
                (port, 443, "destination port"),
                (protocol, Some(Protocol::Tcp), "protocol")
            ),
        )
        .expect(|event: &NormalizedEvent| event.retval == 0 && event.kind == CallKind::Connect)
        .report()
        .assert();
}

#[test]
fn connect_udp_in_progress() {
    let thread = ThreadId::new(42, 44);
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 53, SOCK_DGRAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);
    let einprogress = -(libc::EINPROGRESS as i64);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx, einprogress);
        })
        .expect_count(1)
        .expect_event(event_check!(
            EventPayload::Connect,
            (port, 53, "destination port"),
            (protocol, Some(Protocol::Udp), "protocol")
        ))
        .expect(move |event: &NormalizedEvent| event.retval == einprogress)
        .report()
        .assert();
}

#[test]
fn connect_unhandled_error() {
    let thread = ThreadId::new(42, 42);
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx, -(libc::ECONNREFUSED as i64));
            // nothing left behind
            correlator.sys_exit_connect(&ctx, 0);
        })
        .expect_no_events()
        .report()
        .assert();
}

#[test]
fn connect_without_address() {
    let thread = ThreadId::new(42, 42);
    let memory = FakeMemory::new();
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, 0);
            correlator.security_socket_connect(&ctx, SOCKET, 0, 0);
            correlator.sys_exit_connect(&ctx, 0);
        })
        .expect_no_events()
        .report()
        .assert();
}

#[test]
fn connect_unreadable_address() {
    let thread = ThreadId::new(42, 42);
    let mut memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    memory.unmap(SOCKADDR + 4, 4);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx, 0);
        })
        .expect_event(event_check!(
            EventPayload::Connect,
            (family, AF_INET, "address family"),
            (addr, [0u64, 0], "destination address"),
            (port, 8080, "destination port")
        ))
        .report()
        .assert();
}

#[test]
fn stale_entry_is_replaced() {
    let thread = ThreadId::new(42, 42);
    let first = connect_memory(Ipv4Addr::new(10, 0, 0, 1), 80, SOCK_STREAM);
    let second = connect_memory(Ipv4Addr::new(10, 0, 0, 2), 443, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx1 = ctx(thread, &first);
            correlator.sys_enter_connect(&ctx1, SOCKADDR);
            correlator.security_socket_connect(&ctx1, SOCKET, SOCKADDR, 16);
            // the first call never reached its exit
            let ctx2 = ctx(thread, &second);
            correlator.sys_enter_connect(&ctx2, SOCKADDR);
            correlator.security_socket_connect(&ctx2, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx2, 0);
        })
        .expect_count(1)
        .expect_event(event_check!(
            EventPayload::Connect,
            (
                addr,
                AddressInfo::ipv4(Ipv4Addr::new(10, 0, 0, 2), 443).addr,
                "destination address"
            ),
            (port, 443, "destination port")
        ))
        .report()
        .assert();
}

#[test]
fn exit_without_entry() {
    let memory = FakeMemory::new();
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(ThreadId::new(9, 9), &memory);
            correlator.sys_exit_connect(&ctx, 0);
            correlator.sys_exit_ptrace(&ctx, 0);
            correlator.sys_exit_mprotect(&ctx, 0);
        })
        .expect_no_events()
        .report()
        .assert();
}

#[test]
fn entries_of_other_threads_are_not_matched() {
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            correlator.sys_enter_connect(&ctx(ThreadId::new(42, 42), &memory), SOCKADDR);
            correlator.sys_exit_connect(&ctx(ThreadId::new(42, 43), &memory), 0);
            correlator.sys_exit_ptrace(&ctx(ThreadId::new(42, 42), &memory), 0);
        })
        .expect_no_events()
        .report()
        .assert();
    assert_eq!(correlator.pending(), 1);
}

#[test]
fn ptrace_rate_limited() {
    let thread = ThreadId::new(7, 7);
    let memory = task_memory(&[5000, 100]);
    let fixture = Fixture::new();
    let runner = TestRunner::new();
    let correlator = fixture.correlator(&runner);
    let budget = correlator.config().ptrace_limits.capacity;

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            for _ in 0..budget {
                correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0x1000);
                correlator.sys_exit_ptrace(&ctx, 0);
            }
            // budget exhausted, the call is not tracked
            correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0x2000);
            correlator.sys_exit_ptrace(&ctx, 0);
        })
        .expect_count(budget as usize)
        .expect(|event: &NormalizedEvent| {
            matches!(event.payload, EventPayload::Ptrace { addr: 0x1000, .. })
        })
        .report()
        .assert();

    // other processes have their own budget
    let other = ThreadId::new(8, 8);
    let runner = TestRunner::new();
    let correlator = fixture.correlator(&runner);
    runner
        .run(|| {
            let ctx7 = ctx(thread, &memory);
            for _ in 0..=budget {
                correlator.sys_enter_ptrace(&ctx7, PTRACE_PEEKTEXT, 100, 0x1000);
                correlator.sys_exit_ptrace(&ctx7, 0);
            }
            let ctx8 = ctx(other, &memory);
            correlator.sys_enter_ptrace(&ctx8, PTRACE_PEEKTEXT, 200, 0x3000);
            correlator.sys_exit_ptrace(&ctx8, 0);
        })
        .expect_count(budget as usize + 1)
        .expect_event_from(
            other,
            event_check!(EventPayload::Ptrace, (ns_pid, 200, "namespace pid")),
        )
        .report()
        .assert();
}

#[test]
fn ptrace_budget_refills() {
    let thread = ThreadId::new(7, 7);
    let memory = FakeMemory::new();
    let fixture = Fixture::new();
    let runner = TestRunner::new();
    let correlator = fixture.correlator(&runner);
    let limits = correlator.config().ptrace_limits;

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            for _ in 0..limits.capacity {
                correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0);
            }
            // denied, the exit completes the last admitted call
            correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0xdead);
            correlator.sys_exit_ptrace(&ctx, 0);

            // time for a single token
            fixture.clock.advance(1_000_000_000 / limits.rate);
            correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0xbeef);
            correlator.sys_exit_ptrace(&ctx, 0);
        })
        .expect_count(2)
        .expect_event(event_check!(EventPayload::Ptrace, (addr, 0, "address")))
        .expect_event(event_check!(EventPayload::Ptrace, (addr, 0xbeef, "address")))
        .report()
        .assert();
}

#[test]
fn ptrace_attach_is_important() {
    let thread = ThreadId::new(7, 7);
    let memory = task_memory(&[5000, 100]);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);
    let budget = correlator.config().ptrace_limits.capacity;

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            for _ in 0..budget {
                correlator.sys_enter_ptrace(&ctx, PTRACE_PEEKTEXT, 100, 0);
            }
            correlator.sys_enter_ptrace(&ctx, PTRACE_ATTACH, 100, 0);
            correlator.ptrace_check_attach(&ctx, TASK);
            correlator.sys_exit_ptrace(&ctx, 0);
        })
        .expect_count(1)
        .expect_event_from(
            thread,
            event_check!(
                EventPayload::Ptrace,
                (request, PTRACE_ATTACH, "request"),
                (pid, 5000, "root namespace pid"),
                (ns_pid, 100, "namespace pid")
            ),
        )
        .report()
        .assert();
}

#[test]
fn ptrace_pid_resolved_once() {
    let thread = ThreadId::new(7, 7);
    let first = task_memory(&[5000, 100]);
    let second = task_memory(&[6000, 100]);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx1 = ctx(thread, &first);
            let ctx2 = ctx(thread, &second);
            correlator.sys_enter_ptrace(&ctx1, PTRACE_SEIZE, 100, 0);
            correlator.ptrace_check_attach(&ctx1, TASK);
            correlator.arch_ptrace(&ctx2, TASK);
            correlator.ptrace_check_attach(&ctx2, TASK);
            // failures are reported too
            correlator.sys_exit_ptrace(&ctx2, -(libc::EPERM as i64));
        })
        .expect_count(1)
        .expect_event(event_check!(
            EventPayload::Ptrace,
            (request, PTRACE_SEIZE, "request"),
            (pid, 5000, "root namespace pid")
        ))
        .report()
        .assert();
}

#[test]
fn ptrace_unresolved_pid() {
    let thread = ThreadId::new(7, 7);
    let memory = FakeMemory::new();
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_ptrace(&ctx, PTRACE_ATTACH, 100, 0);
            correlator.ptrace_check_attach(&ctx, TASK);
            correlator.sys_exit_ptrace(&ctx, -(libc::ESRCH as i64));
        })
        .expect_event(event_check!(
            EventPayload::Ptrace,
            (pid, 0, "root namespace pid"),
            (ns_pid, 100, "namespace pid")
        ))
        .report()
        .assert();
}

#[test]
fn mprotect() {
    let thread = ThreadId::new(300, 301);
    let layout = CorrelatorConfig::default().vma_layout;
    let mut memory = FakeMemory::new();
    memory
        .write_u64(VMA + layout.start_offset, 0x7f00_0000_0000)
        .write_u64(VMA + layout.end_offset, 0x7f00_0000_4000)
        .write_u64(VMA + layout.flags_offset, 0x73);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_mprotect(&ctx);
            correlator.security_file_mprotect(&ctx, VMA, 0x7);
            correlator.sys_exit_mprotect(&ctx, -(libc::EACCES as i64));
        })
        .expect_event_from(
            thread,
            event_check!(
                EventPayload::Mprotect,
                (vm_protection, 0x73, "vma flags"),
                (req_protection, 0x7, "requested protection"),
                (vm_start, 0x7f00_0000_0000, "vma start"),
                (vm_end, 0x7f00_0000_4000, "vma end")
            ),
        )
        .report()
        .assert();
}

#[test]
fn mprotect_vma_at_the_end_of_the_address_space() {
    let thread = ThreadId::new(300, 302);
    let vma = u64::MAX - 0x10;
    let mut memory = FakeMemory::new();
    memory
        .write_u64(vma, 0x7f00_0000_0000)
        .write_u64(vma + 8, 0x7f00_0000_1000);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_mprotect(&ctx);
            correlator.security_file_mprotect(&ctx, vma, 0x5);
            correlator.sys_exit_mprotect(&ctx, 0);
        })
        .expect_event_from(
            thread,
            event_check!(
                EventPayload::Mprotect,
                (vm_protection, 0, "vma flags past the end"),
                (req_protection, 0x5, "requested protection"),
                (vm_start, 0x7f00_0000_0000, "vma start"),
                (vm_end, 0x7f00_0000_1000, "vma end")
            ),
        )
        .report()
        .assert();
}

#[test]
fn raw_sys_exit_dispatch() {
    let thread = ThreadId::new(300, 300);
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_mprotect(&ctx);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.on_raw_sys_exit(&ctx, libc::SYS_openat as i64, 3);
            correlator.on_raw_sys_exit(&ctx, libc::SYS_mprotect as i64, 0);
            correlator.on_raw_sys_exit(&ctx, libc::SYS_connect as i64, 0);
        })
        .expect_count(2)
        .expect_event(event_check!(EventPayload::Mprotect, (vm_start, 0, "vma start")))
        .expect_event(event_check!(EventPayload::Connect, (port, 8080, "port")))
        .report()
        .assert();
}

#[test]
fn enrichment_and_sampling() {
    let thread = ThreadId::new(42, 43);
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    let fixture = Fixture::new();
    let container = ContainerId::new("4b825dc642cb").unwrap();
    fixture.contexts.insert_process(ProcessContext {
        pid: 42,
        tid: 42,
        ppid: 1,
        lineage: Lineage::new([1]),
        cgroup_id: 77,
        ..Default::default()
    });
    fixture.contexts.insert_container(77, container);
    fixture.contexts.insert_span(
        thread,
        SpanContext {
            trace_id: 0xabc,
            span_id: 0xdef,
        },
    );
    fixture.sampling.insert(
        42,
        SamplingConfig {
            event_mask: [CallKind::Connect, CallKind::Ptrace].into_iter().collect(),
            end: Timestamp::from(10_000),
        },
    );
    let runner = TestRunner::new();
    let correlator = fixture.correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_connect(&ctx, SOCKADDR);
            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
            correlator.sys_exit_connect(&ctx, 0);

            correlator.sys_enter_ptrace(&ctx, PTRACE_ATTACH, 100, 0);
            correlator.sys_exit_ptrace(&ctx, 0);

            // session over
            let late = HookContext::new(thread, Timestamp::from(10_000), &memory);
            correlator.sys_enter_connect(&late, SOCKADDR);
            correlator.sys_exit_connect(&late, 0);
        })
        .expect_count(3)
        .expect(move |event: &NormalizedEvent| {
            event.kind == CallKind::Connect
                && event.flags.contains(EventFlags::SAMPLED)
                && event.process.map(|p| (p.pid, p.tid, p.ppid)) == Some((42, 43, 1))
                && event.container == Some(container)
                && event.span.map(|s| s.span_id) == Some(0xdef)
        })
        .expect(|event: &NormalizedEvent| {
            event.kind == CallKind::Ptrace && !event.flags.contains(EventFlags::SAMPLED)
        })
        .expect(|event: &NormalizedEvent| {
            event.kind == CallKind::Connect
                && event.timestamp == Timestamp::from(10_000)
                && !event.flags.contains(EventFlags::SAMPLED)
        })
        .report()
        .assert();
}

#[test]
fn missing_context_is_empty() {
    let thread = ThreadId::new(42, 42);
    let memory = FakeMemory::new();
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            let ctx = ctx(thread, &memory);
            correlator.sys_enter_mprotect(&ctx);
            correlator.security_file_mprotect(&ctx, VMA, 0x1);
            correlator.sys_exit_mprotect(&ctx, 0);
        })
        .expect_count(1)
        .expect(|event: &NormalizedEvent| {
            event.process.is_none()
                && event.container.is_none()
                && event.span.is_none()
                && event.flags == EventFlags::empty()
        })
        .expect_event(event_check!(
            EventPayload::Mprotect,
            (vm_protection, 0, "vma flags"),
            (req_protection, 0x1, "requested protection")
        ))
        .report()
        .assert();
}

#[test]
fn concurrent_threads() {
    let memory = connect_memory(Ipv4Addr::LOCALHOST, 8080, SOCK_STREAM);
    let runner = TestRunner::new();
    let correlator = Fixture::new().correlator(&runner);

    runner
        .run(|| {
            std::thread::scope(|scope| {
                for tid in 1..=8 {
                    let correlator = &correlator;
                    let memory = &memory;
                    scope.spawn(move || {
                        let ctx = ctx(ThreadId::new(1000, 1000 + tid), memory);
                        for _ in 0..50 {
                            correlator.sys_enter_connect(&ctx, SOCKADDR);
                            correlator.security_socket_connect(&ctx, SOCKET, SOCKADDR, 16);
                            correlator.sys_exit_connect(&ctx, 0);
                        }
                    });
                }
            });
        })
        .expect_count(8 * 50)
        .report()
        .assert();
    assert_eq!(correlator.pending(), 0);
}
