//! Translation of a task's pid into the root pid namespace.
//!
//! A `struct pid` holds one `upid` per namespace level, from the root
//! (`numbers[0]`) to the namespace the task lives in (`numbers[level]`).
//! Before trusting `numbers[0]` we walk the namespace chain from
//! `numbers[level].ns` up to the root and make sure its length matches the
//! pid level.
//!
//! Hooks have a bounded instruction budget, so the walk is split in chunks
//! of [`STEPS_PER_INVOCATION`] steps: [`NsWalk`] is the cursor carried from
//! one chunk to the next.

use probe_common::{MemoryReader, ReadError, field_addr};

/// Deepest pid namespace nesting supported by the kernel.
pub const MAX_NS_LEVEL: u32 = 32;
pub const STEPS_PER_INVOCATION: u32 = 8;
/// Chunks needed to walk the deepest chain, root included.
pub const MAX_CHAINED_INVOCATIONS: u32 = (MAX_NS_LEVEL + 1).div_ceil(STEPS_PER_INVOCATION);

/// Offsets of the kernel structures involved in the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLayout {
    /// `task_struct->thread_pid`. Depends heavily on the kernel build, the
    /// walk is disabled until it's known.
    pub task_pid_offset: Option<u64>,
    /// `pid->level`
    pub pid_level_offset: u64,
    /// `pid->numbers`
    pub pid_numbers_offset: u64,
    /// `sizeof(struct upid)`
    pub upid_size: u64,
    /// `upid->nr`
    pub upid_nr_offset: u64,
    /// `upid->ns`
    pub upid_ns_offset: u64,
    /// `pid_namespace->level`
    pub pid_ns_level_offset: u64,
    /// `pid_namespace->parent`
    pub pid_ns_parent_offset: u64,
}

impl Default for TaskLayout {
    fn default() -> Self {
        Self {
            task_pid_offset: None,
            pid_level_offset: 4,
            pid_numbers_offset: 96,
            upid_size: 16,
            upid_nr_offset: 0,
            upid_ns_offset: 8,
            pid_ns_level_offset: 0x40,
            pid_ns_parent_offset: 0x48,
        }
    }
}

impl TaskLayout {
    /// Address of `pid->numbers[level]`.
    fn upid(&self, pid: u64, level: u32) -> Result<u64, ReadError> {
        let offset = (level as u64)
            .checked_mul(self.upid_size)
            .and_then(|offset| offset.checked_add(self.pid_numbers_offset))
            .ok_or(ReadError::Overflow {
                base: pid,
                offset: self.pid_numbers_offset,
            })?;
        field_addr(pid, offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    /// Root namespace reached, this is the pid there
    Done(u32),
    /// Budget exhausted, call `step` again
    Continue,
    Failed,
}

/// Cursor of a namespace chain walk.
#[derive(Debug, Clone, Copy)]
pub struct NsWalk {
    layout: TaskLayout,
    pid: u64,
    level: u32,
    /// Namespace to be visited next
    ns: u64,
    depth: u32,
}

impl NsWalk {
    /// Prepare the walk for `task`. `None` if the task, or its pid, can't be
    /// read.
    pub fn start<M: MemoryReader>(memory: &M, task: u64, layout: &TaskLayout) -> Option<Self> {
        if task == 0 {
            return None;
        }
        let task_pid_offset = layout.task_pid_offset?;
        let init = || -> Result<Option<Self>, ReadError> {
            let pid = memory.read_u64(field_addr(task, task_pid_offset)?)?;
            if pid == 0 {
                return Ok(None);
            }
            let level = memory.read_u32(field_addr(pid, layout.pid_level_offset)?)?;
            if level > MAX_NS_LEVEL {
                return Ok(None);
            }
            let upid = layout.upid(pid, level)?;
            let ns = memory.read_u64(field_addr(upid, layout.upid_ns_offset)?)?;
            Ok(Some(Self {
                layout: *layout,
                pid,
                level,
                ns,
                depth: 0,
            }))
        };
        match init() {
            Ok(walk) => walk,
            Err(err) => {
                log::trace!("pid of task {task:#x}: {err}");
                None
            }
        }
    }

    /// Visit at most `budget` namespaces.
    pub fn step<M: MemoryReader>(&mut self, memory: &M, budget: u32) -> WalkStep {
        for _ in 0..budget {
            match self.visit(memory) {
                Ok(Some(step)) => return step,
                Ok(None) => {}
                Err(err) => {
                    log::trace!("pid namespace walk: {err}");
                    return WalkStep::Failed;
                }
            }
        }
        WalkStep::Continue
    }

    fn visit<M: MemoryReader>(&mut self, memory: &M) -> Result<Option<WalkStep>, ReadError> {
        if self.ns == 0 || self.depth > self.level {
            return Ok(Some(WalkStep::Failed));
        }
        let ns_level = memory.read_u32(field_addr(self.ns, self.layout.pid_ns_level_offset)?)?;
        if ns_level != self.level - self.depth {
            log::trace!(
                "pid namespace at depth {} has level {}, expected {}",
                self.depth,
                ns_level,
                self.level - self.depth
            );
            return Ok(Some(WalkStep::Failed));
        }
        if ns_level == 0 {
            let upid = self.layout.upid(self.pid, 0)?;
            let nr = memory.read_u32(field_addr(upid, self.layout.upid_nr_offset)?)?;
            return Ok(Some(WalkStep::Done(nr)));
        }
        self.ns = memory.read_u64(field_addr(self.ns, self.layout.pid_ns_parent_offset)?)?;
        self.depth += 1;
        Ok(None)
    }
}

/// Pid of `task` in the root namespace, 0 if it can't be resolved.
pub fn resolve_root_pid<M: MemoryReader>(memory: &M, task: u64, layout: &TaskLayout) -> u32 {
    let Some(mut walk) = NsWalk::start(memory, task, layout) else {
        return 0;
    };
    for _ in 0..MAX_CHAINED_INVOCATIONS {
        match walk.step(memory, STEPS_PER_INVOCATION) {
            WalkStep::Done(nr) => return nr,
            WalkStep::Failed => return 0,
            WalkStep::Continue => {}
        }
    }
    0
}
