//! Jobs: one caller submission, shared between the submitting thread, the
//! cores it is queued on and the interrupt thread.
//!
//! ```text
//!   submit ──► Job::new ──► schedule (FIFO per core) ──► next ──► commit chunk 0
//!                                                            │
//!           irq ──► chunk n done ──► commit chunk n+1 ◄──────┘
//!                        │
//!                        └─ last chunk ──► interrupt_count-- ──► 0: done, signal, wake
//! ```
//!
//! `run_count` keeps a multi-core job off the hardware until every assigned
//! core has dequeued it; the last core to dequeue commits for all of them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use rknpu_chip::soc::{core_mask, MAX_CORES, MAX_SUBCORE_TASKS};
use rknpu_chip::{SocConfig, Task};

use crate::buffer::BufferObject;
use crate::error::NpuError;
use crate::fence::Fence;
use crate::power::PowerRef;

/// Default per-job timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(6000);

bitflags! {
    /// Submission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct JobFlags: u32 {
        /// Program-counter mode: the core fetches register commands itself.
        const PC = 1 << 0;
        /// Return after scheduling; completion is observed via the fence.
        const NONBLOCK = 1 << 1;
        /// Ping-pong register banks.
        const PINGPONG = 1 << 2;
        /// Wait on the caller's fence before scheduling.
        const FENCE_IN = 1 << 3;
        /// Return a fence signalled on completion.
        const FENCE_OUT = 1 << 4;
    }
}

/// Task range for one core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubcoreTask {
    /// First task index.
    pub task_start: u32,
    /// Number of tasks.
    pub task_number: u32,
}

impl SubcoreTask {
    /// Split `[start, start + count)` evenly over `cores` cores and lay the
    /// pieces out the way the commit path reads them: slots 0..2 for one or
    /// two cores, slots 2..5 for three. Earlier cores take the remainder.
    #[must_use]
    pub fn split(start: u32, count: u32, cores: usize) -> [Self; MAX_SUBCORE_TASKS] {
        let mut table = [Self::default(); MAX_SUBCORE_TASKS];
        let cores = cores.clamp(1, MAX_CORES);
        let base = if cores == MAX_CORES { 2 } else { 0 };
        let n = u32::try_from(cores).unwrap_or(1);
        let (each, extra) = (count / n, count % n);
        let mut next = start;
        for (i, slot) in table[base..base + cores].iter_mut().enumerate() {
            let len = each + u32::from(u32::try_from(i).unwrap_or(u32::MAX) < extra);
            *slot = Self {
                task_start: next,
                task_number: len,
            };
            next += len;
        }
        table
    }
}

/// Arguments of one submission. The job keeps its own copy.
#[derive(Debug, Clone)]
pub struct SubmitArgs {
    /// Submission flags.
    pub flags: JobFlags,
    /// Deadline for the whole job, measured from submission.
    pub timeout: Duration,
    /// First task index (single-core parts and AUTO fallback).
    pub task_start: u32,
    /// Task count.
    pub task_number: u32,
    /// Per-core ranges for multi-core parts.
    pub subcore_task: [SubcoreTask; MAX_SUBCORE_TASKS],
    /// Requested cores, or [`core_mask::AUTO`].
    pub core_mask: u32,
    /// Address-translation domain the buffers live in.
    pub domain_id: i32,
    /// Base address the register command streams are relative to.
    pub task_base_addr: u64,
    /// Task descriptor array.
    pub task_buffer: Option<Arc<dyn BufferObject>>,
    /// Fence to wait on before scheduling.
    pub fence_in: Option<Arc<dyn Fence>>,
}

impl SubmitArgs {
    /// Blocking PC-mode submission of `task_number` tasks from `task_start`
    /// on an automatically chosen core.
    #[must_use]
    pub fn pc(task_start: u32, task_number: u32) -> Self {
        Self {
            flags: JobFlags::PC,
            timeout: DEFAULT_TIMEOUT,
            task_start,
            task_number,
            subcore_task: [SubcoreTask::default(); MAX_SUBCORE_TASKS],
            core_mask: core_mask::AUTO,
            domain_id: 0,
            task_base_addr: 0,
            task_buffer: None,
            fence_in: None,
        }
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the core mask.
    #[must_use]
    pub const fn with_core_mask(mut self, mask: u32) -> Self {
        self.core_mask = mask;
        self
    }

    /// Add flags.
    #[must_use]
    pub fn with_flags(mut self, flags: JobFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Replace the flags.
    #[must_use]
    pub const fn with_exact_flags(mut self, flags: JobFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach the task descriptor array.
    #[must_use]
    pub fn with_task_buffer(mut self, buffer: Arc<dyn BufferObject>) -> Self {
        self.task_buffer = Some(buffer);
        self
    }

    /// Set the per-core range table.
    #[must_use]
    pub const fn with_subcore_tasks(mut self, table: [SubcoreTask; MAX_SUBCORE_TASKS]) -> Self {
        self.subcore_task = table;
        self
    }

    /// Set the address domain.
    #[must_use]
    pub const fn with_domain(mut self, domain_id: i32) -> Self {
        self.domain_id = domain_id;
        self
    }

    /// Set the command base address.
    #[must_use]
    pub const fn with_task_base_addr(mut self, addr: u64) -> Self {
        self.task_base_addr = addr;
        self
    }

    /// Wait on `fence` before scheduling.
    #[must_use]
    pub fn with_fence_in(mut self, fence: Arc<dyn Fence>) -> Self {
        self.flags |= JobFlags::FENCE_IN;
        self.fence_in = Some(fence);
        self
    }

    /// Task range a core executes.
    ///
    /// Single-core parts use the top-level range. Multi-core parts read the
    /// per-core table: slot `core` for one or two cores, slot `core + 2` for
    /// three. An AUTO submission with an empty slot falls back to the
    /// top-level range.
    #[must_use]
    pub fn range_for(&self, soc: &SocConfig, core: usize, use_core_num: u32, auto: bool) -> SubcoreTask {
        let top = SubcoreTask {
            task_start: self.task_start,
            task_number: self.task_number,
        };
        if !soc.is_multicore() {
            return top;
        }
        let slot = if use_core_num == 3 { core + 2 } else { core };
        let sub = self.subcore_task.get(slot).copied().unwrap_or_default();
        if auto && sub.task_number == 0 {
            top
        } else {
            sub
        }
    }
}

/// What a finished submission reports back.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Tasks completed.
    pub task_counter: u32,
    /// Hardware time from commit to the last completion.
    pub hw_elapse_time: Duration,
    /// Cores the job ran on.
    pub core_mask: u32,
    /// Completion fence, for `FENCE_OUT` submissions.
    pub fence_out: Option<Arc<dyn Fence>>,
}

/// Cores named by `mask`, lowest first.
pub fn cores_in(mask: u32, core_count: usize) -> impl Iterator<Item = usize> {
    (0..core_count.min(MAX_CORES)).filter(move |&i| mask & (1 << i) != 0)
}

/// Core whose condition a waiter sleeps on.
#[must_use]
pub const fn wait_core_index(mask: u32) -> usize {
    match mask {
        core_mask::CORE1 => 1,
        core_mask::CORE2 => 2,
        _ => 0,
    }
}

#[derive(Debug)]
struct Timing {
    submitted: Instant,
    commit: Option<Instant>,
    dispatched: [Option<Instant>; MAX_CORES],
    elapse: Duration,
}

/// One submission in flight.
pub struct Job {
    id: u64,
    args: SubmitArgs,
    soc: SocConfig,
    auto: bool,
    core_mask: AtomicU32,
    use_core_num: AtomicU32,
    run_count: AtomicU32,
    interrupt_count: AtomicU32,
    submit_count: [AtomicU32; MAX_CORES],
    int_mask: [AtomicU32; MAX_CORES],
    int_status: [AtomicU32; MAX_CORES],
    irq_entry: [AtomicBool; MAX_CORES],
    timing: Mutex<Timing>,
    committed: Mutex<Option<(Task, Task)>>,
    done: AtomicBool,
    failure: Mutex<Option<NpuError>>,
    domain_held: AtomicBool,
    fence_out: Mutex<Option<Arc<dyn Fence>>>,
    power: Mutex<Option<PowerRef>>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("core_mask", &format_args!("{:#x}", self.core_mask()))
            .field("task_number", &self.args.task_number)
            .field("flags", &self.args.flags)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    /// Create a job from its own copy of the arguments.
    #[must_use]
    pub fn new(id: u64, args: SubmitArgs, soc: &SocConfig) -> Self {
        let auto = args.core_mask == core_mask::AUTO;
        let use_core_num = if auto {
            1
        } else {
            (args.core_mask & core_mask::ALL).count_ones()
        };
        Self {
            id,
            core_mask: AtomicU32::new(args.core_mask),
            args,
            soc: *soc,
            auto,
            use_core_num: AtomicU32::new(use_core_num),
            run_count: AtomicU32::new(use_core_num),
            interrupt_count: AtomicU32::new(use_core_num),
            submit_count: Default::default(),
            int_mask: Default::default(),
            int_status: Default::default(),
            irq_entry: Default::default(),
            timing: Mutex::new(Timing {
                submitted: Instant::now(),
                commit: None,
                dispatched: [None; MAX_CORES],
                elapse: Duration::ZERO,
            }),
            committed: Mutex::new(None),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
            domain_held: AtomicBool::new(false),
            fence_out: Mutex::new(None),
            power: Mutex::new(None),
        }
    }

    /// Job id, unique per device.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Submission arguments.
    pub const fn args(&self) -> &SubmitArgs {
        &self.args
    }

    /// Submission flags.
    pub const fn flags(&self) -> JobFlags {
        self.args.flags
    }

    /// Declared timeout.
    pub const fn timeout(&self) -> Duration {
        self.args.timeout
    }

    /// Address domain.
    pub const fn domain_id(&self) -> i32 {
        self.args.domain_id
    }

    /// True if the caller asked for automatic core selection.
    pub const fn is_auto(&self) -> bool {
        self.auto
    }

    /// True for non-blocking submissions.
    pub fn is_nonblock(&self) -> bool {
        self.args.flags.contains(JobFlags::NONBLOCK)
    }

    /// Cores the job is assigned to.
    pub fn core_mask(&self) -> u32 {
        self.core_mask.load(Ordering::Acquire)
    }

    /// Number of cores the job uses.
    pub fn use_core_num(&self) -> u32 {
        self.use_core_num.load(Ordering::Acquire)
    }

    /// Pin an AUTO job to `core`.
    pub fn resolve_auto(&self, core: usize) {
        self.core_mask.store(1 << core, Ordering::Release);
        self.use_core_num.store(1, Ordering::Release);
        self.run_count.store(1, Ordering::Release);
        self.interrupt_count.store(1, Ordering::Release);
    }

    /// Core a waiter sleeps on.
    pub fn wait_core_index(&self) -> usize {
        wait_core_index(self.core_mask())
    }

    /// Task range `core` executes.
    pub fn task_range(&self, core: usize) -> SubcoreTask {
        self.args
            .range_for(&self.soc, core, self.use_core_num(), self.auto)
    }

    /// Number of chunk commits `core` needs.
    pub fn chunk_count(&self, core: usize) -> u32 {
        let max = self.soc.max_submit_number.max(1);
        self.task_range(core).task_number.div_ceil(max)
    }

    /// Record that a core dequeued the job. True for the last one.
    pub fn dequeued(&self) -> bool {
        self.run_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Record a core finishing. True for the last one.
    pub fn core_finished(&self) -> bool {
        self.interrupt_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            == Ok(1)
    }

    /// Cores still to finish.
    pub fn interrupt_count(&self) -> u32 {
        self.interrupt_count.load(Ordering::Acquire)
    }

    /// Chunks already completed on `core`.
    pub fn submit_count(&self, core: usize) -> u32 {
        self.submit_count[core].load(Ordering::Acquire)
    }

    /// Count a completed chunk on `core`; returns the new count.
    pub fn chunk_done(&self, core: usize) -> u32 {
        self.submit_count[core].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Interrupt mask programmed on `core`.
    pub fn int_mask(&self, core: usize) -> u32 {
        self.int_mask[core].load(Ordering::Acquire)
    }

    /// Last raw interrupt status seen on `core`.
    pub fn int_status(&self, core: usize) -> u32 {
        self.int_status[core].load(Ordering::Acquire)
    }

    pub(crate) fn set_int_status(&self, core: usize, status: u32) {
        self.int_status[core].store(status, Ordering::Release);
    }

    /// True once the interrupt thread claimed the current chunk on `core`.
    pub fn irq_entry(&self, core: usize) -> bool {
        self.irq_entry[core].load(Ordering::Acquire)
    }

    pub(crate) fn set_irq_entry(&self, core: usize, claimed: bool) {
        self.irq_entry[core].store(claimed, Ordering::Release);
    }

    /// Record a chunk commit on `core`.
    pub(crate) fn record_commit(&self, core: usize, first: Task, last: Task) {
        self.int_mask[core].store(last.int_mask, Ordering::Release);
        *lock(&self.committed) = Some((first, last));
    }

    /// First and last task of the most recent commit.
    pub fn committed_tasks(&self) -> Option<(Task, Task)> {
        *lock(&self.committed)
    }

    /// Stamp the hardware-commit time when `core` dequeues the job.
    pub(crate) fn stamp_dispatch(&self, core: usize, now: Instant) {
        let mut t = lock(&self.timing);
        t.commit = Some(now);
        t.dispatched[core] = Some(now);
    }

    /// Close `core`'s timing: returns the busy time to account to it.
    pub(crate) fn stamp_finish(&self, core: usize, now: Instant) -> Duration {
        let mut t = lock(&self.timing);
        if let Some(commit) = t.commit {
            t.elapse = now.saturating_duration_since(commit);
        }
        t.dispatched[core]
            .take()
            .map_or(Duration::ZERO, |r| now.saturating_duration_since(r))
    }

    /// When the job was submitted.
    pub fn submitted_at(&self) -> Instant {
        lock(&self.timing).submitted
    }

    /// When the job was last dispatched to hardware.
    pub fn committed_at(&self) -> Option<Instant> {
        lock(&self.timing).commit
    }

    /// Hardware time from commit to completion.
    pub fn hw_elapse_time(&self) -> Duration {
        lock(&self.timing).elapse
    }

    /// True once every assigned core has finished or the job failed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Mark done. True on the first call.
    pub(crate) fn mark_done(&self) -> bool {
        !self.done.swap(true, Ordering::AcqRel)
    }

    /// Record a failure; the first one wins.
    pub(crate) fn set_failure(&self, err: NpuError) {
        let mut f = lock(&self.failure);
        if f.is_none() {
            *f = Some(err);
        }
    }

    /// Take the recorded failure.
    pub fn take_failure(&self) -> Option<NpuError> {
        lock(&self.failure).take()
    }

    pub(crate) fn hold_domain(&self) {
        self.domain_held.store(true, Ordering::Release);
    }

    /// Give up the domain hold. True if it was held.
    pub(crate) fn take_domain_hold(&self) -> bool {
        self.domain_held.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn set_fence_out(&self, fence: Arc<dyn Fence>) {
        *lock(&self.fence_out) = Some(fence);
    }

    /// Completion fence, if one was allocated.
    pub fn fence_out(&self) -> Option<Arc<dyn Fence>> {
        lock(&self.fence_out).clone()
    }

    pub(crate) fn attach_power(&self, power: PowerRef) {
        *lock(&self.power) = Some(power);
    }

    /// Detach the job's power reference so the caller can drop it.
    pub(crate) fn release_power(&self) -> Option<PowerRef> {
        lock(&self.power).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_job_counts_one_core() {
        let job = Job::new(1, SubmitArgs::pc(0, 4), &SocConfig::RK3588);
        assert!(job.is_auto());
        assert_eq!(job.interrupt_count(), 1);
        job.resolve_auto(2);
        assert_eq!(job.core_mask(), core_mask::CORE2);
        assert_eq!(job.wait_core_index(), 2);
        assert!(job.dequeued());
    }

    #[test]
    fn explicit_mask_counts_every_core() {
        let args = SubmitArgs::pc(0, 6)
            .with_core_mask(core_mask::ALL)
            .with_subcore_tasks(SubcoreTask::split(0, 6, 3));
        let job = Job::new(1, args, &SocConfig::RK3588);
        assert_eq!(job.use_core_num(), 3);
        assert!(!job.dequeued());
        assert!(!job.dequeued());
        assert!(job.dequeued());
        assert!(!job.core_finished());
        assert!(!job.core_finished());
        assert!(job.core_finished());
        assert!(!job.core_finished(), "counter never goes below zero");
        assert_eq!(job.interrupt_count(), 0);
    }

    #[test]
    fn wait_core_mapping() {
        assert_eq!(wait_core_index(core_mask::CORE0), 0);
        assert_eq!(wait_core_index(core_mask::CORE1), 1);
        assert_eq!(wait_core_index(core_mask::CORE2), 2);
        assert_eq!(wait_core_index(core_mask::CORE0 | core_mask::CORE1), 0);
        assert_eq!(wait_core_index(core_mask::ALL), 0);
    }

    #[test]
    fn range_table_layout() {
        let args = SubmitArgs::pc(10, 7)
            .with_core_mask(core_mask::CORE0 | core_mask::CORE1)
            .with_subcore_tasks(SubcoreTask::split(10, 7, 2));
        let soc = SocConfig::RK3588;
        assert_eq!(args.range_for(&soc, 0, 2, false), SubcoreTask { task_start: 10, task_number: 4 });
        assert_eq!(args.range_for(&soc, 1, 2, false), SubcoreTask { task_start: 14, task_number: 3 });

        let three = SubmitArgs::pc(0, 9).with_subcore_tasks(SubcoreTask::split(0, 9, 3));
        assert_eq!(three.range_for(&soc, 0, 3, false).task_start, 0);
        assert_eq!(three.range_for(&soc, 2, 3, false).task_start, 6);

        // Single-core parts ignore the table.
        assert_eq!(
            args.range_for(&SocConfig::RK3568, 0, 1, false),
            SubcoreTask { task_start: 10, task_number: 7 }
        );
    }

    #[test]
    fn auto_falls_back_to_top_level_range() {
        let args = SubmitArgs::pc(3, 2);
        let r = args.range_for(&SocConfig::RK3588, 1, 1, true);
        assert_eq!(r, SubcoreTask { task_start: 3, task_number: 2 });
    }

    #[test]
    fn chunk_count_rounds_up() {
        let soc = SocConfig::RK3568;
        let max = soc.max_submit_number;
        let job = Job::new(1, SubmitArgs::pc(0, max + 1), &soc);
        assert_eq!(job.chunk_count(0), 2);
        assert_eq!(job.chunk_done(0), 1);
        assert_eq!(job.submit_count(0), 1);
    }

    #[test]
    fn first_failure_wins() {
        let job = Job::new(1, SubmitArgs::pc(0, 1), &SocConfig::RK3568);
        job.set_failure(NpuError::hardware_fault("first"));
        job.set_failure(NpuError::invalid_argument("second"));
        assert!(matches!(job.take_failure(), Some(NpuError::HardwareFault { .. })));
        assert!(job.mark_done());
        assert!(!job.mark_done());
    }
}
