//! Job scheduler: core assignment, chunked commit, interrupt completion and
//! the blocking wait.
//!
//! All per-core state lives in one [`Mutex`] that both the submitting
//! threads and the interrupt thread take. Register writes happen after the
//! lock is dropped, except the slave-mode switch on SoCs whose PC DMA is
//! shared between cores.
//!
//! ```text
//!  schedule ─► [activate domain] ─► lock: pick core, enqueue ─► next(core)
//!  next     ─► lock: take FIFO head ─► run_count 0? ─► commit all cores
//!  irq      ─► status ok? ─► chunk left? ─► commit next chunk
//!                                     └─► retire core ─► last core? ─► finish
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rknpu_chip::regs;
use rknpu_chip::SocConfig;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::core_state::{CoreSnapshot, CoreState};
use crate::domain::AddressDomain;
use crate::error::{NpuError, Result};
use crate::hal::{Platform, RegisterIo, ResetLine};
use crate::job::{cores_in, Job, JobFlags, SubmitArgs};

/// State shared with the interrupt path.
#[derive(Debug)]
pub(crate) struct SchedState {
    pub(crate) cores: Vec<CoreState>,
}

/// Scheduler for every core of one device.
pub struct JobScheduler {
    pub(crate) soc: SocConfig,
    pub(crate) config: DriverConfig,
    pub(crate) cores: Vec<Arc<dyn RegisterIo>>,
    pub(crate) resets: Vec<Arc<dyn ResetLine>>,
    pub(crate) domain: Arc<dyn AddressDomain>,
    pub(crate) state: Mutex<SchedState>,
    pub(crate) done_cv: Vec<Condvar>,
    pub(crate) resetting: AtomicBool,
    pub(crate) reset_count: AtomicU64,
    next_id: AtomicU64,
    cleanup_tx: Mutex<Option<Sender<Arc<Job>>>>,
    cleanup_worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("soc", &self.soc.name)
            .field("resetting", &self.is_resetting())
            .field("reset_count", &self.reset_count())
            .finish_non_exhaustive()
    }
}

impl JobScheduler {
    /// Build a scheduler for `platform` and start the cleanup worker.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::ResourceExhausted`] if the worker thread cannot
    /// be spawned.
    pub fn new(platform: &Platform, config: DriverConfig) -> Result<Self> {
        let n = platform.soc.core_count;
        let (tx, rx) = mpsc::channel::<Arc<Job>>();
        let worker = thread::Builder::new()
            .name("rknpu-job-cleanup".into())
            .spawn(move || {
                for job in rx {
                    drop(job.release_power());
                    debug!("job {} cleaned up", job.id());
                }
            })
            .map_err(|e| NpuError::resource_exhausted(format!("cleanup worker: {e}")))?;

        Ok(Self {
            soc: platform.soc,
            config,
            cores: platform.cores.clone(),
            resets: platform.resets.clone(),
            domain: Arc::clone(&platform.address_domain),
            state: Mutex::new(SchedState {
                cores: (0..n).map(|_| CoreState::default()).collect(),
            }),
            done_cv: (0..n).map(|_| Condvar::new()).collect(),
            resetting: AtomicBool::new(false),
            reset_count: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            cleanup_tx: Mutex::new(Some(tx)),
            cleanup_worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// SoC the scheduler drives.
    pub const fn soc(&self) -> &SocConfig {
        &self.soc
    }

    /// True while a soft reset is in progress.
    pub fn is_resetting(&self) -> bool {
        self.resetting.load(Ordering::Acquire)
    }

    /// Soft resets performed so far.
    pub fn reset_count(&self) -> u64 {
        self.reset_count.load(Ordering::Acquire)
    }

    /// Allocate a job for `args`, reserving a FIFO slot on every core it may
    /// land on.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::ResourceExhausted`] if a FIFO cannot grow.
    pub fn create_job(&self, args: SubmitArgs) -> Result<Arc<Job>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job = Arc::new(Job::new(id, args, &self.soc));
        let mask = if job.is_auto() {
            self.soc.core_mask
        } else {
            job.core_mask()
        };
        let mut st = self.lock();
        for core in cores_in(mask, self.soc.core_count) {
            st.cores[core].reserve()?;
        }
        Ok(job)
    }

    /// Least-loaded core; ties go to the lowest index.
    fn pick_core(st: &SchedState) -> usize {
        let mut best = 0;
        for (i, c) in st.cores.iter().enumerate().skip(1) {
            if c.task_num() < st.cores[best].task_num() {
                best = i;
            }
        }
        best
    }

    /// Assign `job` to its cores and offer each one to run.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::DomainError`] if the job's address domain cannot
    /// be activated; nothing is queued in that case.
    pub fn schedule(&self, job: &Arc<Job>) -> Result<()> {
        let id = job.domain_id();
        self.domain.activate(id).map_err(|e| match e {
            NpuError::DomainError { .. } => e,
            other => NpuError::domain(id, other.to_string()),
        })?;
        job.hold_domain();

        let assigned: Vec<usize> = {
            let mut st = self.lock();
            if job.is_auto() {
                job.resolve_auto(Self::pick_core(&st));
            }
            let cores: Vec<usize> = cores_in(job.core_mask(), self.soc.core_count).collect();
            for &core in &cores {
                let tasks = job.task_range(core).task_number;
                st.cores[core].enqueue(Arc::clone(job), tasks);
            }
            cores
        };
        debug!(
            "job {} scheduled on mask {:#x} (domain {id})",
            job.id(),
            job.core_mask()
        );

        for core in assigned {
            self.next(core);
        }
        Ok(())
    }

    /// Dispatch the head of `core`'s FIFO if the core is idle.
    pub fn next(&self, core: usize) {
        if self.is_resetting() {
            return;
        }
        let job = {
            let mut st = self.lock();
            let Some(job) = st.cores.get_mut(core).and_then(CoreState::take_next) else {
                return;
            };
            job.stamp_dispatch(core, Instant::now());
            job
        };
        if job.dequeued() {
            self.commit(&job);
        }
    }

    fn commit(&self, job: &Arc<Job>) {
        for core in cores_in(job.core_mask(), self.soc.core_count) {
            if let Err(e) = self.commit_core(job, core) {
                error!("job {} commit on core {core} failed: {e}", job.id());
                self.retire_core(job, core, Some(e));
                self.next(core);
            }
        }
    }

    /// Program one chunk of `job` on `core` and start it.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn commit_core(&self, job: &Job, core: usize) -> Result<()> {
        let io = &self.cores[core];
        if self.soc.is_multicore() {
            for offset in regs::MULTICORE_COMMAND_OFFSETS {
                io.write32(offset, regs::multicore_command_word(core));
            }
        }
        if self.soc.pc_dma_ctrl {
            let _st = self.lock();
            io.write32(regs::PC_DATA_ADDR, regs::PC_DATA_ADDR_SLAVE_MODE);
        } else {
            io.write32(regs::PC_DATA_ADDR, regs::PC_DATA_ADDR_SLAVE_MODE);
        }

        if !job.flags().contains(JobFlags::PC) {
            return Err(NpuError::invalid_argument("only PC mode jobs can be committed"));
        }
        let buffer = job
            .args()
            .task_buffer
            .as_ref()
            .ok_or_else(|| NpuError::invalid_argument("job has no task buffer"))?;

        let max = self.soc.max_submit_number;
        let range = job.task_range(core);
        let done = job.submit_count(core).saturating_mul(max);
        let len = range.task_number.saturating_sub(done).min(max);
        if len == 0 {
            return Err(NpuError::invalid_argument(format!(
                "core {core} has no tasks left to commit"
            )));
        }
        let start = range.task_start + done;
        let end = start + len - 1;
        let (Some(first), Some(last)) = (buffer.task(start as usize), buffer.task(end as usize)) else {
            return Err(NpuError::invalid_argument(format!(
                "tasks {start}..={end} outside task buffer ({} descriptors)",
                buffer.task_capacity()
            )));
        };

        let amount = self.soc.pc_data_amount(first.regcfg_amount).ok_or_else(|| {
            NpuError::invalid_argument(format!(
                "task {start}: register config amount {} out of range",
                first.regcfg_amount
            ))
        })?;

        io.write32(regs::PC_DATA_ADDR, first.regcmd_addr as u32);
        io.write32(regs::PC_DATA_AMOUNT, amount);
        io.write32(regs::INT_MASK, last.int_mask);
        io.write32(regs::INT_CLEAR, first.int_mask);
        io.write32(regs::PC_DMA_BASE_ADDR, job.args().task_base_addr as u32);
        let pingpong = job.flags().contains(JobFlags::PINGPONG);
        io.write32(regs::PC_TASK_CONTROL, self.soc.pc_task_control(pingpong, len));
        job.record_commit(core, first, last);

        io.write32(regs::PC_OP_EN, 1);
        io.write32(regs::PC_OP_EN, 0);

        debug!(
            "job {} core {core}: commit tasks {start}..={end} (chunk {}), int mask {:#x}",
            job.id(),
            job.submit_count(core),
            last.int_mask
        );
        Ok(())
    }

    /// Interrupt for `core`. Only the interrupt thread calls this.
    pub fn handle_irq(&self, core: usize) {
        let Some(io) = self.cores.get(core) else {
            warn!("interrupt for unknown core {core}");
            return;
        };
        let job = self.lock().cores[core].running().cloned();
        let Some(job) = job else {
            io.write32(regs::INT_CLEAR, regs::INT_CLEAR_ALL);
            self.next(core);
            return;
        };

        let status = io.read32(regs::INT_STATUS);
        job.set_int_status(core, status);
        let expected = job.int_mask(core);
        if regs::normalize_int_status(status) != expected {
            warn!(
                "core {core}: invalid irq status {status:#x}, raw {:#x}, require mask {expected:#x}, task counter {:#x}",
                io.read32(regs::INT_RAW_STATUS),
                self.soc.task_counter(io.read32(self.soc.pc_task_status_offset))
            );
            io.write32(regs::INT_CLEAR, regs::INT_CLEAR_ALL);
            return;
        }

        let claimed = {
            let st = self.lock();
            let still_running = st.cores[core]
                .running()
                .is_some_and(|r| Arc::ptr_eq(r, &job));
            if still_running {
                job.set_irq_entry(core, true);
            }
            still_running
        };
        io.write32(regs::INT_CLEAR, regs::INT_CLEAR_ALL);
        if claimed {
            self.job_done(&job, core);
        } else {
            debug!("core {core}: job {} already reclaimed", job.id());
            self.next(core);
        }
    }

    fn job_done(&self, job: &Arc<Job>, core: usize) {
        if job.chunk_done(core) < job.chunk_count(core) {
            job.set_irq_entry(core, false);
            match self.commit_core(job, core) {
                Ok(()) => return,
                Err(e) => {
                    error!("job {} chunk commit on core {core} failed: {e}", job.id());
                    self.retire_core(job, core, Some(e));
                }
            }
        } else {
            self.retire_core(job, core, None);
        }
        self.next(core);
    }

    /// Take `job` off `core` and account it; finish the job on its last core.
    pub(crate) fn retire_core(&self, job: &Arc<Job>, core: usize, failure: Option<NpuError>) {
        let now = Instant::now();
        {
            let mut st = self.lock();
            let cs = &mut st.cores[core];
            cs.clear_running_if(job);
            cs.sub_tasks(job.task_range(core).task_number);
            cs.add_busy(job.stamp_finish(core, now));
            cs.mark_completed();
        }
        if let Some(e) = failure {
            job.set_failure(e);
        }
        if job.core_finished() {
            self.finish(job);
        }
    }

    /// Complete `job`: release its domain, mark done, signal and wake.
    pub(crate) fn finish(&self, job: &Arc<Job>) {
        if job.take_domain_hold() {
            self.domain.release(job.domain_id());
        }
        let first = {
            let _st = self.lock();
            job.mark_done()
        };
        if !first {
            return;
        }
        if let Some(fence) = job.fence_out() {
            fence.signal();
        }
        self.send_cleanup(job);
        self.done_cv[job.wait_core_index()].notify_all();
        debug!("job {} done", job.id());
    }

    fn send_cleanup(&self, job: &Arc<Job>) {
        let tx = self
            .cleanup_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match tx {
            Some(tx) if tx.send(Arc::clone(job)).is_ok() => {}
            _ => drop(job.release_power()),
        }
    }

    /// Block until `job` completes.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Timeout`] with the hardware task counter if the job
    ///   did not complete in time.
    /// - The commit error, or [`NpuError::InvalidArgument`], if the job
    ///   never reached the hardware.
    /// - The failure recorded by recovery if the job was reset away.
    pub fn wait(&self, job: &Arc<Job>) -> Result<()> {
        let core = job.wait_core_index();
        let timeout = job.timeout();
        let mut st = self.lock();
        let mut waits = 0;
        loop {
            let resets = self.reset_count();
            let (guard, res) = self.done_cv[core]
                .wait_timeout_while(st, timeout, |_| {
                    !job.is_done() && self.reset_count() == resets
                })
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            waits += 1;
            if job.is_done() || waits >= self.config.wait_retries {
                break;
            }
            if !res.timed_out() {
                // Woken by a reset that did not touch this job.
                continue;
            }
            let committed = job.committed_at();
            let continue_wait = committed.map_or(true, |t| t.elapsed() < timeout);
            error!(
                "job {} mask {:#x}: domain {} (device {}), wait {waits}, continue {continue_wait}, commit elapsed {:?}, wait time {:?}, timeout {timeout:?}",
                job.id(),
                job.core_mask(),
                job.domain_id(),
                self.domain.current_domain(),
                committed.map(|t| t.elapsed()),
                job.submitted_at().elapsed(),
            );
            if !continue_wait {
                break;
            }
        }

        if job.is_done() {
            drop(st);
            return job.take_failure().map_or(Ok(()), Err);
        }

        if job.committed_tasks().is_none() {
            for (i, c) in st.cores.iter_mut().enumerate() {
                if c.remove_pending(job) {
                    c.sub_tasks(job.task_range(i).task_number);
                }
            }
            drop(st);
            error!("job {} commit failed", job.id());
            return Err(job
                .take_failure()
                .unwrap_or_else(|| NpuError::invalid_argument("job never reached the hardware")));
        }
        drop(st);

        let raw = self.cores[core].read32(self.soc.pc_task_status_offset);
        let task_counter = self.soc.task_counter(raw);
        error!(
            "failed to wait job {}, task counter {task_counter}, flags {:?}, elapsed {:?}",
            job.id(),
            job.flags(),
            job.submitted_at().elapsed()
        );
        Err(NpuError::timeout(timeout, task_counter))
    }

    /// Tear down a job that failed to complete.
    ///
    /// Releases its domain if still held, lets in-flight interrupts settle,
    /// clears every running slot the interrupt thread has not claimed and
    /// drops it from the FIFOs. Timeouts dump the core registers and reset
    /// the job's cores.
    pub fn abort(&self, job: &Arc<Job>, err: &NpuError) {
        if job.take_domain_hold() {
            self.domain.release(job.domain_id());
        }
        thread::sleep(self.config.abort_settle);

        let mask = job.core_mask();
        let mut cleared = Vec::new();
        {
            let mut st = self.lock();
            for core in cores_in(mask, self.soc.core_count) {
                let cs = &mut st.cores[core];
                let queued = cs.remove_pending(job);
                let running = !job.irq_entry(core) && cs.clear_running_if(job);
                if queued || running {
                    cs.sub_tasks(job.task_range(core).task_number);
                }
                if running {
                    cleared.push(core);
                }
            }
        }

        if err.is_timeout() {
            error!("job {} timeout, flags {:?}", job.id(), job.flags());
            for core in cores_in(mask, self.soc.core_count) {
                let io = &self.cores[core];
                error!(
                    "\tcore {core} irq status {:#x}, raw status {:#x}, require mask {:#x}, task counter {:#x}, elapsed {:?}",
                    io.read32(regs::INT_STATUS),
                    io.read32(regs::INT_RAW_STATUS),
                    job.int_mask(core),
                    self.soc.task_counter(io.read32(self.soc.pc_task_status_offset)),
                    job.submitted_at().elapsed()
                );
            }
            self.recover(mask);
        } else {
            for core in cleared {
                self.next(core);
            }
        }
        info!("job {} aborted: {err}", job.id());
    }

    /// Close the current load window on every core.
    pub fn roll_load_windows(&self) {
        let mut st = self.lock();
        st.cores.iter_mut().for_each(CoreState::roll_window);
    }

    /// Diagnostic copy of every core.
    pub fn snapshots(&self) -> Vec<CoreSnapshot> {
        let st = self.lock();
        st.cores
            .iter()
            .enumerate()
            .map(|(i, c)| c.snapshot(i))
            .collect()
    }

    /// Stop the cleanup worker after it drains.
    pub fn shutdown(&self) {
        drop(
            self.cleanup_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let handle = self
            .cleanup_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimOptions, SimulatedNpu};

    fn scheduler(soc: SocConfig) -> (SimulatedNpu, JobScheduler) {
        let sim = SimulatedNpu::new(soc, SimOptions::default());
        let sched = JobScheduler::new(&sim.platform(), DriverConfig::default()).unwrap();
        (sim, sched)
    }

    #[test]
    fn pick_core_prefers_lowest_index_on_ties() {
        let (_sim, sched) = scheduler(SocConfig::RK3588);
        let st = sched.lock();
        assert_eq!(JobScheduler::pick_core(&st), 0);
    }

    #[test]
    fn pick_core_follows_load() {
        let (_sim, sched) = scheduler(SocConfig::RK3588);
        let a = sched.create_job(SubmitArgs::pc(0, 5)).unwrap();
        let b = sched.create_job(SubmitArgs::pc(0, 2)).unwrap();
        let mut st = sched.lock();
        st.cores[0].enqueue(a, 5);
        st.cores[1].enqueue(b, 2);
        assert_eq!(JobScheduler::pick_core(&st), 2);
    }

    #[test]
    fn job_ids_increase() {
        let (_sim, sched) = scheduler(SocConfig::RK3568);
        let a = sched.create_job(SubmitArgs::pc(0, 1)).unwrap();
        let b = sched.create_job(SubmitArgs::pc(0, 1)).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn next_is_a_no_op_while_resetting() {
        let (_sim, sched) = scheduler(SocConfig::RK3568);
        let job = sched.create_job(SubmitArgs::pc(0, 1)).unwrap();
        sched.lock().cores[0].enqueue(Arc::clone(&job), 1);
        sched.resetting.store(true, Ordering::Release);
        sched.next(0);
        assert!(sched.lock().cores[0].running().is_none());
    }
}
