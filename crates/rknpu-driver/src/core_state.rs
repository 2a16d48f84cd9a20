//! Per-core execution state.
//!
//! Every field is mutated under the scheduler lock; nothing here locks on
//! its own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{NpuError, Result};
use crate::job::Job;

/// Running slot, pending FIFO and load counters for one core.
#[derive(Debug, Default)]
pub struct CoreState {
    running: Option<Arc<Job>>,
    pending: VecDeque<Arc<Job>>,
    task_num: u64,
    busy: Duration,
    last_window_busy: Duration,
    completed: u64,
}

/// Point-in-time copy of a core's state for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// Core index.
    pub core: usize,
    /// Id of the running job, if any.
    pub running: Option<u64>,
    /// Jobs waiting in the FIFO.
    pub pending: usize,
    /// Outstanding tasks (running plus queued).
    pub task_num: u64,
    /// Busy time in the last completed load window.
    pub last_window_busy: Duration,
    /// Jobs finished on this core.
    pub completed: u64,
}

impl CoreState {
    /// Make room for one more pending job.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::ResourceExhausted`] if the FIFO cannot grow.
    pub fn reserve(&mut self) -> Result<()> {
        self.pending
            .try_reserve(1)
            .map_err(|e| NpuError::resource_exhausted(format!("job queue: {e}")))
    }

    /// Append a job and account its tasks for load balancing.
    pub fn enqueue(&mut self, job: Arc<Job>, tasks: u32) {
        self.pending.push_back(job);
        self.task_num += u64::from(tasks);
    }

    /// Move the FIFO head into the running slot. `None` if busy or empty.
    pub fn take_next(&mut self) -> Option<Arc<Job>> {
        if self.running.is_some() {
            return None;
        }
        let job = self.pending.pop_front()?;
        self.running = Some(Arc::clone(&job));
        Some(job)
    }

    /// Remove `job` from the FIFO. Returns true if it was queued here.
    pub fn remove_pending(&mut self, job: &Arc<Job>) -> bool {
        let before = self.pending.len();
        self.pending.retain(|j| !Arc::ptr_eq(j, job));
        self.pending.len() != before
    }

    /// Drain every pending job.
    pub fn drain_pending(&mut self) -> Vec<Arc<Job>> {
        self.pending.drain(..).collect()
    }

    /// Running job, if any.
    pub fn running(&self) -> Option<&Arc<Job>> {
        self.running.as_ref()
    }

    /// Clear the running slot if it still holds `job`.
    pub fn clear_running_if(&mut self, job: &Arc<Job>) -> bool {
        if self.running.as_ref().is_some_and(|r| Arc::ptr_eq(r, job)) {
            self.running = None;
            true
        } else {
            false
        }
    }

    /// Clear the running slot unconditionally.
    pub fn take_running(&mut self) -> Option<Arc<Job>> {
        self.running.take()
    }

    /// Outstanding task count.
    pub const fn task_num(&self) -> u64 {
        self.task_num
    }

    /// Drop `tasks` from the outstanding count.
    pub fn sub_tasks(&mut self, tasks: u32) {
        self.task_num = self.task_num.saturating_sub(u64::from(tasks));
    }

    /// Account busy time.
    pub fn add_busy(&mut self, busy: Duration) {
        self.busy += busy;
    }

    /// Count a job retired from this core.
    pub fn mark_completed(&mut self) {
        self.completed += 1;
    }

    /// Close the current load window.
    pub fn roll_window(&mut self) {
        self.last_window_busy = std::mem::take(&mut self.busy);
    }

    /// True with no running or queued job.
    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.pending.is_empty()
    }

    /// Diagnostic copy.
    pub fn snapshot(&self, core: usize) -> CoreSnapshot {
        CoreSnapshot {
            core,
            running: self.running.as_ref().map(|j| j.id()),
            pending: self.pending.len(),
            task_num: self.task_num,
            last_window_busy: self.last_window_busy,
            completed: self.completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::SubmitArgs;
    use rknpu_chip::SocConfig;

    fn job(id: u64) -> Arc<Job> {
        Arc::new(Job::new(id, SubmitArgs::pc(0, 1), &SocConfig::RK3568))
    }

    #[test]
    fn fifo_order_and_single_running_slot() {
        let mut c = CoreState::default();
        let (a, b) = (job(1), job(2));
        c.enqueue(Arc::clone(&a), 3);
        c.enqueue(Arc::clone(&b), 2);
        assert_eq!(c.task_num(), 5);

        assert!(Arc::ptr_eq(&c.take_next().unwrap(), &a));
        assert!(c.take_next().is_none(), "busy core must not dequeue");
        assert!(!c.clear_running_if(&b));
        assert!(c.clear_running_if(&a));
        assert!(Arc::ptr_eq(&c.take_next().unwrap(), &b));
    }

    #[test]
    fn remove_pending_and_window() {
        let mut c = CoreState::default();
        let a = job(1);
        c.enqueue(Arc::clone(&a), 1);
        assert!(c.remove_pending(&a));
        assert!(!c.remove_pending(&a));
        c.sub_tasks(5);
        assert_eq!(c.task_num(), 0);

        c.add_busy(Duration::from_millis(4));
        c.roll_window();
        assert_eq!(c.snapshot(0).last_window_busy, Duration::from_millis(4));
        c.roll_window();
        assert_eq!(c.snapshot(0).last_window_busy, Duration::ZERO);
        assert!(c.is_idle());
    }
}
