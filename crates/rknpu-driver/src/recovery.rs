//! Hardware reset and recovery of stuck work.
//!
//! A reset is destructive: every job still owned by an affected core
//! (running and not yet claimed by the interrupt thread, or queued) fails
//! with [`NpuError::HardwareFault`]. Jobs on other cores are untouched.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rknpu_chip::soc::core_mask;
use tracing::{error, info, warn};

use crate::error::{NpuError, Result};
use crate::hal;
use crate::job::{cores_in, Job};
use crate::scheduler::JobScheduler;

impl JobScheduler {
    /// Pulse every reset line and bring the cores back to their init state.
    ///
    /// Dispatch is suspended for the duration; waiters are woken so they can
    /// re-check their jobs.
    ///
    /// # Errors
    ///
    /// Returns the first reset-line or address-domain error. The reset flag
    /// is cleared on every path.
    pub fn soft_reset(&self) -> Result<()> {
        if self.config.bypass_soft_reset {
            warn!("bypass soft reset");
            return Ok(());
        }
        self.resetting.store(true, Ordering::Release);
        let result = self.pulse_resets();
        self.resetting.store(false, Ordering::Release);

        match &result {
            Ok(()) => {
                hal::replay_state_init(&self.soc, &self.cores);
                info!("{}: soft reset done", self.soc.name);
            }
            Err(e) => error!("failed to soft reset: {e}"),
        }
        result
    }

    fn pulse_resets(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.reset_drain_timeout;
        while self.lock().cores.iter().any(|c| c.running().is_some()) {
            if Instant::now() >= deadline {
                warn!("soft reset: running jobs did not drain");
                break;
            }
            thread::sleep(std::time::Duration::from_millis(1));
        }

        self.reset_count.fetch_add(1, Ordering::AcqRel);
        {
            let _st = self.lock();
            self.done_cv.iter().for_each(std::sync::Condvar::notify_all);
        }

        let mut first_err = None;
        for line in &self.resets {
            if let Err(e) = line.assert_reset() {
                first_err.get_or_insert(e);
            }
        }
        thread::sleep(self.config.reset_settle);
        for line in &self.resets {
            if let Err(e) = line.deassert_reset() {
                first_err.get_or_insert(e);
            }
        }
        thread::sleep(self.config.reset_settle);
        if let Some(e) = first_err {
            return Err(e);
        }

        if self.domain.is_enabled() {
            self.domain.reattach()?;
        }
        Ok(())
    }

    /// Reset, then fail every job still owned by the cores in `mask` and
    /// restart dispatch.
    pub fn recover(&self, mask: u32) {
        if let Err(e) = self.soft_reset() {
            error!("recovery reset failed: {e}");
        }

        let mut victims: Vec<Arc<Job>> = Vec::new();
        {
            let mut st = self.lock();
            for core in cores_in(mask, self.soc.core_count) {
                let cs = &mut st.cores[core];
                if let Some(job) = cs.running().cloned() {
                    if !job.irq_entry(core) {
                        cs.take_running();
                        cs.sub_tasks(job.task_range(core).task_number);
                        push_unique(&mut victims, job);
                    }
                }
                for job in cs.drain_pending() {
                    cs.sub_tasks(job.task_range(core).task_number);
                    push_unique(&mut victims, job);
                }
            }
            // A failed multi-core job must not stay queued elsewhere.
            for job in &victims {
                for (i, cs) in st.cores.iter_mut().enumerate() {
                    if cs.remove_pending(job) {
                        cs.sub_tasks(job.task_range(i).task_number);
                    }
                }
            }
        }

        for job in &victims {
            warn!("job {} failed by reset", job.id());
            job.set_failure(NpuError::hardware_fault("job lost to hardware reset"));
            self.finish(job);
        }
        for core in 0..self.soc.core_count {
            self.next(core);
        }
    }

    /// Recover every core in `mask` whose running job has outlived its
    /// timeout. AUTO checks every core.
    pub fn sweep(&self, mask: u32) {
        let mask = if mask == core_mask::AUTO {
            self.soc.core_mask
        } else {
            mask
        };
        for core in cores_in(mask, self.soc.core_count) {
            let expired = self.lock().cores[core]
                .running()
                .is_some_and(|job| job.submitted_at().elapsed() >= job.timeout());
            if expired {
                warn!("core {core}: running job exceeded its timeout");
                self.recover(1 << core);
            }
        }
    }
}

fn push_unique(jobs: &mut Vec<Arc<Job>>, job: Arc<Job>) {
    if !jobs.iter().any(|j| Arc::ptr_eq(j, &job)) {
        jobs.push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::sim::{SimOptions, SimulatedNpu};
    use rknpu_chip::SocConfig;

    #[test]
    fn bypass_skips_reset_lines() {
        let sim = SimulatedNpu::new(SocConfig::RK3568, SimOptions::default());
        let sched = JobScheduler::new(
            &sim.platform(),
            DriverConfig::default().with_bypass_soft_reset(true),
        )
        .unwrap();
        sched.soft_reset().unwrap();
        assert_eq!(sched.reset_count(), 0);
        assert_eq!(sim.reset_pulses(), 0);
    }

    #[test]
    fn reset_pulses_lines_and_clears_flag() {
        let sim = SimulatedNpu::new(SocConfig::RK3588, SimOptions::default());
        let sched = JobScheduler::new(&sim.platform(), DriverConfig::default()).unwrap();
        sched.soft_reset().unwrap();
        assert_eq!(sched.reset_count(), 1);
        assert_eq!(sim.reset_pulses(), 1);
        assert!(!sched.is_resetting());
    }

    #[test]
    fn failed_reset_line_still_clears_flag() {
        let sim = SimulatedNpu::new(
            SocConfig::RK3568,
            SimOptions {
                fail_reset: true,
                ..SimOptions::default()
            },
        );
        let sched = JobScheduler::new(&sim.platform(), DriverConfig::default()).unwrap();
        assert!(sched.soft_reset().is_err());
        assert!(!sched.is_resetting());
    }
}
