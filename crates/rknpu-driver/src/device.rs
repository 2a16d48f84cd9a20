//! NPU device context and the submission path.
//!
//! [`NpuDevice`] is built once per board from a [`Platform`] and owns every
//! component: the power controller, the frequency coordinator, the
//! scheduler, the interrupt thread and the governor thread.
//!
//! # Submission
//!
//! ```text
//! policy → validate → power ref → job + FIFO slots → fence in → fence out
//!   non-blocking: sweep timed-out cores → schedule → return
//!   blocking:     schedule → wait → (abort on error) → return
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rknpu_chip::soc::core_mask;
use rknpu_chip::SocConfig;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::core_state::CoreSnapshot;
use crate::devfreq::{DevfreqMonitor, FrequencyCoordinator};
use crate::domain::AddressDomain;
use crate::error::{NpuError, Result};
use crate::fence::FenceContext;
use crate::hal::{Platform, RegisterIo};
use crate::job::{cores_in, JobFlags, SubmitArgs, SubmitOutcome};
use crate::power::{PowerController, PowerRef};
use crate::scheduler::JobScheduler;
use crate::sim::{SimOptions, SimulatedNpu};

const IRQ_POLL: Duration = Duration::from_millis(50);

/// Interrupt raised by core `core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqEvent {
    /// Core index.
    pub core: usize,
}

/// One NPU.
pub struct NpuDevice {
    pub(crate) soc: SocConfig,
    pub(crate) config: DriverConfig,
    pub(crate) cores: Vec<Arc<dyn RegisterIo>>,
    pub(crate) bw_priority: Option<Arc<dyn RegisterIo>>,
    pub(crate) power_domains: usize,
    pub(crate) domain: Arc<dyn AddressDomain>,
    pub(crate) fences: Arc<dyn FenceContext>,
    pub(crate) power: Arc<PowerController>,
    pub(crate) frequency: Arc<FrequencyCoordinator>,
    pub(crate) scheduler: Arc<JobScheduler>,
    pub(crate) held_power: Mutex<Vec<PowerRef>>,
    irq_stop: Arc<AtomicBool>,
    irq_thread: Option<JoinHandle<()>>,
    monitor: Option<DevfreqMonitor>,
}

impl std::fmt::Debug for NpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpuDevice")
            .field("soc", &self.soc.name)
            .field("power", &self.power)
            .field("frequency", &self.frequency)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl NpuDevice {
    /// Attach to `platform`. Interrupts are read from `irq_rx`.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform does not match its SoC or a worker
    /// thread cannot be started.
    pub fn new(platform: &Platform, config: DriverConfig, irq_rx: Receiver<IrqEvent>) -> Result<Self> {
        platform.validate()?;

        let frequency = Arc::new(FrequencyCoordinator::new(
            platform.vdd.clone(),
            platform.clocks.first().cloned(),
            platform.scmi_clock.clone(),
            config.max_freq_hz,
            config.governor,
        ));
        let power = PowerController::new(
            platform,
            Arc::clone(&frequency),
            config.power_put_delay,
            config.mmu_disable_poll_period,
            config.mmu_disable_poll_timeout,
        )?;
        let scheduler = Arc::new(JobScheduler::new(platform, config.clone())?);

        let irq_stop = Arc::new(AtomicBool::new(false));
        let irq_thread = {
            let scheduler = Arc::clone(&scheduler);
            let stop = Arc::clone(&irq_stop);
            thread::Builder::new()
                .name("rknpu-irq".into())
                .spawn(move || loop {
                    match irq_rx.recv_timeout(IRQ_POLL) {
                        Ok(ev) => scheduler.handle_irq(ev.core),
                        Err(RecvTimeoutError::Timeout) => {
                            if stop.load(Ordering::Acquire) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                })
                .map_err(|e| NpuError::resource_exhausted(format!("irq thread: {e}")))?
        };

        let monitor = config.devfreq_monitor.then(|| {
            let scheduler = Arc::clone(&scheduler);
            DevfreqMonitor::spawn(
                Arc::clone(&frequency),
                Arc::clone(&power),
                config.devfreq_polling,
                config.load_interval,
                move || scheduler.roll_load_windows(),
            )
        });

        info!(
            "{}: attached ({} cores, {} power domains, translation {})",
            platform.soc.name,
            platform.soc.core_count,
            platform.power_domains.len(),
            if platform.address_domain.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            soc: platform.soc,
            config,
            cores: platform.cores.clone(),
            bw_priority: platform.bw_priority.clone(),
            power_domains: platform.power_domains.len(),
            domain: Arc::clone(&platform.address_domain),
            fences: Arc::clone(&platform.fences),
            power,
            frequency,
            scheduler,
            held_power: Mutex::new(Vec::new()),
            irq_stop,
            irq_thread: Some(irq_thread),
            monitor,
        })
    }

    /// Build a simulated board and attach to it.
    ///
    /// # Errors
    ///
    /// Same as [`NpuDevice::new`].
    pub fn simulated(soc: SocConfig, config: DriverConfig, options: SimOptions) -> Result<(Self, SimulatedNpu)> {
        let sim = SimulatedNpu::new(soc, options);
        let rx = sim
            .take_irq_receiver()
            .ok_or_else(|| NpuError::unavailable("simulator interrupt channel already taken"))?;
        let dev = Self::new(&sim.platform(), config, rx)?;
        Ok((dev, sim))
    }

    /// SoC description.
    pub const fn soc(&self) -> &SocConfig {
        &self.soc
    }

    /// Active configuration.
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Power controller.
    pub fn power(&self) -> &Arc<PowerController> {
        &self.power
    }

    /// Frequency coordinator.
    pub fn frequency(&self) -> &Arc<FrequencyCoordinator> {
        &self.frequency
    }

    /// Scheduler.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Per-core diagnostics.
    pub fn snapshots(&self) -> Vec<CoreSnapshot> {
        self.scheduler.snapshots()
    }

    fn check_policy(&self) -> Result<()> {
        if !self.config.allow_unsafe_no_power_domains
            && !self.domain.is_enabled()
            && self.power_domains == 0
        {
            error!("refusing job submission: no power domains and no address translation");
            return Err(NpuError::policy_refused(
                "platform describes no power domains; set allow_unsafe_no_power_domains to override",
            ));
        }
        Ok(())
    }

    fn validate(&self, args: &SubmitArgs) -> Result<()> {
        if args.task_number == 0 {
            return Err(NpuError::invalid_argument("task number is zero"));
        }
        let mask = args.core_mask;
        if !self.soc.accepts_mask(mask) {
            return Err(NpuError::invalid_argument(format!("invalid core mask {mask:#x}")));
        }
        if self.soc.is_multicore()
            && !matches!(
                mask,
                core_mask::AUTO
                    | core_mask::CORE0
                    | core_mask::CORE1
                    | core_mask::CORE2
                    | 0x3
                    | core_mask::ALL
            )
        {
            return Err(NpuError::invalid_argument(format!(
                "core combination {mask:#x} is not supported"
            )));
        }
        if !args.flags.contains(JobFlags::PC) {
            return Err(NpuError::invalid_argument("only PC mode submissions are supported"));
        }
        if args.flags.contains(JobFlags::FENCE_IN) && args.fence_in.is_none() {
            return Err(NpuError::invalid_argument("fence-in flag without a fence"));
        }
        let buffer = args
            .task_buffer
            .as_ref()
            .ok_or_else(|| NpuError::invalid_argument("no task buffer"))?;
        let capacity = buffer.task_capacity();

        let auto = mask == core_mask::AUTO;
        let (candidates, use_core_num) = if auto {
            (self.soc.core_mask, 1)
        } else {
            (mask, mask.count_ones())
        };
        for core in cores_in(candidates, self.soc.core_count) {
            let range = args.range_for(&self.soc, core, use_core_num, auto);
            if range.task_number == 0 {
                return Err(NpuError::invalid_argument(format!("core {core} has an empty task range")));
            }
            let end = u64::from(range.task_start) + u64::from(range.task_number);
            if end > capacity as u64 {
                return Err(NpuError::invalid_argument(format!(
                    "core {core} tasks {}..{end} exceed the task buffer ({capacity} descriptors)",
                    range.task_start
                )));
            }
            for index in range.task_start..range.task_start + range.task_number {
                let Some(task) = buffer.task(index as usize) else {
                    continue;
                };
                if self.soc.pc_data_amount(task.regcfg_amount).is_none() {
                    return Err(NpuError::invalid_argument(format!(
                        "task {index}: register config amount {} out of range",
                        task.regcfg_amount
                    )));
                }
            }
        }
        Ok(())
    }

    /// Submit a batch of tasks.
    ///
    /// Blocking submissions return once every assigned core has finished;
    /// non-blocking ones return after scheduling with the resolved core
    /// mask and, if requested, the completion fence.
    ///
    /// # Errors
    ///
    /// - [`NpuError::PolicyRefused`] without power domains or translation.
    /// - [`NpuError::InvalidArgument`] for a zero task count, an unsupported
    ///   core mask, a non-PC submission, a missing fence or task buffer, a
    ///   range outside the buffer, or a task whose register config amount
    ///   does not fit `PC_DATA_AMOUNT`.
    /// - [`NpuError::DomainError`] if the address domain cannot be
    ///   activated.
    /// - [`NpuError::Timeout`] with the hardware task counter.
    /// - Any power-on, allocation or fence error.
    pub fn submit(&self, args: SubmitArgs) -> Result<SubmitOutcome> {
        self.check_policy()?;
        self.validate(&args)?;

        let power = self.power.acquire()?;
        let job = self.scheduler.create_job(args)?;
        job.attach_power(power);

        if job.flags().contains(JobFlags::FENCE_IN) {
            if let Some(fence) = job.args().fence_in.clone() {
                if fence.context() != self.fences.context() {
                    if let Err(e) = fence.wait(job.timeout()) {
                        error!("job {}: error waiting for input fence: {e}", job.id());
                        drop(job.release_power());
                        return Err(e);
                    }
                }
            }
        }

        if job.flags().contains(JobFlags::FENCE_OUT) {
            match self.fences.allocate() {
                Ok(f) => job.set_fence_out(f),
                Err(e) => {
                    drop(job.release_power());
                    return Err(e);
                }
            }
        }

        if job.is_nonblock() {
            self.scheduler.sweep(job.args().core_mask);
            if let Err(e) = self.scheduler.schedule(&job) {
                self.scheduler.abort(&job, &e);
                drop(job.release_power());
                return Err(e);
            }
            debug!("job {} queued (non-blocking)", job.id());
            return Ok(SubmitOutcome {
                task_counter: 0,
                hw_elapse_time: Duration::ZERO,
                core_mask: job.core_mask(),
                fence_out: job.fence_out(),
            });
        }

        let result = self
            .scheduler
            .schedule(&job)
            .and_then(|()| self.scheduler.wait(&job));
        if let Err(e) = result {
            self.scheduler.abort(&job, &e);
            drop(job.release_power());
            return Err(e);
        }
        drop(job.release_power());
        Ok(SubmitOutcome {
            task_counter: job.args().task_number,
            hw_elapse_time: job.hw_elapse_time(),
            core_mask: job.core_mask(),
            fence_out: job.fence_out(),
        })
    }

    /// Stop the worker threads and drop every held power reference.
    pub fn shutdown(&mut self) {
        if let Some(mut m) = self.monitor.take() {
            m.stop();
        }
        self.irq_stop.store(true, Ordering::Release);
        if let Some(h) = self.irq_thread.take() {
            if h.join().is_err() {
                warn!("irq thread panicked");
            }
        }
        self.scheduler.shutdown();
        self.held_power
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        self.power.shutdown();
        debug!("{}: shut down", self.soc.name);
    }
}

impl Drop for NpuDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
