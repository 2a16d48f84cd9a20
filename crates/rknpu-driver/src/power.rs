//! Reference-counted power sequencing.
//!
//! ```text
//! acquire()                  0 → 1   vdd → mem → clocks → [devfreq lock] domains → state_init
//! PowerRef::release_now()    1 → 0   [devfreq lock] wait translation idle → domains → clocks → mem → vdd
//! drop(PowerRef)             last ref: arm (or push back) the power-off timer
//! ```
//!
//! A pending deferred power-off owns the last reference until it fires, so
//! the hardware stays powered exactly while the count is non-zero.
//!
//! Lock order: power lock → devfreq lock. Busy statistics use their own
//! leaf lock so the governor can sample without touching the power lock.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::devfreq::FrequencyCoordinator;
use crate::domain::AddressDomain;
use crate::error::{NpuError, Result};
use crate::hal::{self, Clock, Platform, PowerDomain, RegisterIo, Regulator};

/// Supplies, clocks and domains sequenced by the controller.
struct Rails {
    soc: rknpu_chip::SocConfig,
    vdd: Option<Arc<dyn Regulator>>,
    mem: Option<Arc<dyn Regulator>>,
    clocks: Vec<Arc<dyn Clock>>,
    domains: Vec<Arc<dyn PowerDomain>>,
    translation: Arc<dyn AddressDomain>,
    cores: Vec<Arc<dyn RegisterIo>>,
}

#[derive(Debug, Default)]
struct Timer {
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug)]
struct BusyStats {
    last_busy: Instant,
    last_status: Instant,
    busy: Duration,
}

/// Power reference counter with debounced power-off.
pub struct PowerController {
    rails: Rails,
    devfreq: Arc<FrequencyCoordinator>,
    put_delay: Duration,
    poll_period: Duration,
    poll_timeout: Duration,
    refcount: AtomicU32,
    timer: Mutex<Timer>,
    timer_cv: Condvar,
    stats: Mutex<BusyStats>,
    power_cycles: AtomicU32,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PowerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerController")
            .field("refcount", &self.refcount())
            .field("put_delay", &self.put_delay)
            .field("power_cycles", &self.power_cycles.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// RAII power reference. Dropping it releases through the debounce timer.
#[must_use = "dropping a PowerRef releases power"]
pub struct PowerRef {
    ctl: Option<Arc<PowerController>>,
}

impl PowerRef {
    /// Release this reference without the debounce delay, powering off if
    /// it was the last one.
    ///
    /// # Errors
    ///
    /// Returns the power-off error. The reference then passes to the
    /// deferred worker, which retries the power-off.
    pub fn release_now(mut self) -> Result<()> {
        match self.ctl.take() {
            Some(ctl) => ctl.release(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PowerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerRef")
            .field("refcount", &self.ctl.as_ref().map(|c| c.refcount()))
            .finish()
    }
}

impl Drop for PowerRef {
    fn drop(&mut self) {
        if let Some(ctl) = self.ctl.take() {
            ctl.release_deferred();
        }
    }
}

impl PowerController {
    /// Build a controller and start its deferred power-off worker.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::ResourceExhausted`] if the worker thread cannot
    /// be spawned.
    pub fn new(
        platform: &Platform,
        devfreq: Arc<FrequencyCoordinator>,
        put_delay: Duration,
        poll_period: Duration,
        poll_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let now = Instant::now();
        let ctl = Arc::new(Self {
            rails: Rails {
                soc: platform.soc,
                vdd: platform.vdd.clone(),
                mem: platform.mem.clone(),
                clocks: platform.clocks.clone(),
                domains: platform.power_domains.clone(),
                translation: Arc::clone(&platform.address_domain),
                cores: platform.cores.clone(),
            },
            devfreq,
            put_delay,
            poll_period,
            poll_timeout,
            refcount: AtomicU32::new(0),
            timer: Mutex::new(Timer::default()),
            timer_cv: Condvar::new(),
            stats: Mutex::new(BusyStats {
                last_busy: now,
                last_status: now,
                busy: Duration::ZERO,
            }),
            power_cycles: AtomicU32::new(0),
            worker: Mutex::new(None),
        });

        let worker_ctl = Arc::clone(&ctl);
        let handle = thread::Builder::new()
            .name("rknpu-power-off".into())
            .spawn(move || worker_ctl.deferred_worker())
            .map_err(|e| NpuError::resource_exhausted(format!("power-off worker: {e}")))?;
        *ctl.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(ctl)
    }

    fn timer(&self) -> MutexGuard<'_, Timer> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, BusyStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current reference count.
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// True while the hardware is powered.
    pub fn is_powered(&self) -> bool {
        self.refcount() > 0
    }

    /// True while a deferred power-off is pending.
    pub fn power_off_pending(&self) -> bool {
        self.timer().deadline.is_some()
    }

    /// Completed power-on sequences since creation.
    pub fn power_cycles(&self) -> u32 {
        self.power_cycles.load(Ordering::Relaxed)
    }

    /// Take a power reference, powering on if this is the first one.
    ///
    /// # Errors
    ///
    /// Returns the first error of the power-on sequence; the count is
    /// rolled back and everything already enabled is disabled again.
    pub fn acquire(self: &Arc<Self>) -> Result<PowerRef> {
        let _power = self.timer();
        if self.refcount.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(e) = self.power_on() {
                self.refcount.fetch_sub(1, Ordering::AcqRel);
                error!("power on failed: {e}");
                return Err(e);
            }
            self.stats().last_busy = Instant::now();
            self.power_cycles.fetch_add(1, Ordering::Relaxed);
            debug!("power on (0->1)");
        }
        Ok(PowerRef {
            ctl: Some(Arc::clone(self)),
        })
    }

    fn dec_if_positive(&self) -> Option<u32> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    fn account_busy(&self) {
        let mut st = self.stats();
        let now = Instant::now();
        let last_busy = st.last_busy;
        st.busy += now.saturating_duration_since(last_busy);
        st.last_busy = now;
    }

    /// Drop one held reference immediately, powering off on the last one.
    /// Only [`PowerRef`] calls this, so every decrement has a matching
    /// acquire.
    fn release(&self) -> Result<()> {
        let mut timer = self.timer();
        if self.dec_if_positive() == Some(0) {
            // Nothing is left for a pending timer to own.
            timer.deadline = None;
            self.account_busy();
            if let Err(e) = self.power_off() {
                self.refcount.fetch_add(1, Ordering::AcqRel);
                error!("power off failed, retrying later: {e}");
                self.arm(&mut timer);
                return Err(e);
            }
            debug!("power off (1->0)");
        }
        Ok(())
    }

    /// Drop one held reference through the debounce timer.
    ///
    /// With a zero delay this is [`PowerRef::release_now`]. Otherwise
    /// the last reference is handed to the timer; any other reference is
    /// dropped at once, pushing back a pending timer when only the timer's
    /// reference remains.
    fn release_deferred(&self) {
        if self.put_delay.is_zero() {
            if let Err(e) = self.release() {
                warn!("deferred release: {e}");
            }
            return;
        }
        let mut timer = self.timer();
        if self.refcount() == 1 {
            self.arm(&mut timer);
        } else {
            let left = self.dec_if_positive();
            if left == Some(1) && timer.deadline.is_some() {
                self.arm(&mut timer);
            }
        }
    }

    fn arm(&self, timer: &mut Timer) {
        timer.deadline = Some(Instant::now() + self.put_delay.max(Duration::from_millis(1)));
        self.timer_cv.notify_all();
    }

    fn deferred_worker(&self) {
        let mut timer = self.timer();
        loop {
            if timer.shutdown {
                break;
            }
            match timer.deadline {
                None => {
                    timer = self
                        .timer_cv
                        .wait(timer)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now < deadline {
                        timer = self
                            .timer_cv
                            .wait_timeout(timer, deadline - now)
                            .unwrap_or_else(PoisonError::into_inner)
                            .0;
                        continue;
                    }
                    timer.deadline = None;
                    if self.dec_if_positive() == Some(0) {
                        self.account_busy();
                        match self.power_off() {
                            Ok(()) => debug!("deferred power off (1->0)"),
                            Err(e) => {
                                self.refcount.fetch_add(1, Ordering::AcqRel);
                                warn!("deferred power off failed, re-arming: {e}");
                                self.arm(&mut timer);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stop the deferred worker. A pending power-off fires immediately.
    pub fn shutdown(&self) {
        {
            let mut timer = self.timer();
            if timer.deadline.take().is_some() && self.dec_if_positive() == Some(0) {
                self.account_busy();
                if let Err(e) = self.power_off() {
                    warn!("power off at shutdown failed: {e}");
                }
            }
            timer.shutdown = true;
            self.timer_cv.notify_all();
        }
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    /// Busy and total time since the previous sample. An active reference
    /// counts the whole interval since the last busy mark as busy.
    pub fn sample_load(&self) -> (Duration, Duration) {
        let powered = self.is_powered();
        let mut st = self.stats();
        let now = Instant::now();
        let total = now
            .saturating_duration_since(st.last_status)
            .max(Duration::from_nanos(1));
        let mut busy = st.busy;
        if powered {
            busy += now.saturating_duration_since(st.last_busy);
            st.last_busy = now;
        }
        st.busy = Duration::ZERO;
        st.last_status = now;
        (busy.min(total), total)
    }

    fn power_on(&self) -> Result<()> {
        let r = &self.rails;
        if let Some(vdd) = &r.vdd {
            vdd.enable()?;
        }
        if let Some(mem) = &r.mem {
            if let Err(e) = mem.enable() {
                self.disable_vdd();
                return Err(e);
            }
        }
        for (i, clk) in r.clocks.iter().enumerate() {
            if let Err(e) = clk.prepare_enable() {
                error!("failed to enable clock {}: {e}", clk.name());
                r.clocks[..i].iter().rev().for_each(|c| c.disable_unprepare());
                self.disable_mem();
                self.disable_vdd();
                return Err(e);
            }
        }
        debug!("clocks enabled ({} clks)", r.clocks.len());

        let _devfreq = self.devfreq.lock();
        for (i, pd) in r.domains.iter().enumerate() {
            if let Err(e) = pd.power_on() {
                error!("failed to power on domain {}: {e}", pd.name());
                for d in r.domains[..i].iter().rev() {
                    let _ = d.power_off();
                }
                r.clocks.iter().rev().for_each(|c| c.disable_unprepare());
                self.disable_mem();
                self.disable_vdd();
                return Err(e);
            }
        }
        hal::replay_state_init(&r.soc, &r.cores);
        info!("{}: powered on", r.soc.name);
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        let r = &self.rails;
        {
            let _devfreq = self.devfreq.lock();
            if !r.domains.is_empty() {
                self.wait_translation_idle()?;
                for pd in r.domains.iter().rev() {
                    if let Err(e) = pd.power_off() {
                        warn!("failed to power off domain {}: {e}", pd.name());
                    }
                }
            }
        }
        r.clocks.iter().rev().for_each(|c| c.disable_unprepare());
        self.disable_mem();
        self.disable_vdd();
        info!("{}: powered off", r.soc.name);
        Ok(())
    }

    fn wait_translation_idle(&self) -> Result<()> {
        let start = Instant::now();
        while self.rails.translation.is_active() {
            if start.elapsed() >= self.poll_timeout {
                error!("address translation still enabled");
                return Err(NpuError::hardware_fault(
                    "address translation still active at power off",
                ));
            }
            thread::sleep(self.poll_period);
        }
        Ok(())
    }

    fn disable_mem(&self) {
        if let Some(mem) = &self.rails.mem {
            if let Err(e) = mem.disable() {
                warn!("failed to disable mem regulator: {e}");
            }
        }
    }

    fn disable_vdd(&self) {
        if let Some(vdd) = &self.rails.vdd {
            if let Err(e) = vdd.disable() {
                warn!("failed to disable vdd regulator: {e}");
            }
        }
    }
}
