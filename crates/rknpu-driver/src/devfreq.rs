//! Frequency and voltage coordination (DVFS).
//!
//! # Transition ordering
//!
//! ```text
//! higher voltage:  set_voltage(new) → set_rate(new)
//! lower voltage:   set_rate(new)    → set_voltage(new)
//! ```
//!
//! "Higher" and "lower" compare against the supply's present voltage, not
//! the table voltage of the clock being switched to.
//!
//! The requested rate is clamped to the configured ceiling, snapped to the
//! operating-point table and clamped again. Rates above 600 MHz go through
//! the firmware (SCMI) clock when one exists; lower rates prefer the
//! hardware divider (CRU) clock.
//!
//! The coordinator's state mutex doubles as the devfreq lock: power-on and
//! power-off take it so a transition never overlaps a power sequence.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rknpu_chip::opp::{self, CRU_SCMI_THRESHOLD_HZ, DEFAULT_FREQ_HZ, MIN_FREQ_HZ, VOLTAGE_WINDOW_UV};
use tracing::{debug, info, warn};

use crate::error::{NpuError, Result};
use crate::hal::{Clock, Regulator};
use crate::power::PowerController;

/// Frequency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Governor {
    /// Jump to max above `up_threshold`% load, hold inside the hysteresis
    /// band, otherwise scale proportionally.
    SimpleOndemand {
        /// Load percentage that triggers max frequency.
        up_threshold: u32,
        /// Width of the hold band below `up_threshold`.
        down_differential: u32,
    },
    /// Always max.
    Performance,
    /// Always min.
    Powersave,
    /// Fixed rate in Hz.
    Userspace(u64),
}

impl Default for Governor {
    fn default() -> Self {
        Self::SimpleOndemand {
            up_threshold: 70,
            down_differential: 20,
        }
    }
}

impl Governor {
    /// Next target rate given a load sample.
    #[must_use]
    pub fn target(&self, busy: Duration, total: Duration, current_hz: u64, min_hz: u64, max_hz: u64) -> u64 {
        let raw = match *self {
            Self::Performance => max_hz,
            Self::Powersave => min_hz,
            Self::Userspace(hz) => hz,
            Self::SimpleOndemand {
                up_threshold,
                down_differential,
            } => ondemand(busy, total, current_hz, max_hz, up_threshold, down_differential),
        };
        raw.clamp(min_hz, max_hz.max(min_hz))
    }
}

fn ondemand(busy: Duration, total: Duration, current_hz: u64, max_hz: u64, up: u32, down: u32) -> u64 {
    let busy = busy.as_nanos();
    let total = total.as_nanos();
    let up = u128::from(up);
    let down = u128::from(down);

    if total == 0 {
        return max_hz;
    }
    if busy * 100 > total * up {
        return max_hz;
    }
    if current_hz == 0 {
        return max_hz;
    }
    if busy * 100 > total * up.saturating_sub(down) {
        return current_hz;
    }
    let divisor = up.saturating_sub(down / 2).max(1);
    let scaled = busy * u128::from(current_hz) / total * 100 / divisor;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Which clock drives the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    /// Hardware divider clock.
    Cru,
    /// Firmware-mediated clock.
    Scmi,
}

impl fmt::Display for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cru => "CRU",
            Self::Scmi => "SCMI",
        })
    }
}

/// Mutable DVFS state, guarded by the devfreq lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyState {
    /// Last achieved rate in Hz.
    pub current_freq: u64,
    /// Last applied voltage in microvolts.
    pub current_volt: u32,
    /// Clock used for the last transition.
    pub source: ClockSource,
}

/// Frequency/voltage coordinator.
pub struct FrequencyCoordinator {
    vdd: Option<Arc<dyn Regulator>>,
    cru: Option<Arc<dyn Clock>>,
    scmi: Option<Arc<dyn Clock>>,
    max_freq_hz: u64,
    state: Mutex<FrequencyState>,
    governor: Mutex<Governor>,
    bypass: AtomicBool,
}

impl fmt::Debug for FrequencyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrequencyCoordinator")
            .field("max_freq_hz", &self.max_freq_hz)
            .field("state", &self.snapshot())
            .field("bypass", &self.is_bypassed())
            .finish_non_exhaustive()
    }
}

impl FrequencyCoordinator {
    /// Build from the platform's clocks and supply.
    ///
    /// The starting rate is read from the CRU clock, else the SCMI clock,
    /// else assumed to be 600 MHz.
    pub fn new(
        vdd: Option<Arc<dyn Regulator>>,
        cru: Option<Arc<dyn Clock>>,
        scmi: Option<Arc<dyn Clock>>,
        max_freq_hz: u64,
        governor: Governor,
    ) -> Self {
        let (current_freq, source) = match (&cru, &scmi) {
            (Some(c), _) => (c.rate(), ClockSource::Cru),
            (None, Some(s)) => (s.rate(), ClockSource::Scmi),
            (None, None) => (DEFAULT_FREQ_HZ, ClockSource::Cru),
        };
        let current_volt = vdd.as_ref().map_or_else(|| opp::voltage_for_freq(current_freq), |r| r.voltage());
        if scmi.is_none() {
            info!("devfreq: CRU-only mode, max {} MHz", CRU_SCMI_THRESHOLD_HZ / opp::MHZ);
        }
        info!("devfreq: init at {} MHz [{source}]", current_freq / opp::MHZ);
        Self {
            vdd,
            cru,
            scmi,
            max_freq_hz,
            state: Mutex::new(FrequencyState {
                current_freq,
                current_volt,
                source,
            }),
            governor: Mutex::new(governor),
            bypass: AtomicBool::new(false),
        }
    }

    /// Take the devfreq lock.
    pub fn lock(&self) -> MutexGuard<'_, FrequencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> FrequencyState {
        *self.lock()
    }

    /// Configured ceiling.
    pub const fn max_freq_hz(&self) -> u64 {
        self.max_freq_hz
    }

    /// Effective ceiling: the configured one, limited to what the
    /// available clocks can reach.
    pub fn scaling_max_hz(&self) -> u64 {
        let reachable = if self.scmi.is_some() {
            opp::table_max_hz()
        } else {
            CRU_SCMI_THRESHOLD_HZ
        };
        self.max_freq_hz.min(reachable)
    }

    fn select_clock(&self, target_hz: u64) -> Result<(&Arc<dyn Clock>, ClockSource)> {
        if target_hz > CRU_SCMI_THRESHOLD_HZ {
            if let Some(s) = &self.scmi {
                return Ok((s, ClockSource::Scmi));
            }
        }
        if let Some(c) = &self.cru {
            return Ok((c, ClockSource::Cru));
        }
        if let Some(s) = &self.scmi {
            return Ok((s, ClockSource::Scmi));
        }
        Err(NpuError::unavailable("no clock available for DVFS"))
    }

    /// Move to `freq_hz`, respecting the ceiling and voltage ordering.
    /// Returns the rate the hardware reports afterwards.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Unavailable`] if there is no clock at all.
    /// - Any error from raising the voltage or setting the rate; a failed
    ///   rate change restores the previous voltage.
    pub fn set_target(&self, freq_hz: u64) -> Result<u64> {
        let mut st = self.lock();
        self.transition(&mut st, freq_hz)
    }

    fn transition(&self, st: &mut FrequencyState, freq_hz: u64) -> Result<u64> {
        let mut target = freq_hz;
        if target > self.max_freq_hz {
            warn!(
                "requested {} MHz exceeds safe maximum ({} MHz), capping",
                target / opp::MHZ,
                self.max_freq_hz / opp::MHZ
            );
            target = self.max_freq_hz;
        }

        let (clk, source) = self.select_clock(target)?;
        let old_freq = clk.rate();

        let point = opp::recommended(target);
        target = point.freq_hz.min(self.max_freq_hz);
        let new_volt = point.microvolt;
        // The supply may have been set for the other clock.
        let old_volt = self
            .vdd
            .as_ref()
            .map_or_else(|| opp::voltage_for_freq(old_freq), |r| r.voltage());

        debug!(
            "DVFS: {} MHz -> {} MHz (volt: {old_volt} -> {new_volt} uV) [{source}]",
            st.current_freq / opp::MHZ,
            target / opp::MHZ
        );

        let raise = new_volt > old_volt;
        if raise {
            if let Some(vdd) = &self.vdd {
                vdd.set_voltage(new_volt, new_volt + VOLTAGE_WINDOW_UV)?;
                debug!("DVFS: voltage raised to {new_volt} uV");
            }
        }

        if let Err(e) = clk.set_rate(target) {
            warn!("failed to set {} to {target} Hz: {e}", clk.name());
            if raise {
                if let Some(vdd) = &self.vdd {
                    if let Err(e) = vdd.set_voltage(old_volt, old_volt + VOLTAGE_WINDOW_UV) {
                        warn!("failed to restore voltage {old_volt} uV: {e}");
                    }
                }
            }
            return Err(e);
        }

        let mut actual = clk.rate();
        if source == ClockSource::Scmi && actual < target / 2 {
            warn!(
                "SCMI gap detected: requested {} MHz, got {} MHz, reverting",
                target / opp::MHZ,
                actual / opp::MHZ
            );
            if let Err(e) = clk.set_rate(old_freq) {
                warn!("failed to revert {} to {old_freq} Hz: {e}", clk.name());
            }
            actual = clk.rate();
        }

        let settle_volt = if actual == target {
            new_volt
        } else {
            opp::voltage_for_freq(actual)
        };
        if let Some(vdd) = &self.vdd {
            if settle_volt < vdd.voltage() {
                if let Err(e) = vdd.set_voltage(settle_volt, settle_volt + VOLTAGE_WINDOW_UV) {
                    warn!("failed to lower voltage to {settle_volt} uV: {e}");
                }
            }
        }

        let previous = st.current_freq;
        st.current_freq = actual;
        st.current_volt = self.vdd.as_ref().map_or(settle_volt, |r| r.voltage());
        if actual != previous || source != st.source {
            st.source = source;
            info!(
                "freq: {} -> {} MHz [{source}] (requested {} MHz)",
                previous / opp::MHZ,
                actual / opp::MHZ,
                target / opp::MHZ
            );
        }
        Ok(actual)
    }

    /// Run one governor step on a load sample. Does nothing while policy
    /// bypass is on. Returns the rate after the step.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`FrequencyCoordinator::set_target`].
    pub fn update(&self, busy: Duration, total: Duration) -> Result<u64> {
        let mut st = self.lock();
        if self.is_bypassed() {
            return Ok(st.current_freq);
        }
        let governor = *self.governor.lock().unwrap_or_else(PoisonError::into_inner);
        let next = governor.target(busy, total, st.current_freq, MIN_FREQ_HZ, self.scaling_max_hz());
        if next == st.current_freq {
            return Ok(next);
        }
        self.transition(&mut st, next)
    }

    /// Active governor.
    pub fn governor(&self) -> Governor {
        *self.governor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the governor.
    pub fn set_governor(&self, governor: Governor) {
        *self.governor.lock().unwrap_or_else(PoisonError::into_inner) = governor;
    }

    // ── Diagnostic surface ───────────────────────────────────────────────

    /// Clock that currently drives the core.
    pub fn clock_source(&self) -> ClockSource {
        self.lock().source
    }

    fn active_clock(&self, source: ClockSource) -> Option<&Arc<dyn Clock>> {
        match source {
            ClockSource::Scmi => self.scmi.as_ref().or(self.cru.as_ref()),
            ClockSource::Cru => self.cru.as_ref().or(self.scmi.as_ref()),
        }
    }

    /// Rate of the active clock as reported by the hardware.
    pub fn frequency(&self) -> u64 {
        let st = self.lock();
        self.active_clock(st.source).map_or(st.current_freq, |c| c.rate())
    }

    /// Write a rate straight to the active clock, bypassing the table and
    /// voltage sequencing. Still clamped to the ceiling.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Unavailable`] without a clock, or the clock's
    /// error.
    pub fn set_frequency_direct(&self, hz: u64) -> Result<u64> {
        let mut st = self.lock();
        let clk = self
            .active_clock(st.source)
            .ok_or_else(|| NpuError::unavailable("no clock available"))?;
        clk.set_rate(hz.min(self.max_freq_hz))?;
        st.current_freq = clk.rate();
        Ok(st.current_freq)
    }

    /// Supply voltage in microvolts.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Unavailable`] without a regulator.
    pub fn voltage(&self) -> Result<u32> {
        self.vdd
            .as_ref()
            .map(|r| r.voltage())
            .ok_or_else(|| NpuError::unavailable("no vdd regulator"))
    }

    /// Write a voltage straight to the regulator.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Unavailable`] without a regulator, or the
    /// regulator's error.
    pub fn set_voltage_direct(&self, microvolt: u32) -> Result<u32> {
        let mut st = self.lock();
        let vdd = self
            .vdd
            .as_ref()
            .ok_or_else(|| NpuError::unavailable("no vdd regulator"))?;
        vdd.set_voltage(microvolt, microvolt + VOLTAGE_WINDOW_UV)?;
        st.current_volt = vdd.voltage();
        Ok(st.current_volt)
    }

    /// Stop (or resume) governor-driven changes.
    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Release);
        info!("devfreq: policy bypass {}", if bypass { "on" } else { "off" });
    }

    /// True while governor-driven changes are suspended.
    pub fn is_bypassed(&self) -> bool {
        self.bypass.load(Ordering::Acquire)
    }
}

/// Background sampler that feeds power-controller load to the governor.
#[derive(Debug)]
pub struct DevfreqMonitor {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DevfreqMonitor {
    /// Start sampling every `polling`. `on_window` runs every
    /// `load_interval` to roll per-core load windows.
    pub fn spawn(
        coordinator: Arc<FrequencyCoordinator>,
        power: Arc<PowerController>,
        polling: Duration,
        load_interval: Duration,
        mut on_window: impl FnMut() + Send + 'static,
    ) -> Self {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("rknpu-devfreq".into())
            .spawn(move || {
                let mut window_start = Instant::now();
                loop {
                    match stop_rx.recv_timeout(polling) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let (busy, total) = power.sample_load();
                    if let Err(e) = coordinator.update(busy, total) {
                        warn!("devfreq: governor step failed: {e}");
                    }
                    if window_start.elapsed() >= load_interval {
                        on_window();
                        window_start = Instant::now();
                    }
                }
                debug!("devfreq: monitor stopped");
            });
        match handle {
            Ok(h) => Self {
                stop: Some(stop),
                handle: Some(h),
            },
            Err(e) => {
                warn!("devfreq: failed to start monitor: {e}");
                Self {
                    stop: None,
                    handle: None,
                }
            }
        }
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for DevfreqMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MHZ: u64 = opp::MHZ;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn ondemand_thresholds() {
        let g = Governor::default();
        let (min, max) = (100 * MHZ, 1000 * MHZ);
        // Above 70% → max.
        assert_eq!(g.target(ms(80), ms(100), 400 * MHZ, min, max), max);
        // Inside the 50..70 band → hold.
        assert_eq!(g.target(ms(60), ms(100), 400 * MHZ, min, max), 400 * MHZ);
        // 20% of 600 MHz / 60% → 200 MHz.
        assert_eq!(g.target(ms(20), ms(100), 600 * MHZ, min, max), 200 * MHZ);
        // Idle → floor.
        assert_eq!(g.target(ms(0), ms(100), 600 * MHZ, min, max), min);
    }

    #[test]
    fn ondemand_degenerate_inputs_go_to_max() {
        let g = Governor::default();
        assert_eq!(g.target(ms(0), Duration::ZERO, 400 * MHZ, 100, 900), 900);
        assert_eq!(g.target(ms(10), ms(100), 0, 100, 900), 900);
    }

    #[test]
    fn fixed_governors() {
        let (min, max) = (100 * MHZ, 1000 * MHZ);
        assert_eq!(Governor::Performance.target(ms(0), ms(1), 0, min, max), max);
        assert_eq!(Governor::Powersave.target(ms(1), ms(1), 0, min, max), min);
        assert_eq!(Governor::Userspace(2000 * MHZ).target(ms(0), ms(1), 0, min, max), max);
        assert_eq!(Governor::Userspace(300 * MHZ).target(ms(0), ms(1), 0, min, max), 300 * MHZ);
    }

    #[test]
    fn no_clock_is_unavailable() {
        let c = FrequencyCoordinator::new(None, None, None, 1000 * MHZ, Governor::Performance);
        assert!(matches!(c.set_target(500 * MHZ), Err(NpuError::Unavailable { .. })));
        assert_eq!(c.snapshot().current_freq, DEFAULT_FREQ_HZ);
    }
}
