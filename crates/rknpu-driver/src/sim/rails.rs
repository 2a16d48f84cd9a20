//! Simulated supplies, clocks, power domains, reset lines and address
//! translation. Every state change is recorded in the shared event log.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rknpu_chip::opp::MIN_FREQ_HZ;

use super::hw::SimCore;
use super::{EventLog, SimEvent};
use crate::domain::AddressDomain;
use crate::error::{NpuError, Result};
use crate::hal::{Clock, PowerDomain, Regulator, ResetLine};

/// Regulator that records every change.
#[derive(Debug)]
pub struct SimRegulator {
    name: &'static str,
    enabled: AtomicBool,
    microvolt: AtomicU32,
    log: EventLog,
}

impl SimRegulator {
    pub(super) fn new(name: &'static str, microvolt: u32, log: EventLog) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            microvolt: AtomicU32::new(microvolt),
            log,
        }
    }

    /// True while enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Regulator for SimRegulator {
    fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::Release);
        self.log.push(SimEvent::RegulatorOn(self.name));
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        self.enabled.store(false, Ordering::Release);
        self.log.push(SimEvent::RegulatorOff(self.name));
        Ok(())
    }

    fn set_voltage(&self, min_uv: u32, max_uv: u32) -> Result<()> {
        if min_uv > max_uv {
            return Err(NpuError::invalid_argument(format!(
                "{}: empty voltage window {min_uv}..{max_uv}",
                self.name
            )));
        }
        self.microvolt.store(min_uv, Ordering::Release);
        self.log.push(SimEvent::Voltage {
            name: self.name,
            microvolt: min_uv,
        });
        Ok(())
    }

    fn voltage(&self) -> u32 {
        self.microvolt.load(Ordering::Acquire)
    }
}

/// Clock that records every change. A firmware clock can be given a gap:
/// requests above it come back at the lowest table rate. Any clock can be
/// told to refuse rate changes.
#[derive(Debug)]
pub struct SimClock {
    name: &'static str,
    enabled: AtomicBool,
    rate: AtomicU64,
    gap_above: Option<u64>,
    refuse_rate: AtomicBool,
    refuse_enable: bool,
    log: EventLog,
}

impl SimClock {
    pub(super) fn new(
        name: &'static str,
        rate: u64,
        gap_above: Option<u64>,
        refuse_enable: bool,
        log: EventLog,
    ) -> Self {
        Self {
            name,
            enabled: AtomicBool::new(false),
            rate: AtomicU64::new(rate),
            gap_above,
            refuse_rate: AtomicBool::new(false),
            refuse_enable,
            log,
        }
    }

    /// True while ungated.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Make every following `set_rate` fail.
    pub fn refuse_rate_changes(&self, refuse: bool) {
        self.refuse_rate.store(refuse, Ordering::Release);
    }
}

impl Clock for SimClock {
    fn name(&self) -> &str {
        self.name
    }

    fn prepare_enable(&self) -> Result<()> {
        if self.refuse_enable {
            return Err(NpuError::unavailable(format!("{}: enable refused", self.name)));
        }
        self.enabled.store(true, Ordering::Release);
        self.log.push(SimEvent::ClockOn(self.name));
        Ok(())
    }

    fn disable_unprepare(&self) {
        self.enabled.store(false, Ordering::Release);
        self.log.push(SimEvent::ClockOff(self.name));
    }

    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Acquire)
    }

    fn set_rate(&self, hz: u64) -> Result<()> {
        if self.refuse_rate.load(Ordering::Acquire) {
            return Err(NpuError::hardware_fault(format!("{}: rate change refused", self.name)));
        }
        let applied = match self.gap_above {
            Some(g) if hz > g => MIN_FREQ_HZ,
            _ => hz,
        };
        self.rate.store(applied, Ordering::Release);
        self.log.push(SimEvent::Rate {
            name: self.name,
            hz: applied,
        });
        Ok(())
    }
}

/// Power domain that records every change.
#[derive(Debug)]
pub struct SimPowerDomain {
    name: String,
    on: AtomicBool,
    refuse: bool,
    log: EventLog,
}

impl SimPowerDomain {
    pub(super) fn new(name: String, refuse: bool, log: EventLog) -> Self {
        Self {
            name,
            on: AtomicBool::new(false),
            refuse,
            log,
        }
    }

    /// True while powered.
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }
}

impl PowerDomain for SimPowerDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn power_on(&self) -> Result<()> {
        if self.refuse {
            return Err(NpuError::hardware_fault(format!("{}: failed to power on", self.name)));
        }
        self.on.store(true, Ordering::Release);
        self.log.push(SimEvent::DomainOn(self.name.clone()));
        Ok(())
    }

    fn power_off(&self) -> Result<()> {
        self.on.store(false, Ordering::Release);
        self.log.push(SimEvent::DomainOff(self.name.clone()));
        Ok(())
    }
}

/// Reset line. Asserting it invalidates every in-flight completion.
pub struct SimResetLine {
    line: usize,
    cores: Vec<Arc<SimCore>>,
    generation: Arc<AtomicU64>,
    refuse: bool,
    log: EventLog,
}

impl std::fmt::Debug for SimResetLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimResetLine")
            .field("line", &self.line)
            .finish_non_exhaustive()
    }
}

impl SimResetLine {
    pub(super) fn new(
        line: usize,
        cores: Vec<Arc<SimCore>>,
        generation: Arc<AtomicU64>,
        refuse: bool,
        log: EventLog,
    ) -> Self {
        Self {
            line,
            cores,
            generation,
            refuse,
            log,
        }
    }
}

impl ResetLine for SimResetLine {
    fn assert_reset(&self) -> Result<()> {
        if self.refuse {
            return Err(NpuError::hardware_fault(format!("reset line {} stuck", self.line)));
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.cores.iter().for_each(|c| c.reset());
        self.log.push(SimEvent::ResetAssert(self.line));
        Ok(())
    }

    fn deassert_reset(&self) -> Result<()> {
        self.log.push(SimEvent::ResetDeassert(self.line));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Attachment {
    current: i32,
    refs: u32,
}

/// Reference-counted address-translation service. Switching to another
/// domain while the current one has holders fails.
#[derive(Debug)]
pub struct SimAddressDomain {
    enabled: bool,
    reject: Option<i32>,
    stuck: AtomicBool,
    state: Mutex<Attachment>,
    log: EventLog,
}

impl SimAddressDomain {
    pub(super) fn new(enabled: bool, reject: Option<i32>, log: EventLog) -> Self {
        Self {
            enabled,
            reject,
            stuck: AtomicBool::new(false),
            state: Mutex::new(Attachment::default()),
            log,
        }
    }

    /// Keep reporting active regardless of holders.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::Release);
    }

    /// Current holder count.
    pub fn holders(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).refs
    }
}

impl AddressDomain for SimAddressDomain {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn is_active(&self) -> bool {
        self.stuck.load(Ordering::Acquire) || self.holders() > 0
    }

    fn activate(&self, domain_id: i32) -> Result<()> {
        if self.reject == Some(domain_id) {
            return Err(NpuError::domain(domain_id, "domain not mapped"));
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.refs > 0 && st.current != domain_id {
            return Err(NpuError::domain(
                domain_id,
                format!("domain {} still in use", st.current),
            ));
        }
        st.current = domain_id;
        st.refs += 1;
        self.log.push(SimEvent::DomainActivate(domain_id));
        Ok(())
    }

    fn release(&self, domain_id: i32) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.refs = st.refs.saturating_sub(1);
        self.log.push(SimEvent::DomainRelease(domain_id));
    }

    fn translate(&self, addr: u64) -> Option<u64> {
        self.enabled.then_some(addr)
    }

    fn current_domain(&self) -> i32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current
    }

    fn reattach(&self) -> Result<()> {
        self.log.push(SimEvent::Reattach);
        Ok(())
    }
}
