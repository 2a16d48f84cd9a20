//! Simulated NPU for CI and the command-line tool.
//!
//! [`SimulatedNpu`] builds a complete [`Platform`]: one register file per
//! core, a `vdd` and `mem` regulator, a divider clock plus an optional
//! firmware clock, power domains, one reset line, an address-translation
//! service and a fence context. Interrupts arrive on the channel returned
//! by [`SimulatedNpu::take_irq_receiver`].
//!
//! ```text
//!  write PC_OP_EN=1 ──► sim core worker ──(latency)──► INT_STATUS = INT_MASK
//!                                                      task counter += len
//!                                                      IrqEvent ──► channel
//! ```

mod hw;
mod rails;

use std::sync::atomic::AtomicU64;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rknpu_chip::opp::{self, DEFAULT_FREQ_HZ};
use rknpu_chip::SocConfig;

pub use self::hw::{
    Registers, SimCore, DT_RD_PER_TASK, DT_WR_PER_TASK, SIM_VERSION, SIM_VERSION_NUM, SPURIOUS_STATUS,
    WT_RD_PER_TASK,
};
pub use self::rails::{SimAddressDomain, SimClock, SimPowerDomain, SimRegulator, SimResetLine};
use crate::device::IrqEvent;
use crate::domain::AddressDomain;
use crate::fence::{FenceContext, SyncFenceContext};
use crate::hal::{Clock, Platform, PowerDomain, RegisterIo, Regulator, ResetLine};

/// Something the simulated hardware observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// Regulator enabled.
    RegulatorOn(&'static str),
    /// Regulator disabled.
    RegulatorOff(&'static str),
    /// Regulator output changed.
    Voltage {
        /// Regulator name.
        name: &'static str,
        /// New output.
        microvolt: u32,
    },
    /// Clock ungated.
    ClockOn(&'static str),
    /// Clock gated.
    ClockOff(&'static str),
    /// Clock rate changed.
    Rate {
        /// Clock name.
        name: &'static str,
        /// Rate actually applied.
        hz: u64,
    },
    /// Power domain up.
    DomainOn(String),
    /// Power domain down.
    DomainOff(String),
    /// Reset line asserted.
    ResetAssert(usize),
    /// Reset line released.
    ResetDeassert(usize),
    /// Address domain activated.
    DomainActivate(i32),
    /// Address domain released.
    DomainRelease(i32),
    /// Address translation reattached after a reset.
    Reattach,
    /// A chunk was started.
    Commit {
        /// Core index.
        core: usize,
        /// Tasks in the chunk.
        tasks: u32,
        /// `PC_DATA_ADDR` at start.
        data_addr: u32,
    },
    /// A chunk completed and raised its interrupt.
    Irq {
        /// Core index.
        core: usize,
    },
}

/// Shared, append-only event log.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<SimEvent>>>);

impl EventLog {
    /// Append.
    pub fn push(&self, event: SimEvent) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }

    /// Copy of every event so far.
    pub fn snapshot(&self) -> Vec<SimEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Forget everything so far.
    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of events matching `pred`.
    pub fn count(&self, pred: impl Fn(&SimEvent) -> bool) -> usize {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

/// Knobs for the simulated hardware.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Time from `PC_OP_EN` to the interrupt. Default 1 ms.
    pub latency: Duration,
    /// Cores never complete. Default `false`.
    pub hang: bool,
    /// Number of power domains. Default 1.
    pub power_domains: usize,
    /// Address translation enabled. Default `true`.
    pub translation: bool,
    /// Provide a firmware (SCMI) clock. Default `true`.
    pub scmi_clock: bool,
    /// Requests to the firmware clock above this rate land at the lowest
    /// table rate instead. Default none.
    pub scmi_gap_above: Option<u64>,
    /// Domain id the translation service refuses. Default none.
    pub reject_domain: Option<i32>,
    /// Power domains refuse to come up. Default `false`.
    pub fail_power_domain: bool,
    /// The bulk clock refuses to ungate. Default `false`.
    pub fail_clock: bool,
    /// Reset lines refuse to assert. Default `false`.
    pub fail_reset: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(1),
            hang: false,
            power_domains: 1,
            translation: true,
            scmi_clock: true,
            scmi_gap_above: None,
            reject_domain: None,
            fail_power_domain: false,
            fail_clock: false,
            fail_reset: false,
        }
    }
}

/// A complete simulated board.
#[derive(Debug)]
pub struct SimulatedNpu {
    soc: SocConfig,
    cores: Vec<Arc<SimCore>>,
    bw: Option<Arc<BwWindow>>,
    vdd: Arc<SimRegulator>,
    mem: Arc<SimRegulator>,
    cru: Arc<SimClock>,
    bus: Arc<SimClock>,
    scmi: Option<Arc<SimClock>>,
    domains: Vec<Arc<SimPowerDomain>>,
    reset: Arc<SimResetLine>,
    translation: Arc<SimAddressDomain>,
    fences: Arc<SyncFenceContext>,
    log: EventLog,
    irq_rx: Mutex<Option<Receiver<IrqEvent>>>,
}

/// Bandwidth-priority register window.
#[derive(Debug, Default)]
pub struct BwWindow(Registers);

impl RegisterIo for BwWindow {
    fn read32(&self, offset: usize) -> u32 {
        self.0.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.0.set(offset, value);
    }
}

impl SimulatedNpu {
    /// Build a board for `soc`.
    pub fn new(soc: SocConfig, options: SimOptions) -> Self {
        let log = EventLog::default();
        let (irq_tx, irq_rx) = mpsc::channel();
        let generation = Arc::new(AtomicU64::new(0));

        let top = Arc::new(Registers::default());
        let cores: Vec<Arc<SimCore>> = (0..soc.core_count)
            .map(|index| {
                let regs = if index == 0 {
                    Arc::clone(&top)
                } else {
                    Arc::new(Registers::default())
                };
                let core = SimCore::spawn(hw::Shared {
                    index,
                    soc,
                    regs,
                    top: Arc::clone(&top),
                    generation: Arc::clone(&generation),
                    latency: options.latency,
                    hang: options.hang.into(),
                    commits: 0.into(),
                    log: log.clone(),
                    irq: irq_tx.clone(),
                });
                Arc::new(core)
            })
            .collect();

        let start_volt = opp::voltage_for_freq(DEFAULT_FREQ_HZ);
        let domains = (0..options.power_domains)
            .map(|i| {
                Arc::new(SimPowerDomain::new(
                    format!("npu{i}"),
                    options.fail_power_domain,
                    log.clone(),
                ))
            })
            .collect();

        Self {
            soc,
            bw: soc.bw_priority_addr.map(|_| Arc::new(BwWindow::default())),
            vdd: Arc::new(SimRegulator::new("vdd", start_volt, log.clone())),
            mem: Arc::new(SimRegulator::new("mem", start_volt, log.clone())),
            cru: Arc::new(SimClock::new("clk_npu", DEFAULT_FREQ_HZ, None, false, log.clone())),
            bus: Arc::new(SimClock::new("aclk", DEFAULT_FREQ_HZ, None, options.fail_clock, log.clone())),
            scmi: options.scmi_clock.then(|| {
                Arc::new(SimClock::new("scmi_clk_npu", DEFAULT_FREQ_HZ, options.scmi_gap_above, false, log.clone()))
            }),
            domains,
            reset: Arc::new(SimResetLine::new(
                0,
                cores.clone(),
                generation,
                options.fail_reset,
                log.clone(),
            )),
            translation: Arc::new(SimAddressDomain::new(
                options.translation,
                options.reject_domain,
                log.clone(),
            )),
            fences: Arc::new(SyncFenceContext::new()),
            cores,
            log,
            irq_rx: Mutex::new(Some(irq_rx)),
        }
    }

    /// Platform description wired to this board.
    pub fn platform(&self) -> Platform {
        Platform {
            soc: self.soc,
            cores: self
                .cores
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn RegisterIo>)
                .collect(),
            bw_priority: self.bw.as_ref().map(|b| Arc::clone(b) as Arc<dyn RegisterIo>),
            vdd: Some(Arc::clone(&self.vdd) as Arc<dyn Regulator>),
            mem: Some(Arc::clone(&self.mem) as Arc<dyn Regulator>),
            clocks: vec![
                Arc::clone(&self.cru) as Arc<dyn Clock>,
                Arc::clone(&self.bus) as Arc<dyn Clock>,
            ],
            scmi_clock: self.scmi.as_ref().map(|c| Arc::clone(c) as Arc<dyn Clock>),
            power_domains: self
                .domains
                .iter()
                .map(|d| Arc::clone(d) as Arc<dyn PowerDomain>)
                .collect(),
            resets: vec![Arc::clone(&self.reset) as Arc<dyn ResetLine>],
            address_domain: Arc::clone(&self.translation) as Arc<dyn AddressDomain>,
            fences: Arc::clone(&self.fences) as Arc<dyn FenceContext>,
        }
    }

    /// Interrupt channel. Returns `None` after the first call.
    pub fn take_irq_receiver(&self) -> Option<Receiver<IrqEvent>> {
        self.irq_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// SoC being simulated.
    pub const fn soc(&self) -> &SocConfig {
        &self.soc
    }

    /// Core `index`.
    pub fn core(&self, index: usize) -> Option<&SimCore> {
        self.cores.get(index).map(Arc::as_ref)
    }

    /// Core supply.
    pub fn vdd(&self) -> &SimRegulator {
        &self.vdd
    }

    /// Memory supply.
    pub fn mem(&self) -> &SimRegulator {
        &self.mem
    }

    /// Divider clock.
    pub fn cru_clock(&self) -> &SimClock {
        &self.cru
    }

    /// Firmware clock, if simulated.
    pub fn scmi_clock(&self) -> Option<&SimClock> {
        self.scmi.as_deref()
    }

    /// Power domains.
    pub fn power_domains(&self) -> &[Arc<SimPowerDomain>] {
        &self.domains
    }

    /// Address-translation service.
    pub fn address_domain(&self) -> &SimAddressDomain {
        &self.translation
    }

    /// Bandwidth window, if the SoC has one.
    pub fn bw_window(&self) -> Option<&BwWindow> {
        self.bw.as_deref()
    }

    /// Event log.
    pub const fn events(&self) -> &EventLog {
        &self.log
    }

    /// Number of times the reset line was pulsed.
    pub fn reset_pulses(&self) -> usize {
        self.log.count(|e| matches!(e, SimEvent::ResetAssert(0)))
    }

    /// Total chunks started on every core.
    pub fn total_commits(&self) -> usize {
        self.cores.iter().map(|c| c.commits()).sum()
    }

    /// True while every rail is up.
    pub fn is_powered(&self) -> bool {
        self.vdd.is_enabled()
            && self.mem.is_enabled()
            && self.cru.is_enabled()
            && self.domains.iter().all(|d| d.is_on())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rknpu_chip::regs;
    use std::time::Duration;

    #[test]
    fn chunk_completes_with_programmed_mask() {
        let sim = SimulatedNpu::new(SocConfig::RK3568, SimOptions::default());
        let rx = sim.take_irq_receiver().unwrap();
        let c0 = sim.core(0).unwrap();
        c0.write32(regs::INT_MASK, 0x300);
        c0.write32(regs::PC_TASK_CONTROL, 3);
        c0.write32(regs::PC_OP_EN, 1);

        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.core, 0);
        assert_eq!(c0.read32(regs::INT_STATUS), 0x300);
        assert_eq!(c0.read32(0x3c), 3);

        c0.write32(regs::INT_CLEAR, regs::INT_CLEAR_ALL);
        assert_eq!(c0.read32(regs::INT_STATUS), 0);
    }

    #[test]
    fn reset_drops_in_flight_completion() {
        let sim = SimulatedNpu::new(
            SocConfig::RK3568,
            SimOptions {
                latency: Duration::from_millis(50),
                ..SimOptions::default()
            },
        );
        let rx = sim.take_irq_receiver().unwrap();
        let c0 = sim.core(0).unwrap();
        c0.write32(regs::INT_MASK, 0x300);
        c0.write32(regs::PC_TASK_CONTROL, 1);
        c0.write32(regs::PC_OP_EN, 1);
        sim.reset.assert_reset().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(sim.reset_pulses(), 1);
    }

    #[test]
    fn firmware_clock_gap() {
        let sim = SimulatedNpu::new(
            SocConfig::RK3588,
            SimOptions {
                scmi_gap_above: Some(800 * opp::MHZ),
                ..SimOptions::default()
            },
        );
        let scmi = sim.scmi_clock().unwrap();
        scmi.set_rate(900 * opp::MHZ).unwrap();
        assert_eq!(scmi.rate(), opp::MIN_FREQ_HZ);
        scmi.set_rate(700 * opp::MHZ).unwrap();
        assert_eq!(scmi.rate(), 700 * opp::MHZ);
    }
}
