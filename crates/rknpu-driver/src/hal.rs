//! Hardware abstraction seams.
//!
//! The driver core never touches a register, clock or regulator directly.
//! Everything it needs from the board is handed over in a [`Platform`],
//! built either from real MMIO windows ([`crate::mmio::MappedRegion`]) or
//! from the simulator ([`crate::sim`]).

use std::fmt;
use std::sync::Arc;

use rknpu_chip::SocConfig;

use crate::domain::AddressDomain;
use crate::error::{NpuError, Result};
use crate::fence::FenceContext;

/// 32-bit register window.
pub trait RegisterIo: Send + Sync {
    /// Read the register at `offset` bytes from the window base.
    fn read32(&self, offset: usize) -> u32;
    /// Write the register at `offset` bytes from the window base.
    fn write32(&self, offset: usize, value: u32);
}

/// Voltage regulator.
pub trait Regulator: Send + Sync {
    /// Enable the supply.
    ///
    /// # Errors
    ///
    /// Returns an error if the regulator refuses.
    fn enable(&self) -> Result<()>;
    /// Disable the supply.
    ///
    /// # Errors
    ///
    /// Returns an error if the regulator refuses.
    fn disable(&self) -> Result<()>;
    /// Request an output within `[min_uv, max_uv]`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range cannot be met.
    fn set_voltage(&self, min_uv: u32, max_uv: u32) -> Result<()>;
    /// Current output in microvolts.
    fn voltage(&self) -> u32;
}

/// Gateable, rate-settable clock.
pub trait Clock: Send + Sync {
    /// Clock name, for logs.
    fn name(&self) -> &str;
    /// Prepare and ungate.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock cannot be enabled.
    fn prepare_enable(&self) -> Result<()>;
    /// Gate and unprepare.
    fn disable_unprepare(&self);
    /// Current rate in Hz as reported by the hardware.
    fn rate(&self) -> u64;
    /// Request a new rate.
    ///
    /// # Errors
    ///
    /// Returns an error if the rate cannot be applied.
    fn set_rate(&self, hz: u64) -> Result<()>;
}

/// Power domain (genpd).
pub trait PowerDomain: Send + Sync {
    /// Domain name, for logs.
    fn name(&self) -> &str;
    /// Power the domain up.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain fails to come up.
    fn power_on(&self) -> Result<()>;
    /// Power the domain down.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain refuses.
    fn power_off(&self) -> Result<()>;
}

/// Reset line.
pub trait ResetLine: Send + Sync {
    /// Put the block into reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset controller refuses.
    fn assert_reset(&self) -> Result<()>;
    /// Release the block from reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the reset controller refuses.
    fn deassert_reset(&self) -> Result<()>;
}

/// Everything the driver core needs from the board.
pub struct Platform {
    /// SoC variant.
    pub soc: SocConfig,
    /// One register window per core, index = core number.
    pub cores: Vec<Arc<dyn RegisterIo>>,
    /// Bandwidth-priority window, when the SoC has one.
    pub bw_priority: Option<Arc<dyn RegisterIo>>,
    /// Core supply.
    pub vdd: Option<Arc<dyn Regulator>>,
    /// Memory supply.
    pub mem: Option<Arc<dyn Regulator>>,
    /// Bulk clocks; the first one is the divider (CRU) clock.
    pub clocks: Vec<Arc<dyn Clock>>,
    /// Firmware (SCMI) clock for rates above the CRU threshold.
    pub scmi_clock: Option<Arc<dyn Clock>>,
    /// Power domains, powered in order and released in reverse.
    pub power_domains: Vec<Arc<dyn PowerDomain>>,
    /// Reset lines.
    pub resets: Vec<Arc<dyn ResetLine>>,
    /// Address-translation service.
    pub address_domain: Arc<dyn AddressDomain>,
    /// Completion-signal context.
    pub fences: Arc<dyn FenceContext>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("soc", &self.soc.name)
            .field("cores", &self.cores.len())
            .field("bw_priority", &self.bw_priority.is_some())
            .field("vdd", &self.vdd.is_some())
            .field("mem", &self.mem.is_some())
            .field("clocks", &self.clocks.len())
            .field("scmi_clock", &self.scmi_clock.is_some())
            .field("power_domains", &self.power_domains.len())
            .field("resets", &self.resets.len())
            .finish_non_exhaustive()
    }
}

impl Platform {
    /// Check that the platform matches its SoC description.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] if the number of core windows
    /// does not match the SoC's core count.
    pub fn validate(&self) -> Result<()> {
        if self.cores.len() != self.soc.core_count {
            return Err(NpuError::invalid_argument(format!(
                "{} expects {} core windows, platform has {}",
                self.soc.name,
                self.soc.core_count,
                self.cores.len()
            )));
        }
        Ok(())
    }

    /// Replay the SoC register init sequence on core 0.
    pub fn replay_state_init(&self) {
        replay_state_init(&self.soc, &self.cores);
    }
}

pub(crate) fn replay_state_init(soc: &SocConfig, cores: &[Arc<dyn RegisterIo>]) {
    let Some(core0) = cores.first() else {
        return;
    };
    for &(offset, value) in soc.state_init {
        core0.write32(offset, value);
    }
}
