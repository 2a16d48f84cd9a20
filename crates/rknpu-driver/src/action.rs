//! Control actions: version queries, frequency and voltage, reset,
//! bandwidth-priority registers, read/write amount counters, address
//! domains and explicit power holds.
//!
//! | Action | Needs power | Returns |
//! |--------|-------------|---------|
//! | `HwVersion` | yes | `VERSION + (VERSION_NUM & 0xffff)` |
//! | `DrvVersion` | no | `major * 10000 + minor * 100 + patch` |
//! | `GetFreq` / `SetFreq` | no | Hz |
//! | `GetVolt` / `SetVolt` | no | µV |
//! | `Reset` | yes | 0 |
//! | `Bw*` | yes | register value |
//! | amount counters | yes | bytes, scaled |
//! | `IommuEnabled` | no | 0 / 1 |
//! | `GetDomainId` / `SetDomainId` | no | domain id |
//! | `PowerOn` / `PowerOff` | - | 0 |

use std::sync::PoisonError;

use rknpu_chip::regs::{self, AmountRegs};
use tracing::{debug, warn};

use crate::device::NpuDevice;
use crate::error::{NpuError, Result};

/// Version reported by [`Action::DrvVersion`].
pub const DRIVER_VERSION: (u32, u32, u32) = (0, 9, 8);

/// One control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hardware version of core 0.
    HwVersion,
    /// Driver version code.
    DrvVersion,
    /// Current rate of the active clock.
    GetFreq,
    /// Write a rate straight to the active clock.
    SetFreq(u64),
    /// Current supply voltage.
    GetVolt,
    /// Write a supply voltage straight to the regulator.
    SetVolt(u32),
    /// Soft-reset every core.
    Reset,
    /// Read the bandwidth-priority register.
    GetBwPriority,
    /// Write the bandwidth-priority register.
    SetBwPriority(u32),
    /// Read the bandwidth-expect register.
    GetBwExpect,
    /// Write the bandwidth-expect register.
    SetBwExpect(u32),
    /// Read the bandwidth time-window register.
    GetBwTw,
    /// Write the bandwidth time-window register.
    SetBwTw(u32),
    /// Zero every read/write amount counter.
    ClearTotalRwAmount,
    /// Data bytes written.
    GetDtWrAmount,
    /// Data bytes read.
    GetDtRdAmount,
    /// Weight bytes read.
    GetWtRdAmount,
    /// Sum of the three amount counters.
    GetTotalRwAmount,
    /// 1 if address translation is enabled.
    IommuEnabled,
    /// Current address domain.
    GetDomainId,
    /// Switch the address domain. Fails while another domain is held.
    SetDomainId(i32),
    /// Take a power reference held until [`Action::PowerOff`].
    PowerOn,
    /// Drop one reference taken by [`Action::PowerOn`].
    PowerOff,
}

impl Action {
    /// True if the action touches registers and must run powered.
    pub const fn needs_power(self) -> bool {
        matches!(
            self,
            Self::HwVersion
                | Self::Reset
                | Self::GetBwPriority
                | Self::SetBwPriority(_)
                | Self::GetBwExpect
                | Self::SetBwExpect(_)
                | Self::GetBwTw
                | Self::SetBwTw(_)
                | Self::ClearTotalRwAmount
                | Self::GetDtWrAmount
                | Self::GetDtRdAmount
                | Self::GetWtRdAmount
                | Self::GetTotalRwAmount
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Amount {
    DtWr,
    DtRd,
    WtRd,
}

impl Amount {
    const fn offset(self, regs: &AmountRegs) -> usize {
        match self {
            Self::DtWr => regs.dt_wr,
            Self::DtRd => regs.dt_rd,
            Self::WtRd => regs.wt_rd,
        }
    }
}

/// Driver version as one number.
pub const fn driver_version_code() -> u64 {
    let (major, minor, patch) = DRIVER_VERSION;
    (major * 10_000 + minor * 100 + patch) as u64
}

impl NpuDevice {
    /// Run one control action.
    ///
    /// # Errors
    ///
    /// - [`NpuError::Unavailable`] if the SoC lacks the register window,
    ///   clock or regulator the action needs, or on `PowerOff` without a
    ///   matching `PowerOn`.
    /// - [`NpuError::DomainError`] if a domain switch is refused.
    /// - Power-on and reset errors.
    pub fn action(&self, action: Action) -> Result<u64> {
        debug!("action {action:?}");
        let _power = if action.needs_power() {
            Some(self.power.acquire()?)
        } else {
            None
        };

        match action {
            Action::HwVersion => {
                let core0 = self.core0()?;
                let version = core0.read32(regs::VERSION);
                let num = core0.read32(regs::VERSION_NUM) & 0xffff;
                Ok(u64::from(version) + u64::from(num))
            }
            Action::DrvVersion => Ok(driver_version_code()),
            Action::GetFreq => Ok(self.frequency.frequency()),
            Action::SetFreq(hz) => self.frequency.set_frequency_direct(hz),
            Action::GetVolt => self.frequency.voltage().map(u64::from),
            Action::SetVolt(uv) => self.frequency.set_voltage_direct(uv).map(u64::from),
            Action::Reset => {
                self.scheduler.soft_reset()?;
                Ok(0)
            }
            Action::GetBwPriority => self.bw_read(regs::BW_PRIORITY),
            Action::SetBwPriority(v) => self.bw_write(regs::BW_PRIORITY, v),
            Action::GetBwExpect => self.bw_read(regs::BW_EXPECT),
            Action::SetBwExpect(v) => self.bw_write(regs::BW_EXPECT, v),
            Action::GetBwTw => self.bw_read(regs::BW_TW),
            Action::SetBwTw(v) => self.bw_write(regs::BW_TW, v),
            Action::ClearTotalRwAmount => {
                self.clear_rw_amount()?;
                Ok(0)
            }
            Action::GetDtWrAmount => self.rw_amount(Amount::DtWr),
            Action::GetDtRdAmount => self.rw_amount(Amount::DtRd),
            Action::GetWtRdAmount => self.rw_amount(Amount::WtRd),
            Action::GetTotalRwAmount => {
                let mut total = 0;
                for a in [Amount::DtWr, Amount::DtRd, Amount::WtRd] {
                    total += self.rw_amount(a)?;
                }
                Ok(total)
            }
            Action::IommuEnabled => Ok(u64::from(self.domain.is_enabled())),
            Action::GetDomainId => Ok(self.domain.current_domain() as u64),
            Action::SetDomainId(id) => {
                self.domain.activate(id)?;
                self.domain.release(id);
                Ok(id as u64)
            }
            Action::PowerOn => {
                let held = self.power.acquire()?;
                self.held_power
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(held);
                Ok(0)
            }
            Action::PowerOff => {
                let held = self
                    .held_power
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .pop()
                    .ok_or_else(|| NpuError::unavailable("no explicit power reference held"))?;
                drop(held);
                Ok(0)
            }
        }
    }

    fn core0(&self) -> Result<&dyn crate::hal::RegisterIo> {
        self.cores
            .first()
            .map(AsRef::as_ref)
            .ok_or_else(|| NpuError::unavailable("no core register window"))
    }

    fn bw_read(&self, offset: usize) -> Result<u64> {
        let window = self
            .bw_priority
            .as_ref()
            .ok_or_else(|| NpuError::unavailable("no bandwidth-priority window"))?;
        Ok(u64::from(window.read32(offset)))
    }

    fn bw_write(&self, offset: usize, value: u32) -> Result<u64> {
        let window = self
            .bw_priority
            .as_ref()
            .ok_or_else(|| NpuError::unavailable("no bandwidth-priority window"))?;
        window.write32(offset, value);
        Ok(0)
    }

    fn clear_rw_amount(&self) -> Result<()> {
        let Some(top) = self.soc.amount_top else {
            warn!("{}: no read/write amount counters", self.soc.name);
            return Ok(());
        };
        let core0 = self.core0()?;

        let _st = self.scheduler.lock();
        let saved = self.soc.pc_dma_ctrl.then(|| {
            let addr = core0.read32(regs::PC_DATA_ADDR);
            core0.write32(regs::PC_DATA_ADDR, regs::PC_DATA_ADDR_SLAVE_MODE);
            addr
        });

        core0.write32(top.clr_all, regs::AMOUNT_CLEAR_ASSERT);
        core0.write32(top.clr_all, regs::AMOUNT_CLEAR_RELEASE);
        if let Some(core) = self.soc.amount_core {
            core0.write32(core.clr_all, regs::AMOUNT_CLEAR_ASSERT);
            core0.write32(core.clr_all, regs::AMOUNT_CLEAR_RELEASE);
        }

        if let Some(addr) = saved {
            core0.write32(regs::PC_DATA_ADDR, addr);
        }
        Ok(())
    }

    fn rw_amount(&self, which: Amount) -> Result<u64> {
        let Some(top) = self.soc.amount_top else {
            warn!("{}: no read/write amount counters", self.soc.name);
            return Ok(0);
        };
        let core0 = self.core0()?;
        let mut raw = u64::from(core0.read32(which.offset(&top)));
        if let Some(core) = self.soc.amount_core {
            raw += u64::from(core0.read32(which.offset(&core)));
        }
        Ok(raw * u64::from(self.soc.pc_data_amount_scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_code() {
        assert_eq!(driver_version_code(), 908);
    }

    #[test]
    fn power_classification() {
        assert!(Action::HwVersion.needs_power());
        assert!(Action::SetBwTw(1).needs_power());
        assert!(Action::GetTotalRwAmount.needs_power());
        assert!(!Action::GetFreq.needs_power());
        assert!(!Action::SetDomainId(1).needs_power());
        assert!(!Action::PowerOn.needs_power());
    }
}
