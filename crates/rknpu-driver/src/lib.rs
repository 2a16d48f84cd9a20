//! Driver core for the Rockchip RKNPU (RK3568 / RK3588).
//!
//! This crate schedules register-command task batches onto the NPU cores
//! and coordinates everything around them: reference-counted power with a
//! debounced power-off, frequency and voltage scaling, soft reset and
//! recovery of hung work, address domains and completion fences.
//!
//! The board is described by a [`Platform`] of trait objects (register
//! windows, regulators, clocks, power domains, reset lines). Real hardware
//! uses [`mmio::MappedRegion`]; tests and the CLI use [`sim::SimulatedNpu`].
//!
//! # Layering
//!
//! ```text
//! NpuDevice ── submit / action
//!   ├── JobScheduler     core FIFOs, commit, irq completion, wait, abort
//!   │     └── recovery   soft reset, timed-out core sweep
//!   ├── PowerController  refcount, rails sequence, deferred power-off
//!   └── FrequencyCoordinator + DevfreqMonitor   DVFS, governor thread
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rknpu_driver::prelude::*;
//!
//! # fn main() -> rknpu_driver::Result<()> {
//! let (npu, _sim) = NpuDevice::simulated(SocConfig::RK3588, DriverConfig::default(), SimOptions::default())?;
//! let tasks = vec![Task::default(); 8];
//! let buffer = Arc::new(HostBuffer::from_tasks(&tasks, 0x1000_0000));
//! let out = npu.submit(SubmitArgs::pc(0, 8).with_task_buffer(buffer))?;
//! println!("{} tasks on mask {:#x}", out.task_counter, out.core_mask);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod action;
pub mod buffer;
pub mod config;
pub mod core_state;
pub mod devfreq;
pub mod device;
pub mod domain;
mod error;
pub mod fence;
pub mod hal;
pub mod job;
pub mod mmio;
pub mod power;
mod recovery;
pub mod scheduler;
pub mod sim;

pub use action::Action;
pub use buffer::{BufferObject, HostBuffer};
pub use config::DriverConfig;
pub use core_state::CoreSnapshot;
pub use devfreq::{ClockSource, DevfreqMonitor, FrequencyCoordinator, FrequencyState, Governor};
pub use device::{IrqEvent, NpuDevice};
pub use domain::{AddressDomain, DirectMapping};
pub use error::{NpuError, Result};
pub use fence::{Fence, FenceContext, SyncFence, SyncFenceContext};
pub use hal::{Clock, Platform, PowerDomain, RegisterIo, Regulator, ResetLine};
pub use job::{JobFlags, SubcoreTask, SubmitArgs, SubmitOutcome, DEFAULT_TIMEOUT};
pub use power::{PowerController, PowerRef};
pub use scheduler::JobScheduler;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::buffer::{BufferObject, HostBuffer};
    pub use crate::config::DriverConfig;
    pub use crate::device::NpuDevice;
    pub use crate::error::{NpuError, Result};
    pub use crate::job::{JobFlags, SubmitArgs, SubmitOutcome};
    pub use crate::sim::{SimOptions, SimulatedNpu};
    pub use rknpu_chip::soc::core_mask;
    pub use rknpu_chip::{SocConfig, Task};
}
