//! Simulated core register file.
//!
//! Writing 1 to `PC_OP_EN` starts the programmed chunk. After the
//! configured latency a worker thread sets `INT_STATUS` to the programmed
//! `INT_MASK`, advances the task counter, bumps the amount counters and
//! raises an interrupt event. A reset drops every completion still in
//! flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rknpu_chip::regs::{self, AmountRegs};
use rknpu_chip::SocConfig;
use tracing::trace;

use super::{EventLog, SimEvent};
use crate::device::IrqEvent;
use crate::hal::RegisterIo;

/// Value the simulated `VERSION` register reads back.
pub const SIM_VERSION: u32 = 0x4b9b_0000;
/// Value the simulated `VERSION_NUM` register reads back.
pub const SIM_VERSION_NUM: u32 = 0x0001_0042;

/// Raw status raised by [`SimCore::raise_spurious`]: outside every
/// interrupt group.
pub const SPURIOUS_STATUS: u32 = 1 << 16;

/// Data-write bytes a completed task adds to the amount counters.
pub const DT_WR_PER_TASK: u32 = 0x40;
/// Data-read bytes a completed task adds.
pub const DT_RD_PER_TASK: u32 = 0x80;
/// Weight-read bytes a completed task adds.
pub const WT_RD_PER_TASK: u32 = 0x20;

/// Sparse 32-bit register map.
#[derive(Debug, Default)]
pub struct Registers {
    map: Mutex<HashMap<usize, u32>>,
}

impl Registers {
    /// Read; unwritten registers read 0.
    pub fn get(&self, offset: usize) -> u32 {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&offset).copied().unwrap_or(0)
    }

    /// Write.
    pub fn set(&self, offset: usize, value: u32) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        map.insert(offset, value);
    }

    /// Read-modify-write.
    pub fn update(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let v = map.entry(offset).or_insert(0);
        *v = f(*v);
    }

    fn add_amounts(&self, a: &AmountRegs, tasks: u32) {
        self.update(a.dt_wr, |v| v.wrapping_add(tasks * DT_WR_PER_TASK));
        self.update(a.dt_rd, |v| v.wrapping_add(tasks * DT_RD_PER_TASK));
        self.update(a.wt_rd, |v| v.wrapping_add(tasks * WT_RD_PER_TASK));
    }

    fn clear_amounts(&self, a: &AmountRegs) {
        self.set(a.dt_wr, 0);
        self.set(a.dt_rd, 0);
        self.set(a.wt_rd, 0);
    }
}

struct Start {
    generation: u64,
    len: u32,
    mask: u32,
}

pub(super) struct Shared {
    pub(super) index: usize,
    pub(super) soc: SocConfig,
    pub(super) regs: Arc<Registers>,
    pub(super) top: Arc<Registers>,
    pub(super) generation: Arc<AtomicU64>,
    pub(super) latency: Duration,
    pub(super) hang: AtomicBool,
    pub(super) commits: AtomicUsize,
    pub(super) log: EventLog,
    pub(super) irq: Sender<IrqEvent>,
}

impl Shared {
    fn complete(&self, start: &Start) {
        if self.generation.load(Ordering::Acquire) != start.generation {
            trace!("sim core {}: completion dropped by reset", self.index);
            return;
        }
        self.regs.set(regs::INT_STATUS, start.mask);
        self.regs.set(regs::INT_RAW_STATUS, start.mask);
        self.regs
            .set(self.soc.pc_task_status_offset, start.len & self.soc.pc_task_number_mask);
        if let Some(a) = &self.soc.amount_core {
            self.regs.add_amounts(a, start.len);
        }
        if let Some(a) = &self.soc.amount_top {
            self.top.add_amounts(a, start.len);
        }
        self.log.push(SimEvent::Irq { core: self.index });
        let _ = self.irq.send(IrqEvent { core: self.index });
    }
}

/// One simulated core.
pub struct SimCore {
    shared: Arc<Shared>,
    start_tx: Mutex<Sender<Start>>,
}

impl std::fmt::Debug for SimCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCore")
            .field("index", &self.shared.index)
            .field("commits", &self.commits())
            .finish_non_exhaustive()
    }
}

impl SimCore {
    pub(super) fn spawn(shared: Shared) -> Self {
        shared.regs.set(regs::VERSION, SIM_VERSION);
        shared.regs.set(regs::VERSION_NUM, SIM_VERSION_NUM);
        let shared = Arc::new(shared);
        let (tx, rx) = mpsc::channel::<Start>();
        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("rknpu-sim-core{}", shared.index))
            .spawn(move || {
                for start in rx {
                    thread::sleep(worker.latency);
                    worker.complete(&start);
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("sim core {}: worker not started: {e}", shared.index);
        }
        Self {
            shared,
            start_tx: Mutex::new(tx),
        }
    }

    /// Register map backing this core.
    pub fn registers(&self) -> &Registers {
        &self.shared.regs
    }

    /// Chunks started so far.
    pub fn commits(&self) -> usize {
        self.shared.commits.load(Ordering::Acquire)
    }

    /// Stop (or resume) completing chunks.
    pub fn set_hang(&self, hang: bool) {
        self.shared.hang.store(hang, Ordering::Release);
    }

    /// Raise an interrupt whose status matches no programmed mask.
    pub fn raise_spurious(&self) {
        self.shared.regs.set(regs::INT_STATUS, SPURIOUS_STATUS);
        let _ = self.shared.irq.send(IrqEvent {
            core: self.shared.index,
        });
    }

    /// Drop pending state after a reset.
    pub(super) fn reset(&self) {
        for offset in [regs::INT_STATUS, regs::INT_RAW_STATUS, regs::INT_MASK] {
            self.shared.regs.set(offset, 0);
        }
        self.shared.regs.set(self.shared.soc.pc_task_status_offset, 0);
    }

    fn start(&self) {
        let r = &self.shared.regs;
        let len = r.get(regs::PC_TASK_CONTROL) & self.shared.soc.pc_task_number_mask;
        let mask = r.get(regs::INT_MASK);
        self.shared.commits.fetch_add(1, Ordering::AcqRel);
        self.shared.log.push(SimEvent::Commit {
            core: self.shared.index,
            tasks: len,
            data_addr: r.get(regs::PC_DATA_ADDR),
        });
        r.set(self.shared.soc.pc_task_status_offset, 0);
        if self.shared.hang.load(Ordering::Acquire) {
            return;
        }
        let start = Start {
            generation: self.shared.generation.load(Ordering::Acquire),
            len,
            mask,
        };
        let tx = self.start_tx.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = tx.send(start);
    }
}

impl RegisterIo for SimCore {
    fn read32(&self, offset: usize) -> u32 {
        self.shared.regs.get(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        let s = &self.shared;
        match offset {
            regs::INT_CLEAR => {
                s.regs.update(regs::INT_STATUS, |v| v & !value);
                s.regs.update(regs::INT_RAW_STATUS, |v| v & !value);
            }
            regs::PC_OP_EN => {
                s.regs.set(offset, value);
                if value == 1 {
                    self.start();
                }
            }
            _ => {
                s.regs.set(offset, value);
                for a in [s.soc.amount_top, s.soc.amount_core].into_iter().flatten() {
                    if offset == a.clr_all && value & regs::AMOUNT_CLEAR_ASSERT & !regs::AMOUNT_CLEAR_RELEASE != 0 {
                        s.regs.clear_amounts(&a);
                    }
                }
            }
        }
    }
}
