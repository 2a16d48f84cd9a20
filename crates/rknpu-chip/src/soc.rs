//! Per-SoC configuration tables.
//!
//! | SoC | Cores | Amount scale | Task bits | PC DMA ctrl | Core mask |
//! |-----|-------|--------------|-----------|-------------|-----------|
//! | RK3568 / RK3566 | 1 | 1 | 12 | no | `0x1` |
//! | RK3588 | 3 | 2 | 12 | yes | `0x7` |

use crate::regs::{AmountRegs, AMOUNT_CORE_V2, AMOUNT_TOP_V1, AMOUNT_TOP_V2};

/// Core-mask bits as used in submissions.
pub mod core_mask {
    /// Let the scheduler pick the least-loaded core.
    pub const AUTO: u32 = 0x0;
    /// Core 0.
    pub const CORE0: u32 = 0x1;
    /// Core 1.
    pub const CORE1: u32 = 0x2;
    /// Core 2.
    pub const CORE2: u32 = 0x4;
    /// Every core on a three-core part.
    pub const ALL: u32 = CORE0 | CORE1 | CORE2;
}

/// Maximum number of execution cores on any supported part.
pub const MAX_CORES: usize = 3;

/// Length of the per-core sub-range table in a submission.
pub const MAX_SUBCORE_TASKS: usize = 5;

/// Static description of one NPU variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocConfig {
    /// Human-readable name.
    pub name: &'static str,
    /// Device-tree compatible string.
    pub compatible: &'static str,
    /// Number of execution cores.
    pub core_count: usize,
    /// Mask of valid core bits.
    pub core_mask: u32,
    /// Divisor applied to register-command amounts.
    pub pc_data_amount_scale: u32,
    /// Shift of the ping-pong field in `PC_TASK_CONTROL`.
    pub pc_task_number_bits: u32,
    /// Mask applied to the hardware task-status counter.
    pub pc_task_number_mask: u32,
    /// Offset of the task-status counter register.
    pub pc_task_status_offset: usize,
    /// Whether slave-mode switching must happen under the interrupt lock.
    pub pc_dma_ctrl: bool,
    /// Largest chunk the PC engine accepts in one commit.
    pub max_submit_number: u32,
    /// Physical address of the bandwidth-priority window, if any.
    pub bw_priority_addr: Option<u64>,
    /// Length of the bandwidth-priority window.
    pub bw_priority_length: usize,
    /// Top-level read/write amount counters.
    pub amount_top: Option<AmountRegs>,
    /// Per-core read/write amount counters.
    pub amount_core: Option<AmountRegs>,
    /// Register writes (offset, value) replayed on core 0 after power-on
    /// and after every reset.
    pub state_init: &'static [(usize, u32)],
}

const RK356X_STATE_INIT: &[(usize, u32)] = &[
    (0x10, 0x1),
    (0x1004, 0),
    (0x1024, 0x8000_0000),
    (0x1004, 1),
    (0x1024, 0x8000_0000),
    (0x1004, 0x1e),
];

impl SocConfig {
    /// RK3568 / RK3566: single core.
    pub const RK3568: Self = Self {
        name: "RK3568",
        compatible: "rockchip,rk3568-rknpu",
        core_count: 1,
        core_mask: 0x1,
        pc_data_amount_scale: 1,
        pc_task_number_bits: 12,
        pc_task_number_mask: 0xfff,
        pc_task_status_offset: 0x3c,
        pc_dma_ctrl: false,
        max_submit_number: (1 << 12) - 1,
        bw_priority_addr: Some(0xfe18_0008),
        bw_priority_length: 0x10,
        amount_top: Some(AMOUNT_TOP_V1),
        amount_core: None,
        state_init: RK356X_STATE_INIT,
    };

    /// RK3588: three cores.
    pub const RK3588: Self = Self {
        name: "RK3588",
        compatible: "rockchip,rk3588-rknpu",
        core_count: 3,
        core_mask: 0x7,
        pc_data_amount_scale: 2,
        pc_task_number_bits: 12,
        pc_task_number_mask: 0xfff,
        pc_task_status_offset: 0x3c,
        pc_dma_ctrl: true,
        max_submit_number: (1 << 12) - 1,
        bw_priority_addr: None,
        bw_priority_length: 0,
        amount_top: Some(AMOUNT_TOP_V2),
        amount_core: Some(AMOUNT_CORE_V2),
        state_init: &[],
    };

    /// All known variants.
    pub const ALL: [Self; 2] = [Self::RK3568, Self::RK3588];

    /// Look up a variant by device-tree compatible string or name
    /// (case-insensitive).
    #[must_use]
    pub fn lookup(key: &str) -> Option<&'static Self> {
        Self::ALL
            .iter()
            .find(|c| c.compatible == key || c.name.eq_ignore_ascii_case(key))
    }

    /// True if this part has more than one core.
    #[must_use]
    pub const fn is_multicore(&self) -> bool {
        self.core_count > 1
    }

    /// True if `mask` names only cores that exist. `AUTO` is always valid.
    #[must_use]
    pub const fn accepts_mask(&self, mask: u32) -> bool {
        mask & !self.core_mask == 0
    }

    /// Register-command amount written to `PC_DATA_AMOUNT` for a task with
    /// `regcfg_amount` words, or `None` if it does not fit the register.
    #[must_use]
    pub const fn pc_data_amount(&self, regcfg_amount: u32) -> Option<u32> {
        let scale = self.pc_data_amount_scale as u64;
        let words = regcfg_amount as u64 + crate::regs::PC_DATA_EXTRA_AMOUNT as u64;
        let amount = (words + scale - 1) / scale - 1;
        if amount > u32::MAX as u64 {
            None
        } else {
            Some(amount as u32)
        }
    }

    /// `PC_TASK_CONTROL` word for a chunk of `chunk_len` tasks.
    #[must_use]
    pub const fn pc_task_control(&self, pingpong: bool, chunk_len: u32) -> u32 {
        let pp: u32 = if pingpong { 1 } else { 0 };
        ((pp & 0x7) << self.pc_task_number_bits) | chunk_len
    }

    /// Extract the completed-task counter from a raw task-status read.
    #[must_use]
    pub const fn task_counter(&self, raw: u32) -> u32 {
        raw & self.pc_task_number_mask
    }
}
