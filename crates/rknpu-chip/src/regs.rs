//! Per-core register map for RKNPU.
//!
//! Every execution core exposes the same register block at its own base
//! address. Offsets below are relative to that base.
//!
//! ```text
//! 0x0000  VERSION            hardware version
//! 0x0004  VERSION_NUM        version number (low 16 bits used)
//! 0x0008  PC_OP_EN           pulse 1 then 0 to start a chunk
//! 0x0010  PC_DATA_ADDR       first register-command address (1 = slave mode)
//! 0x0014  PC_DATA_AMOUNT     register-command amount, scaled
//! 0x0020  INT_MASK           interrupt mask for the chunk
//! 0x0024  INT_CLEAR          interrupt clear
//! 0x0028  INT_STATUS         masked interrupt status
//! 0x002c  INT_RAW_STATUS     raw interrupt status
//! 0x0030  PC_TASK_CONTROL    task count + ping-pong mode
//! 0x0034  PC_DMA_BASE_ADDR   base address for relative command addresses
//! 0xf008  ENABLE_MASK        global enable mask
//! ```

// ── Identity ─────────────────────────────────────────────────────────────────

/// Hardware version register.
pub const VERSION: usize = 0x0000;
/// Hardware version number register.
pub const VERSION_NUM: usize = 0x0004;

// ── Program-counter engine ───────────────────────────────────────────────────

/// Program-counter operation enable. Written 1 then 0 to kick a chunk.
pub const PC_OP_EN: usize = 0x0008;
/// Address of the first task's register-command stream.
pub const PC_DATA_ADDR: usize = 0x0010;
/// Register-command amount for the first task.
pub const PC_DATA_AMOUNT: usize = 0x0014;
/// Task-control word: chunk length and ping-pong mode.
pub const PC_TASK_CONTROL: usize = 0x0030;
/// DMA base address of the task array.
pub const PC_DMA_BASE_ADDR: usize = 0x0034;

/// Value written to `PC_DATA_ADDR` to put a core into slave mode before
/// programming.
pub const PC_DATA_ADDR_SLAVE_MODE: u32 = 0x1;

/// Words the hardware appends to each register-command payload.
pub const PC_DATA_EXTRA_AMOUNT: u32 = 4;

// ── Interrupts ───────────────────────────────────────────────────────────────

/// Interrupt mask register.
pub const INT_MASK: usize = 0x0020;
/// Interrupt clear register.
pub const INT_CLEAR: usize = 0x0024;
/// Masked interrupt status register.
pub const INT_STATUS: usize = 0x0028;
/// Raw interrupt status register.
pub const INT_RAW_STATUS: usize = 0x002C;

/// Value written to `INT_CLEAR` to acknowledge every interrupt source.
pub const INT_CLEAR_ALL: u32 = 0x1_FFFF;

// ── Multi-core ───────────────────────────────────────────────────────────────

/// Global enable mask register.
pub const ENABLE_MASK: usize = 0xF008;

/// Command offsets written with the core-select word on multi-core parts.
pub const MULTICORE_COMMAND_OFFSETS: [usize; 2] = [0x1004, 0x3004];

/// Core-select word for `core_index`, written to both
/// [`MULTICORE_COMMAND_OFFSETS`] before a commit.
pub const fn multicore_command_word(core_index: usize) -> u32 {
    0xe + 0x1000_0000 * core_index as u32
}

// ── Bandwidth priority window (separate mapping) ─────────────────────────────

/// Bandwidth priority register, relative to the QoS window.
pub const BW_PRIORITY: usize = 0x0;
/// Bandwidth expectation register, relative to the QoS window.
pub const BW_EXPECT: usize = 0x8;
/// Bandwidth time-window register, relative to the QoS window.
pub const BW_TW: usize = 0xC;

// ── Read/write amount counters ───────────────────────────────────────────────

/// Offsets of one block of read/write amount counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountRegs {
    /// Clear-all control register.
    pub clr_all: usize,
    /// Data write amount.
    pub dt_wr: usize,
    /// Data read amount.
    pub dt_rd: usize,
    /// Weight read amount.
    pub wt_rd: usize,
}

/// Amount counter block used by RK356x ("old top" layout).
pub const AMOUNT_TOP_V1: AmountRegs = AmountRegs {
    clr_all: 0x8010,
    dt_wr: 0x8034,
    dt_rd: 0x8038,
    wt_rd: 0x803C,
};

/// Amount counter block at the top level of RK3588.
pub const AMOUNT_TOP_V2: AmountRegs = AmountRegs {
    clr_all: 0x2210,
    dt_wr: 0x2234,
    dt_rd: 0x2238,
    wt_rd: 0x223C,
};

/// Amount counter block inside each RK3588 core.
pub const AMOUNT_CORE_V2: AmountRegs = AmountRegs {
    clr_all: 0x2410,
    dt_wr: 0x2434,
    dt_rd: 0x2438,
    wt_rd: 0x243C,
};

/// First write of the amount-clear pulse.
pub const AMOUNT_CLEAR_ASSERT: u32 = 0x8000_0101;
/// Second write of the amount-clear pulse.
pub const AMOUNT_CLEAR_RELEASE: u32 = 0x0000_0101;

// ── Interrupt status normalisation ───────────────────────────────────────────

/// Two-bit groups that make up the "interesting" part of `INT_STATUS`.
///
/// The hardware may raise either bit of a group when a stage finishes; a
/// group counts as fully raised if any of its bits is set. Bits outside
/// these groups are ignored.
pub const INT_STATUS_GROUPS: [u32; 6] = [0x3, 0xC, 0x30, 0xC0, 0x300, 0xC00];

/// Normalise a raw `INT_STATUS` value for comparison against the mask
/// programmed at commit time.
pub const fn normalize_int_status(status: u32) -> u32 {
    let mut out = 0;
    let mut i = 0;
    while i < INT_STATUS_GROUPS.len() {
        if status & INT_STATUS_GROUPS[i] != 0 {
            out |= INT_STATUS_GROUPS[i];
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_widens_groups() {
        assert_eq!(normalize_int_status(0x1), 0x3);
        assert_eq!(normalize_int_status(0x2), 0x3);
        assert_eq!(normalize_int_status(0x300), 0x300);
        assert_eq!(normalize_int_status(0x100 | 0x4), 0x300 | 0xC);
    }

    #[test]
    fn normalisation_drops_unrelated_bits() {
        assert_eq!(normalize_int_status(0x1_0000), 0);
        assert_eq!(normalize_int_status(0x1_0000 | 0x800), 0xC00);
    }

    #[test]
    fn multicore_words() {
        assert_eq!(multicore_command_word(0), 0xe);
        assert_eq!(multicore_command_word(1), 0x1000_000e);
        assert_eq!(multicore_command_word(2), 0x2000_000e);
    }

    #[test]
    fn pc_registers_do_not_overlap() {
        let offs = [
            PC_OP_EN,
            PC_DATA_ADDR,
            PC_DATA_AMOUNT,
            INT_MASK,
            INT_CLEAR,
            INT_STATUS,
            INT_RAW_STATUS,
            PC_TASK_CONTROL,
            PC_DMA_BASE_ADDR,
        ];
        for (i, a) in offs.iter().enumerate() {
            for b in &offs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
