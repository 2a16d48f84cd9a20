//! Task descriptor layout.
//!
//! User space builds an array of fixed-size task descriptors in a DMA
//! buffer. Each descriptor points at a register-command stream that the
//! program-counter engine fetches on its own; the driver only reads the
//! first and last descriptor of every chunk.
//!
//! ```text
//! offset  size  field
//! 0x00    4     flags
//! 0x04    4     op_idx
//! 0x08    4     enable_mask
//! 0x0c    4     int_mask
//! 0x10    4     int_clear
//! 0x14    4     int_status
//! 0x18    4     regcfg_amount
//! 0x1c    4     regcfg_offset
//! 0x20    8     regcmd_addr
//! ```
//!
//! All fields are little-endian and the structure is packed.

/// Size of one descriptor in bytes.
pub const TASK_SIZE: usize = 40;

/// One task descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Task {
    /// Task flags (opaque to the scheduler).
    pub flags: u32,
    /// Operation index (opaque).
    pub op_idx: u32,
    /// Enable mask (opaque).
    pub enable_mask: u32,
    /// Interrupt mask expected when this task completes.
    pub int_mask: u32,
    /// Interrupt clear value (opaque).
    pub int_clear: u32,
    /// Interrupt status slot (opaque).
    pub int_status: u32,
    /// Number of register-command words.
    pub regcfg_amount: u32,
    /// Offset of the register-command stream (opaque).
    pub regcfg_offset: u32,
    /// Device address of the register-command stream.
    pub regcmd_addr: u64,
}

fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

impl Task {
    /// Decode one descriptor. Returns `None` if `bytes` is shorter than
    /// [`TASK_SIZE`].
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TASK_SIZE {
            return None;
        }
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[0x20..0x28]);
        Some(Self {
            flags: le32(bytes, 0x00),
            op_idx: le32(bytes, 0x04),
            enable_mask: le32(bytes, 0x08),
            int_mask: le32(bytes, 0x0c),
            int_clear: le32(bytes, 0x10),
            int_status: le32(bytes, 0x14),
            regcfg_amount: le32(bytes, 0x18),
            regcfg_offset: le32(bytes, 0x1c),
            regcmd_addr: u64::from_le_bytes(addr),
        })
    }

    /// Decode descriptor `index` from a task array.
    #[must_use]
    pub fn at(array: &[u8], index: usize) -> Option<Self> {
        let start = index.checked_mul(TASK_SIZE)?;
        array.get(start..).and_then(Self::parse)
    }

    /// Encode to the packed on-wire layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; TASK_SIZE] {
        let mut out = [0u8; TASK_SIZE];
        let words = [
            self.flags,
            self.op_idx,
            self.enable_mask,
            self.int_mask,
            self.int_clear,
            self.int_status,
            self.regcfg_amount,
            self.regcfg_offset,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        out[0x20..0x28].copy_from_slice(&self.regcmd_addr.to_le_bytes());
        out
    }
}

/// Encode a run of tasks into a contiguous array.
#[must_use]
pub fn encode_array(tasks: &[Task]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tasks.len() * TASK_SIZE);
    for t in tasks {
        out.extend_from_slice(&t.to_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task {
            flags: 1,
            op_idx: 2,
            enable_mask: 0xd,
            int_mask: 0x300,
            int_clear: 0x1ffff,
            int_status: 0,
            regcfg_amount: 108,
            regcfg_offset: 0x40,
            regcmd_addr: 0x1_2345_6780,
        }
    }

    #[test]
    fn field_offsets() {
        let b = sample().to_bytes();
        assert_eq!(&b[0x0c..0x10], &0x300u32.to_le_bytes());
        assert_eq!(&b[0x18..0x1c], &108u32.to_le_bytes());
        assert_eq!(&b[0x20..0x28], &0x1_2345_6780u64.to_le_bytes());
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Task::parse(&[0u8; TASK_SIZE - 1]).is_none());
    }

    #[test]
    fn indexed_access_into_array() {
        let mut last = sample();
        last.int_mask = 0xc00;
        let arr = encode_array(&[sample(), sample(), last]);
        assert_eq!(Task::at(&arr, 2).map(|t| t.int_mask), Some(0xc00));
        assert!(Task::at(&arr, 3).is_none());
        assert_eq!(Task::at(&arr, 0), Some(sample()));
    }
}
