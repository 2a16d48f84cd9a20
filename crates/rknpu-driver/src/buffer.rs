//! Task buffers.
//!
//! The allocator that backs task arrays lives outside this crate; the
//! scheduler only needs a CPU view of the descriptors and the device
//! address they were mapped at.

use std::fmt;

use bytes::Bytes;
use rknpu_chip::{Task, TASK_SIZE};

/// A device-visible buffer.
pub trait BufferObject: fmt::Debug + Send + Sync {
    /// CPU view of the contents, if mapped.
    fn cpu_mapping(&self) -> Option<&[u8]>;
    /// Device (IOVA) address of the first byte.
    fn device_address(&self) -> u64;
    /// Size in bytes.
    fn size(&self) -> usize;
    /// Physical address of the byte at `offset`, if within the buffer.
    fn physical_address_at(&self, offset: usize) -> Option<u64> {
        (offset < self.size()).then(|| self.device_address() + offset as u64)
    }

    /// Decode task descriptor `index`.
    fn task(&self, index: usize) -> Option<Task> {
        self.cpu_mapping().and_then(|m| Task::at(m, index))
    }

    /// Number of whole descriptors the buffer holds.
    fn task_capacity(&self) -> usize {
        self.cpu_mapping().map_or(0, |m| m.len() / TASK_SIZE)
    }
}

/// Host-memory buffer backed by [`Bytes`].
#[derive(Clone)]
pub struct HostBuffer {
    data: Bytes,
    device_address: u64,
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len", &self.data.len())
            .field("device_address", &format_args!("{:#x}", self.device_address))
            .finish()
    }
}

impl HostBuffer {
    /// Wrap existing bytes mapped at `device_address`.
    pub fn new(data: impl Into<Bytes>, device_address: u64) -> Self {
        Self {
            data: data.into(),
            device_address,
        }
    }

    /// Build a task array buffer.
    #[must_use]
    pub fn from_tasks(tasks: &[Task], device_address: u64) -> Self {
        Self::new(rknpu_chip::task::encode_array(tasks), device_address)
    }

    /// Underlying bytes.
    #[must_use]
    pub const fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl BufferObject for HostBuffer {
    fn cpu_mapping(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn device_address(&self) -> u64 {
        self.device_address
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_lookup_through_trait() {
        let tasks: Vec<Task> = (0..4)
            .map(|i| Task {
                int_mask: 0x300,
                regcmd_addr: 0x1000 * (i + 1),
                ..Task::default()
            })
            .collect();
        let buf = HostBuffer::from_tasks(&tasks, 0x8000_0000);
        assert_eq!(buf.task_capacity(), 4);
        assert_eq!(buf.task(3).map(|t| t.regcmd_addr), Some(0x4000));
        assert!(buf.task(4).is_none());
    }

    #[test]
    fn physical_address_bounds() {
        let buf = HostBuffer::new(vec![0u8; 64], 0x1000);
        assert_eq!(buf.physical_address_at(0), Some(0x1000));
        assert_eq!(buf.physical_address_at(63), Some(0x103f));
        assert_eq!(buf.physical_address_at(64), None);
    }
}
