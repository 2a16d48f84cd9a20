//! Address-translation domain service.
//!
//! Each submission names the translation domain its buffers live in. The
//! scheduler activates that domain before the job reaches a core and
//! releases it once the job completes or aborts.

use std::fmt;

use crate::error::Result;

/// Address-translation (IOMMU) service.
pub trait AddressDomain: fmt::Debug + Send + Sync {
    /// True if translation is enabled at all.
    fn is_enabled(&self) -> bool;

    /// True while the translation hardware is still active. Power-off waits
    /// for this to drop before cutting power domains.
    fn is_active(&self) -> bool {
        false
    }

    /// Take a reference on `domain_id`, switching to it if possible.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::DomainError`](crate::NpuError::DomainError) if the
    /// switch cannot happen.
    fn activate(&self, domain_id: i32) -> Result<()>;

    /// Drop a reference taken by [`AddressDomain::activate`].
    fn release(&self, domain_id: i32);

    /// Translate a device address, if mapped.
    fn translate(&self, addr: u64) -> Option<u64>;

    /// Currently selected domain.
    fn current_domain(&self) -> i32;

    /// Detach and reattach the hardware after a reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the hardware cannot be reattached.
    fn reattach(&self) -> Result<()>;
}

/// No translation: device addresses are physical.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectMapping;

impl AddressDomain for DirectMapping {
    fn is_enabled(&self) -> bool {
        false
    }

    fn activate(&self, _domain_id: i32) -> Result<()> {
        Ok(())
    }

    fn release(&self, _domain_id: i32) {}

    fn translate(&self, addr: u64) -> Option<u64> {
        Some(addr)
    }

    fn current_domain(&self) -> i32 {
        0
    }

    fn reattach(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_mapping_is_identity() {
        let d = DirectMapping;
        assert!(!d.is_enabled());
        assert!(!d.is_active());
        assert!(d.activate(5).is_ok());
        assert_eq!(d.translate(0xdead_b000), Some(0xdead_b000));
        assert_eq!(d.current_domain(), 0);
    }
}
