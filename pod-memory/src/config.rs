//! Address space configuration

use pod_api::{Access, Error, Gfn, Result};

/// Largest guest-physical limit accepted (16TB of guest memory)
pub const MAX_SUPPORTED_GFN: u64 = 1 << 32;

/// Per-VM populate-on-demand configuration
#[derive(Debug, Clone)]
pub struct PodConfig {
    /// First frame beyond the VM's guest-physical address limit
    pub max_gfn: Gfn,
    /// Frames kept on the deferred free list before returning them to the
    /// allocator
    pub deferred_free_limit: usize,
    /// Access rights given to newly declared lazy entries
    pub default_access: Access,
    /// Share a whole L1 region from the template on the first read fault
    /// instead of resolving frame by frame
    pub eager_clone_regions: bool,
}

impl Default for PodConfig {
    fn default() -> Self {
        Self {
            max_gfn: Gfn::new(1 << 20),
            deferred_free_limit: 64,
            default_access: Access::RWX,
            eager_clone_regions: false,
        }
    }
}

impl PodConfig {
    /// Sets the guest-physical limit
    pub fn with_max_gfn(mut self, max_gfn: Gfn) -> Self {
        self.max_gfn = max_gfn;
        self
    }

    /// Sets the deferred free list bound
    pub fn with_deferred_free_limit(mut self, limit: usize) -> Self {
        self.deferred_free_limit = limit;
        self
    }

    /// Sets the access rights of declared entries
    pub fn with_default_access(mut self, access: Access) -> Self {
        self.default_access = access;
        self
    }

    /// Enables or disables region-wide cloning on read faults
    pub fn with_eager_clone_regions(mut self, eager: bool) -> Self {
        self.eager_clone_regions = eager;
        self
    }

    /// Checks that the configuration describes a usable address space
    pub fn validate(&self) -> Result<()> {
        if self.max_gfn.as_u64() == 0 {
            return Err(Error::InvalidArgument("max_gfn must be non-zero"));
        }
        if self.max_gfn.as_u64() > MAX_SUPPORTED_GFN {
            return Err(Error::InvalidArgument("max_gfn exceeds supported limit"));
        }
        if !self.default_access.contains(Access::READ) {
            return Err(Error::InvalidArgument("default access must allow reads"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PodConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_access, Access::RWX);
        assert!(!config.eager_clone_regions);
    }

    #[test]
    fn test_builder() {
        let config = PodConfig::default()
            .with_max_gfn(Gfn::new(4096))
            .with_deferred_free_limit(8)
            .with_default_access(Access::RW)
            .with_eager_clone_regions(true);
        assert_eq!(config.max_gfn, Gfn::new(4096));
        assert_eq!(config.deferred_free_limit, 8);
        assert_eq!(config.default_access, Access::RW);
        assert!(config.eager_clone_regions);
    }

    #[test]
    fn test_rejects_bad_limits() {
        assert!(PodConfig::default().with_max_gfn(Gfn::new(0)).validate().is_err());
        assert!(
            PodConfig::default()
                .with_max_gfn(Gfn::new(MAX_SUPPORTED_GFN + 1))
                .validate()
                .is_err()
        );
        assert!(
            PodConfig::default()
                .with_default_access(Access::WRITE)
                .validate()
                .is_err()
        );
    }
}
