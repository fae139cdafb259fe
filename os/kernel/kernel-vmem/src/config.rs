//! Mapping permissions and placement constraints.

/// Cache policy of a mapping when caching is enabled at all.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CachingMode {
    #[default]
    WriteBack,
    WriteThrough,
    Uncacheable,
}

/// Where the backing physical memory of a region may live.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysicalConstraints {
    /// Lowest acceptable physical address.
    pub min_address: u32,
    /// Highest acceptable physical address (inclusive end of the range).
    pub max_address: u32,
    /// When non-zero, the allocation must not cross a multiple of this
    /// power-of-two value. Needed by DMA engines with boundary limits.
    pub boundary: u32,
}

impl PhysicalConstraints {
    pub const ANY: Self = Self {
        min_address: 0,
        max_address: u32::MAX,
        boundary: 0,
    };

    /// Whether `[base, base + size)` satisfies all constraints.
    #[must_use]
    pub const fn accepts(&self, base: u64, size: u64) -> bool {
        let end = base + size;
        if base < self.min_address as u64 || end - 1 > self.max_address as u64 {
            return false;
        }
        if self.boundary != 0 {
            let mask = !(self.boundary as u64 - 1);
            return base & mask == (end - 1) & mask;
        }
        true
    }
}

impl Default for PhysicalConstraints {
    fn default() -> Self {
        Self::ANY
    }
}

/// How a region is mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappingConfig {
    /// Present bit. Non-readable mappings are tracked but not mapped.
    pub readable: bool,
    pub writeable: bool,
    pub userspace: bool,
    pub cacheable: bool,
    pub caching_mode: CachingMode,
    pub constraints: PhysicalConstraints,
}

impl MappingConfig {
    /// Writable, supervisor-only, cached.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self {
            readable: true,
            writeable: true,
            userspace: false,
            cacheable: true,
            caching_mode: CachingMode::WriteBack,
            constraints: PhysicalConstraints::ANY,
        }
    }

    /// Writable and reachable from ring 3.
    #[must_use]
    pub const fn user_data() -> Self {
        Self {
            userspace: true,
            ..Self::kernel_data()
        }
    }

    /// Device registers: uncached, supervisor-only.
    #[must_use]
    pub const fn mmio() -> Self {
        Self {
            cacheable: false,
            caching_mode: CachingMode::Uncacheable,
            ..Self::kernel_data()
        }
    }

    #[must_use]
    pub const fn with_writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }

    #[must_use]
    pub const fn with_userspace(mut self, userspace: bool) -> Self {
        self.userspace = userspace;
        self
    }

    #[must_use]
    pub const fn with_constraints(mut self, constraints: PhysicalConstraints) -> Self {
        self.constraints = constraints;
        self
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self::kernel_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraints_bounds() {
        let c = PhysicalConstraints {
            min_address: 0x10_0000,
            max_address: 0x1FF_FFFF,
            boundary: 0,
        };
        assert!(c.accepts(0x10_0000, 0x1000));
        assert!(!c.accepts(0xF_F000, 0x1000));
        assert!(c.accepts(0x1FF_F000, 0x1000));
        assert!(!c.accepts(0x1FF_F000, 0x2000));
    }

    #[test]
    fn constraints_boundary() {
        let c = PhysicalConstraints {
            boundary: 0x1_0000,
            ..PhysicalConstraints::ANY
        };
        assert!(c.accepts(0x1_0000, 0x1_0000));
        assert!(!c.accepts(0x1_F000, 0x2000));
        assert!(PhysicalConstraints::ANY.accepts(0xFFFF_F000, 0x1000));
    }
}
