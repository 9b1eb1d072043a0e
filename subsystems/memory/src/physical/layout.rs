//! # Pool Layout
//!
//! Static description of how guest DRAM is partitioned between the four
//! physical pools. The layout is fixed at initialization and never changes
//! at runtime.

use crate::{MemError, MemResult};
use core::fmt;
use guestmem_hal::{align_down, PhysAddr, DRAM_BASE, PAGE_SIZE};

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;

/// Extra system memory carved out of the applet pool
const EXTRA_SYSTEM_MEMORY: u64 = 33 * MIB;

/// Smallest non-secure system pool, including the fatal error display
pub const MINIMUM_NON_SECURE_SYSTEM_SIZE: u64 = (0x2280 + 0x704 + 0x80 + 0x200) * PAGE_SIZE;

const CARVEOUT_ALIGNMENT: u64 = 0x20000;
const CARVEOUT_SIZE_MAX: u64 = 512 * MIB - CARVEOUT_ALIGNMENT;

/// Physical memory pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Pool {
    /// Memory for the running application
    Application = 0,
    /// Memory for library applets
    Applet = 1,
    /// Memory for system services
    System = 2,
    /// System memory the GPU may access outside the secure carveout
    SystemNonSecure = 3,
}

impl Pool {
    /// Number of pools
    pub const COUNT: usize = 4;

    /// All pools, indexed by their value
    pub const ALL: [Pool; Pool::COUNT] =
        [Pool::Application, Pool::Applet, Pool::System, Pool::SystemNonSecure];

    /// Index of the pool in per-pool tables
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Pool with the given raw value
    pub fn from_raw(raw: u32) -> MemResult<Self> {
        Self::ALL.get(raw as usize).copied().ok_or(MemError::InvalidHandle)
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pool::Application => "Application",
            Pool::Applet => "Applet",
            Pool::System => "System",
            Pool::SystemNonSecure => "SystemNonSecure",
        })
    }
}

/// Which end of a pool allocations prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Direction {
    /// Lowest addresses first
    FromFront = 0,
    /// Highest addresses first
    FromBack = 1,
}

/// Pool and direction of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationOption {
    /// Pool to allocate from
    pub pool: Pool,
    /// Preferred end of the pool
    pub direction: Direction,
}

impl AllocationOption {
    const POOL_SHIFT: u32 = 4;
    const POOL_MASK: u32 = 0xF << Self::POOL_SHIFT;
    const DIRECTION_MASK: u32 = 0xF;

    /// Create an option
    pub const fn new(pool: Pool, direction: Direction) -> Self {
        Self { pool, direction }
    }

    /// Raw `(pool << 4) | direction` encoding
    pub const fn encode(self) -> u32 {
        ((self.pool as u32) << Self::POOL_SHIFT) | self.direction as u32
    }

    /// Decode a raw option
    pub fn decode(raw: u32) -> MemResult<Self> {
        let pool = Pool::from_raw((raw & Self::POOL_MASK) >> Self::POOL_SHIFT)?;
        let direction = match raw & Self::DIRECTION_MASK {
            0 => Direction::FromFront,
            1 => Direction::FromBack,
            _ => return Err(MemError::InvalidHandle),
        };
        Ok(Self { pool, direction })
    }
}

/// Application/applet split of guest DRAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryArrangement {
    /// Retail 4 GiB console
    Arrangement4GiB,
    /// 4 GiB console configured for applet development
    Arrangement4GiBForAppletDev,
    /// 4 GiB console configured for system development
    Arrangement4GiBForSystemDev,
    /// 6 GiB development unit
    Arrangement6GiB,
    /// 6 GiB development unit configured for applet development
    Arrangement6GiBForAppletDev,
    /// 8 GiB configuration
    Arrangement8GiB,
}

impl MemoryArrangement {
    /// DRAM size this arrangement expects
    pub const fn dram_size(self) -> u64 {
        match self {
            Self::Arrangement4GiB
            | Self::Arrangement4GiBForAppletDev
            | Self::Arrangement4GiBForSystemDev => 4 * GIB,
            Self::Arrangement6GiB | Self::Arrangement6GiBForAppletDev => 6 * GIB,
            Self::Arrangement8GiB => 8 * GIB,
        }
    }

    /// Size of the application pool
    pub const fn application_pool_size(self) -> u64 {
        match self {
            Self::Arrangement4GiB | Self::Arrangement4GiBForSystemDev => 3285 * MIB,
            Self::Arrangement4GiBForAppletDev => 2048 * MIB,
            Self::Arrangement6GiB => 4916 * MIB,
            Self::Arrangement6GiBForAppletDev => 3285 * MIB,
            Self::Arrangement8GiB => 6547 * MIB,
        }
    }

    /// Size of the applet pool
    pub const fn applet_pool_size(self) -> u64 {
        let base = match self {
            Self::Arrangement4GiB => 507 * MIB,
            Self::Arrangement4GiBForAppletDev => 1554 * MIB,
            Self::Arrangement4GiBForSystemDev => 448 * MIB,
            Self::Arrangement6GiB | Self::Arrangement8GiB => 562 * MIB,
            Self::Arrangement6GiBForAppletDev => 2193 * MIB,
        };
        base - EXTRA_SYSTEM_MEMORY
    }
}

/// One contiguous range owned by a single pool. Every region becomes one
/// manager with its own page heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRegion {
    /// First physical address
    pub start: PhysAddr,
    /// Size in bytes
    pub size: u64,
    /// Owning pool
    pub pool: Pool,
}

impl PoolRegion {
    /// Create a region
    pub const fn new(start: PhysAddr, size: u64, pool: Pool) -> Self {
        Self { start, size, pool }
    }

    /// One past the last address
    #[inline]
    pub fn end(&self) -> PhysAddr {
        self.start.add(self.size)
    }
}

/// Pool partition of guest DRAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    regions: Vec<PoolRegion>,
    initial_process: Option<(PhysAddr, u64)>,
}

impl PoolLayout {
    /// Build a layout from an explicit region list.
    ///
    /// Regions must be page aligned, lie in DRAM and not overlap.
    pub fn new(mut regions: Vec<PoolRegion>) -> MemResult<Self> {
        regions.sort_by_key(|region| region.start);

        for region in &regions {
            if region.size == 0 || region.size % PAGE_SIZE != 0 {
                return Err(MemError::InvalidSize);
            }
            if !region.start.is_aligned(PAGE_SIZE) {
                return Err(MemError::NotAligned);
            }
            if region.start.as_u64() < DRAM_BASE {
                return Err(MemError::InvalidAddress);
            }
        }
        if regions.windows(2).any(|pair| pair[0].end() > pair[1].start) {
            return Err(MemError::InvalidMemoryRange);
        }

        Ok(Self { regions, initial_process: None })
    }

    /// Partition `dram_size` bytes of DRAM for `arrangement`.
    ///
    /// The application pool sits at the back (split at the DRAM midpoint
    /// when it straddles it), the applet pool before it, then the
    /// non-secure system pool, and the system pool takes the front.
    pub fn partition(dram_size: u64, arrangement: MemoryArrangement) -> MemResult<Self> {
        let application_size = arrangement.application_pool_size();
        let applet_size = arrangement.applet_pool_size();

        let dram_start = DRAM_BASE;
        let dram_end = DRAM_BASE + dram_size;
        let dram_midpoint = dram_start + dram_size / 2;

        if application_size + applet_size + MINIMUM_NON_SECURE_SYSTEM_SIZE >= dram_size {
            return Err(MemError::InvalidSize);
        }

        let application_start = dram_end - application_size;
        let applet_start = application_start - applet_size;
        let non_secure_start = (dram_start + CARVEOUT_SIZE_MAX)
            .min(align_down(applet_start - MINIMUM_NON_SECURE_SYSTEM_SIZE, CARVEOUT_ALIGNMENT));

        let mut regions = Vec::with_capacity(5);
        regions.push(PoolRegion::new(
            PhysAddr::new(dram_start),
            non_secure_start - dram_start,
            Pool::System,
        ));
        regions.push(PoolRegion::new(
            PhysAddr::new(non_secure_start),
            applet_start - non_secure_start,
            Pool::SystemNonSecure,
        ));
        regions.push(PoolRegion::new(PhysAddr::new(applet_start), applet_size, Pool::Applet));

        if dram_midpoint <= application_start {
            regions.push(PoolRegion::new(
                PhysAddr::new(application_start),
                application_size,
                Pool::Application,
            ));
        } else {
            regions.push(PoolRegion::new(
                PhysAddr::new(application_start),
                dram_midpoint - application_start,
                Pool::Application,
            ));
            regions.push(PoolRegion::new(
                PhysAddr::new(dram_midpoint),
                dram_end - dram_midpoint,
                Pool::Application,
            ));
        }

        log::debug!(
            "Partitioned {:#x} bytes of DRAM: application {:#x}, applet {:#x}, non-secure system {:#x}",
            dram_size,
            application_size,
            applet_size,
            applet_start - non_secure_start
        );

        Self::new(regions)
    }

    /// Reserve `[start, start + size)` for the initial process image. Those
    /// pages start out referenced instead of free.
    pub fn with_initial_process(mut self, start: PhysAddr, size: u64) -> MemResult<Self> {
        if size % PAGE_SIZE != 0 || !start.is_aligned(PAGE_SIZE) {
            return Err(MemError::NotAligned);
        }
        let inside = self
            .regions
            .iter()
            .any(|region| start >= region.start && start.add(size) <= region.end());
        if size == 0 || !inside {
            return Err(MemError::InvalidMemoryRange);
        }
        self.initial_process = Some((start, size));
        Ok(self)
    }

    /// Regions in address order
    pub fn regions(&self) -> &[PoolRegion] {
        &self.regions
    }

    /// Initial process reservation, if any
    pub fn initial_process(&self) -> Option<(PhysAddr, u64)> {
        self.initial_process
    }

    /// Total bytes assigned to `pool`
    pub fn pool_size(&self, pool: Pool) -> u64 {
        self.regions.iter().filter(|region| region.pool == pool).map(|region| region.size).sum()
    }

    /// One past the highest address of any region
    pub fn end(&self) -> PhysAddr {
        self.regions.last().map_or(PhysAddr::new(DRAM_BASE), PoolRegion::end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_encoding() {
        let option = AllocationOption::new(Pool::SystemNonSecure, Direction::FromBack);
        assert_eq!(option.encode(), 0x31);
        assert_eq!(AllocationOption::decode(0x31), Ok(option));
        assert_eq!(AllocationOption::decode(0x20).unwrap().pool, Pool::System);
        assert_eq!(AllocationOption::decode(0x50), Err(MemError::InvalidHandle));
        assert_eq!(AllocationOption::decode(0x02), Err(MemError::InvalidHandle));
    }

    #[test]
    fn test_partition_4gib() {
        let layout = PoolLayout::partition(4 * GIB, MemoryArrangement::Arrangement4GiB).unwrap();
        assert_eq!(layout.pool_size(Pool::Application), 3285 * MIB);
        assert_eq!(layout.pool_size(Pool::Applet), 507 * MIB - EXTRA_SYSTEM_MEMORY);
        assert!(layout.pool_size(Pool::SystemNonSecure) >= MINIMUM_NON_SECURE_SYSTEM_SIZE);
        assert_eq!(layout.end().as_u64(), DRAM_BASE + 4 * GIB);

        let total: u64 = Pool::ALL.iter().map(|&pool| layout.pool_size(pool)).sum();
        assert_eq!(total, 4 * GIB);

        // The application pool straddles the midpoint and is split there
        let application: Vec<_> =
            layout.regions().iter().filter(|region| region.pool == Pool::Application).collect();
        assert_eq!(application.len(), 2);
        assert_eq!(application[1].start.as_u64(), DRAM_BASE + 2 * GIB);
    }

    #[test]
    fn test_partition_order() {
        let layout = PoolLayout::partition(8 * GIB, MemoryArrangement::Arrangement8GiB).unwrap();
        let pools: Vec<_> = layout.regions().iter().map(|region| region.pool).collect();
        assert_eq!(pools[0], Pool::System);
        assert_eq!(pools[1], Pool::SystemNonSecure);
        assert_eq!(pools[2], Pool::Applet);
        assert_eq!(*pools.last().unwrap(), Pool::Application);
    }

    #[test]
    fn test_partition_too_small() {
        assert_eq!(
            PoolLayout::partition(2 * GIB, MemoryArrangement::Arrangement4GiB),
            Err(MemError::InvalidSize)
        );
    }

    #[test]
    fn test_new_rejects_overlap() {
        let base = PhysAddr::new(DRAM_BASE);
        let regions = vec![
            PoolRegion::new(base, 8 * PAGE_SIZE, Pool::System),
            PoolRegion::new(base.add(4 * PAGE_SIZE), 8 * PAGE_SIZE, Pool::Application),
        ];
        assert_eq!(PoolLayout::new(regions), Err(MemError::InvalidMemoryRange));
    }

    #[test]
    fn test_initial_process_must_fit() {
        let base = PhysAddr::new(DRAM_BASE);
        let layout =
            PoolLayout::new(vec![PoolRegion::new(base, 16 * PAGE_SIZE, Pool::Application)]).unwrap();
        assert!(layout.clone().with_initial_process(base.add(PAGE_SIZE), 4 * PAGE_SIZE).is_ok());
        assert_eq!(
            layout.with_initial_process(base.add(12 * PAGE_SIZE), 8 * PAGE_SIZE),
            Err(MemError::InvalidMemoryRange)
        );
    }
}
