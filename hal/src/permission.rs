//! # Memory Permissions

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Host mapping permission flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPermission: u32 {
        /// Read access
        const READ = 1 << 0;
        /// Write access
        const WRITE = 1 << 1;
        /// Execute access
        const EXECUTE = 1 << 2;
        /// Read + Write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read + Execute
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl MemoryPermission {
    /// Check whether an access needing `required` is allowed
    #[inline]
    pub fn allows(self, required: MemoryPermission) -> bool {
        self.contains(required)
    }
}

impl fmt::Display for MemoryPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        let x = if self.contains(Self::EXECUTE) { 'X' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}
