mod linux;
mod macos;

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
compile_error!("unsupported target os");

#[cfg(target_os = "linux")]
pub(crate) use linux::Process;
#[cfg(target_os = "macos")]
pub(crate) use macos::Process;

use crate::error::DumpError;
use std::fmt;

pub(crate) const PROT_READ: u32 = 1;
pub(crate) const PROT_WRITE: u32 = 1 << 1;
pub(crate) const PROT_EXECUTE: u32 = 1 << 2;

/// Memory protection bits, rendered as the usual `rwx` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Protection(pub(crate) u32);

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.0 & PROT_READ != 0 { 'r' } else { '-' },
            if self.0 & PROT_WRITE != 0 { 'w' } else { '-' },
            if self.0 & PROT_EXECUTE != 0 { 'x' } else { '-' },
        )
    }
}

/// Snapshot of one mapped region of the target's address space. The layout
/// can change between enumerations, so these are never cached across calls.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryRegion {
    pub(crate) base: u64,
    pub(crate) size: u64,
    pub(crate) protection: Protection,
    pub(crate) max_protection: Protection,
}

/// Read access to a live process's address space.
///
/// `Process` implements this for the real OS handle; tests implement it over
/// an in-memory fake.
pub(crate) trait ProcessMemory {
    /// Read exactly `size` bytes at `address`. A short read is an error
    /// (`PartialRead`), never a zero-padded buffer.
    fn read_exact(&self, address: u64, size: u64) -> Result<Vec<u8>, DumpError>;

    /// Enumerate mapped regions in ascending base-address order. The
    /// sequence is produced lazily from a fresh cursor on every call.
    fn regions(&self) -> Result<Box<dyn Iterator<Item = MemoryRegion> + '_>, DumpError>;

    /// The region containing `address`, or the next one above it if the
    /// address itself is unmapped.
    fn region_for(&self, address: u64) -> Result<Option<MemoryRegion>, DumpError> {
        Ok(self
            .regions()?
            .find(|region| region.base.saturating_add(region.size) > address))
    }
}
