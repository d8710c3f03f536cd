//! MMIO access plumbing
//!
//! Register windows receive byte offsets relative to their own base. The
//! A7IOP blocks only implement 32- and 64-bit naturally aligned accesses;
//! anything else is refused before it reaches a register decoder.

use crate::{A7iopError, Result};

/// A memory-mapped register window
///
/// - `read()`/`write()` receive offsets relative to the window base
/// - `size` is the access width in bytes (4 or 8)
/// - Return `None`/`false` for accesses the window refuses
pub trait MmioDevice: Send + Sync {
    fn read(&self, offset: u64, size: u8) -> Option<u64>;
    fn write(&self, offset: u64, value: u64, size: u8) -> bool;

    /// Size of the window in bytes
    fn size(&self) -> u64;

    fn contains(&self, offset: u64) -> bool {
        offset < self.size()
    }
}

/// Check an access against the 4/8-byte aligned rule
pub fn check_access(offset: u64, size: u8) -> Result<()> {
    if size != 4 && size != 8 {
        return Err(A7iopError::InvalidAccessSize { offset, size });
    }
    if offset % u64::from(size) != 0 {
        return Err(A7iopError::MisalignedAccess { offset, size });
    }
    Ok(())
}

/// Check that an access of `size` bytes at `offset` ends inside `window`
pub fn check_window(offset: u64, size: u8, window: u64) -> Result<()> {
    match offset.checked_add(u64::from(size)) {
        Some(end) if end <= window => Ok(()),
        _ => Err(A7iopError::OutOfWindow { offset, size, window }),
    }
}

/// Mask for the low `size` bytes of a register value
pub(crate) fn access_mask(size: u8) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (u64::from(size) * 8)) - 1
    }
}
