use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::CoreError;
use crate::types::MemoryTier;

/// Alignment of every reservation. Copy engines and attention kernels
/// both want wide, fixed alignment for block starts.
const RESERVATION_ALIGN: usize = 256;

/// A single contiguous memory reservation.
///
/// Block pools and contiguous allocations are all carved out of
/// `MemoryRegion`s. In this build both tiers are serviced from pinned
/// host reservations; an accelerator backend substitutes its own
/// reservation mechanism behind the same type. The region is zero-filled
/// at reservation time so freshly carved blocks read as deterministic
/// bytes.
#[derive(Debug)]
pub struct MemoryRegion {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    tier: MemoryTier,
    device_id: Option<u32>,
}

// SAFETY: the region is a plain byte reservation. Aliasing discipline is
// enforced above this type: the block allocator hands a block to at most
// one request, and in-flight copies are ordered by stream events.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Reserves `len` zeroed bytes on the given tier.
    pub fn reserve(len: usize, tier: MemoryTier, device_id: Option<u32>) -> Result<Self, CoreError> {
        if len == 0 {
            return Err(CoreError::InvalidArgument(
                "cannot reserve an empty memory region".into(),
            ));
        }
        let layout = Layout::from_size_align(len, RESERVATION_ALIGN)
            .map_err(|e| CoreError::InvalidArgument(format!("bad reservation layout: {e}")))?;
        // SAFETY: `layout` has non-zero size, checked above.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            CoreError::OutOfMemory(format!("failed to reserve {len} bytes on {tier:?} tier"))
        })?;
        Ok(Self {
            ptr,
            len,
            layout,
            tier,
            device_id,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tier(&self) -> MemoryTier {
        self.tier
    }

    pub fn device_id(&self) -> Option<u32> {
        self.device_id
    }

    /// Address of the byte at `offset`.
    ///
    /// `offset` must be within the reservation; callers compute it from
    /// block ids already validated by the allocator.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len, "offset {offset} outside region of {}", self.len);
        // SAFETY: `offset` is within the live reservation.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `alloc_zeroed` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_address() {
        let region = MemoryRegion::reserve(4096, MemoryTier::Device, Some(0)).unwrap();
        assert_eq!(region.len(), 4096);
        assert_eq!(region.tier(), MemoryTier::Device);
        let base = region.ptr_at(0).as_ptr() as usize;
        let second = region.ptr_at(1024).as_ptr() as usize;
        assert_eq!(second - base, 1024);
        assert_eq!(base % 256, 0);
    }

    #[test]
    fn empty_reservation_is_rejected() {
        assert!(MemoryRegion::reserve(0, MemoryTier::Host, None).is_err());
    }
}
