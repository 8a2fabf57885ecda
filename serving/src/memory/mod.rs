//! Memory reservations and the fixed-size block pools carved from them.

pub mod allocator;
pub mod info;
pub mod region;

pub use allocator::{AllocatorConfig, BlockAllocator};
pub use info::{device_memory_info, host_memory_info, MemoryInfo};
pub use region::MemoryRegion;
