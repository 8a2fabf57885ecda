use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{info, instrument, warn};

use crate::context::StreamSet;
use crate::error::CoreError;
use crate::memory::{AllocatorConfig, BlockAllocator};
use crate::stream::{CopyTask, DeviceEvent};
use crate::types::{BlockId, MemoryTier};

/// Resolves when the last copy of a swap operation has been observed on
/// its stream. Supervised by the swap thread pool so the scheduler task
/// never blocks on a copy.
pub struct SwapFuture {
    rx: oneshot::Receiver<()>,
}

impl SwapFuture {
    pub async fn wait(self) -> Result<(), CoreError> {
        self.rx
            .await
            .map_err(|_| CoreError::Runtime("swap supervisor dropped before completion".into()))
    }
}

/// Per-accelerator façade over one device and one host block pool.
///
/// Request state refers to blocks by stable id only; ids resolve to
/// addresses here, at the immediate point of compute or copy. Swap
/// operations are asynchronous: copies are issued on the accelerator's
/// `d2h`/`h2d` streams and the source-tier ids are released through an
/// event-held free list, so they cannot be reissued while a copy that
/// reads them is still in flight.
///
/// Lock order: `device` before `host`, never the reverse.
pub struct BlockManager {
    device_id: u32,
    block_size: usize,
    device: Mutex<BlockAllocator>,
    host: Mutex<BlockAllocator>,
    /// device id -> host id recorded at swap-out; consumed by swap-in.
    swap_map: Mutex<HashMap<BlockId, BlockId>>,
    streams: Arc<StreamSet>,
    swap_pool: Arc<rayon::ThreadPool>,
}

impl BlockManager {
    #[instrument(skip_all)]
    pub fn new(
        device_config: AllocatorConfig,
        host_config: AllocatorConfig,
        streams: Arc<StreamSet>,
        swap_pool: Arc<rayon::ThreadPool>,
    ) -> Result<Self, CoreError> {
        if device_config.block_size != host_config.block_size {
            return Err(CoreError::InvalidArgument(format!(
                "block size of device and host is not equal: {} vs {}",
                device_config.block_size, host_config.block_size
            )));
        }
        debug_assert_eq!(device_config.tier, MemoryTier::Device);
        debug_assert_eq!(host_config.tier, MemoryTier::Host);
        let device_id = device_config.device_id.unwrap_or_default();
        info!(
            device = device_id,
            device_blocks = device_config.blocks_num,
            host_blocks = host_config.blocks_num,
            block_size = device_config.block_size,
            "initializing block manager"
        );
        Ok(Self {
            device_id,
            block_size: device_config.block_size,
            device: Mutex::new(BlockAllocator::new(device_config)?),
            host: Mutex::new(BlockAllocator::new(host_config)?),
            swap_map: Mutex::new(HashMap::new()),
            streams,
            swap_pool,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn allocate(&self, n: usize) -> Result<Vec<BlockId>, CoreError> {
        self.lock_device().allocate(n)
    }

    pub fn free(&self, ids: &[BlockId]) -> Result<(), CoreError> {
        self.lock_device().free(ids)
    }

    /// Frees host-tier blocks directly; used when a swapped request is
    /// reaped without ever being swapped back in.
    pub fn free_host(&self, ids: &[BlockId]) -> Result<(), CoreError> {
        self.lock_swap_map()
            .retain(|_, host_id| !ids.contains(host_id));
        self.lock_host().free(ids)
    }

    pub fn get_ptrs(&self, ids: &[BlockId]) -> Result<Vec<NonNull<u8>>, CoreError> {
        let allocator = self.lock_device();
        ids.iter().map(|id| allocator.ptr(*id)).collect()
    }

    pub fn free_count(&self) -> usize {
        self.lock_device().free_count()
    }

    /// Device blocks free now or as soon as their in-flight copies
    /// settle. The scheduler's threshold checks use this: `allocate`
    /// waits out pending events, so in-flight blocks are real capacity.
    pub fn available_count(&self) -> usize {
        let mut allocator = self.lock_device();
        allocator.free_count() + allocator.pending_count()
    }

    pub fn host_free_count(&self) -> usize {
        self.lock_host().free_count()
    }

    pub fn total_blocks(&self) -> usize {
        self.lock_device().total_blocks()
    }

    pub fn host_total_blocks(&self) -> usize {
        self.lock_host().total_blocks()
    }

    pub fn allocate_contiguous(&self, size: usize) -> Result<u64, CoreError> {
        self.lock_device().allocate_contiguous(size)
    }

    pub fn free_contiguous(&self, alloc_id: u64) -> Result<(), CoreError> {
        self.lock_device().free_contiguous(alloc_id)
    }

    pub fn get_contiguous_ptr(&self, alloc_id: u64) -> Result<NonNull<u8>, CoreError> {
        self.lock_device().ptr_contiguous(alloc_id)
    }

    /// Moves `device_ids` to the host tier.
    ///
    /// Host blocks are reserved atomically first, so a failed swap-out
    /// leaves the world unchanged. The asynchronous D2H copies are
    /// issued on the `d2h` stream; the device ids are released against
    /// the copy event, and the `device -> host` mapping is recorded for
    /// the later swap-in.
    #[instrument(skip(self), fields(device = self.device_id))]
    pub fn swap_out(&self, device_ids: &[BlockId]) -> Result<(Vec<BlockId>, SwapFuture), CoreError> {
        let mut device = self.lock_device();
        let mut host = self.lock_host();

        let host_ids = host.allocate(device_ids.len())?;
        let copies = match build_copies(&device, &host, device_ids, &host_ids, self.block_size) {
            Ok(copies) => copies,
            Err(e) => {
                // Roll back the host reservation; nothing was submitted.
                host.free(&host_ids)?;
                return Err(e);
            }
        };
        for task in copies {
            self.streams.d2h.submit_copy(task)?;
        }
        let event = self.streams.d2h.record_event()?;
        device.free_with_event(device_ids, event.clone())?;

        let mut map = self.lock_swap_map();
        for (device_id, host_id) in device_ids.iter().zip(host_ids.iter()) {
            map.insert(*device_id, *host_id);
        }
        drop(map);

        Ok((host_ids, self.supervise(event)))
    }

    /// Moves `host_ids` back to the device tier. Only ids produced by a
    /// prior swap-out are accepted. Host ids are released against the
    /// H2D copy event.
    #[instrument(skip(self), fields(device = self.device_id))]
    pub fn swap_in(&self, host_ids: &[BlockId]) -> Result<(Vec<BlockId>, SwapFuture), CoreError> {
        {
            let map = self.lock_swap_map();
            for host_id in host_ids {
                if !map.values().any(|mapped| mapped == host_id) {
                    return Err(CoreError::InvalidArgument(format!(
                        "host block {host_id} was not produced by a swap-out"
                    )));
                }
            }
        }

        let mut device = self.lock_device();
        let mut host = self.lock_host();

        let device_ids = device.allocate(host_ids.len())?;
        let copies = match build_copies(&host, &device, host_ids, &device_ids, self.block_size) {
            Ok(copies) => copies,
            Err(e) => {
                device.free(&device_ids)?;
                return Err(e);
            }
        };
        for task in copies {
            self.streams.h2d.submit_copy(task)?;
        }
        let event = self.streams.h2d.record_event()?;
        host.free_with_event(host_ids, event.clone())?;

        self.lock_swap_map()
            .retain(|_, host_id| !host_ids.contains(host_id));

        Ok((device_ids, self.supervise(event)))
    }

    fn supervise(&self, event: DeviceEvent) -> SwapFuture {
        let (tx, rx) = oneshot::channel();
        self.swap_pool.spawn(move || {
            event.wait();
            if tx.send(()).is_err() {
                warn!("swap future dropped before completion was observed");
            }
        });
        SwapFuture { rx }
    }

    fn lock_device(&self) -> MutexGuard<'_, BlockAllocator> {
        self.device.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_host(&self) -> MutexGuard<'_, BlockAllocator> {
        self.host.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_swap_map(&self) -> MutexGuard<'_, HashMap<BlockId, BlockId>> {
        self.swap_map.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn build_copies(
    src: &BlockAllocator,
    dst: &BlockAllocator,
    src_ids: &[BlockId],
    dst_ids: &[BlockId],
    block_size: usize,
) -> Result<Vec<CopyTask>, CoreError> {
    debug_assert_eq!(src_ids.len(), dst_ids.len());
    src_ids
        .iter()
        .zip(dst_ids.iter())
        .map(|(src_id, dst_id)| {
            Ok(CopyTask {
                src: src.ptr(*src_id)?.as_ptr() as *const u8,
                dst: dst.ptr(*dst_id)?.as_ptr(),
                len: block_size,
                src_region: src.region().clone(),
                dst_region: dst.region().clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn manager(
        device_blocks: usize,
        host_blocks: usize,
        block_size: usize,
    ) -> (BlockManager, Context) {
        let context = Context::new(1, 1).unwrap();
        let swap_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .build()
                .unwrap(),
        );
        let manager = BlockManager::new(
            AllocatorConfig {
                blocks_num: device_blocks,
                block_size,
                tier: MemoryTier::Device,
                device_id: Some(0),
            },
            AllocatorConfig {
                blocks_num: host_blocks,
                block_size,
                tier: MemoryTier::Host,
                device_id: Some(0),
            },
            context.streams(0).clone(),
            swap_pool,
        )
        .unwrap();
        (manager, context)
    }

    fn write(addr: NonNull<u8>, bytes: &[u8]) {
        // SAFETY: test-local blocks, no concurrent access.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_ptr(), bytes.len()) };
    }

    fn read(addr: NonNull<u8>, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        // SAFETY: test-local blocks, no concurrent access.
        unsafe { std::ptr::copy_nonoverlapping(addr.as_ptr(), out.as_mut_ptr(), len) };
        out
    }

    #[test]
    fn mismatched_block_sizes_are_rejected() {
        let context = Context::new(1, 1).unwrap();
        let swap_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(1)
                .build()
                .unwrap(),
        );
        let result = BlockManager::new(
            AllocatorConfig {
                blocks_num: 1,
                block_size: 512,
                tier: MemoryTier::Device,
                device_id: Some(0),
            },
            AllocatorConfig {
                blocks_num: 1,
                block_size: 1024,
                tier: MemoryTier::Host,
                device_id: Some(0),
            },
            context.streams(0).clone(),
            swap_pool,
        );
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn swap_round_trip_preserves_data() {
        let (manager, _context) = manager(2, 2, 1024);

        let blocks = manager.allocate(2).unwrap();
        assert_eq!(blocks.len(), 2);

        let addrs = manager.get_ptrs(&blocks).unwrap();
        write(addrs[0], b"string_a");
        write(addrs[1], b"string_b");

        let (host_blocks, future) = manager.swap_out(&blocks).unwrap();
        future.wait().await.unwrap();
        assert_eq!(manager.host_free_count(), 0);
        assert_eq!(manager.free_count(), 2);

        // Clobber the (now recycled) device addresses.
        write(addrs[0], b"string_x");
        write(addrs[1], b"string_x");

        let (device_blocks, future) = manager.swap_in(&host_blocks).unwrap();
        future.wait().await.unwrap();
        let addrs = manager.get_ptrs(&device_blocks).unwrap();
        assert_eq!(read(addrs[0], 8), b"string_a");
        assert_eq!(read(addrs[1], 8), b"string_b");

        manager.free(&device_blocks).unwrap();
        assert_eq!(manager.free_count(), 2);
        assert_eq!(manager.host_free_count(), 2);
    }

    #[tokio::test]
    async fn swap_out_without_host_capacity_changes_nothing() {
        let (manager, _context) = manager(2, 1, 256);
        let blocks = manager.allocate(2).unwrap();
        assert!(matches!(
            manager.swap_out(&blocks),
            Err(CoreError::OutOfMemory(_))
        ));
        // Device blocks are still live and the host pool untouched.
        assert!(manager.get_ptrs(&blocks).is_ok());
        assert_eq!(manager.host_free_count(), 1);
        manager.free(&blocks).unwrap();
    }

    #[tokio::test]
    async fn swap_in_rejects_unknown_host_blocks() {
        let (manager, _context) = manager(2, 2, 256);
        assert!(matches!(
            manager.swap_in(&[1]),
            Err(CoreError::InvalidArgument(_))
        ));
    }
}
