use std::collections::{HashMap, HashSet, VecDeque};
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{error, instrument, trace};

use crate::error::CoreError;
use crate::memory::region::MemoryRegion;
use crate::stream::DeviceEvent;
use crate::types::{BlockId, MemoryTier};

/// Construction parameters for one block pool.
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Number of fixed-size blocks in the pool.
    pub blocks_num: usize,
    /// Size of every block in bytes. Must match across tiers.
    pub block_size: usize,
    /// Which tier this pool lives on.
    pub tier: MemoryTier,
    /// Owning accelerator, for the device tier.
    pub device_id: Option<u32>,
}

/// Blocks released against a pending stream event. They rejoin the free
/// list only once the event has fired, so a swapped-out block cannot be
/// reissued while its copy is still in flight.
#[derive(Debug)]
struct HeldBlocks {
    event: DeviceEvent,
    ids: Vec<BlockId>,
}

/// Fixed-size block pool over one contiguous reservation, plus a
/// freelist arena for contiguous (non-paged) allocations.
///
/// Block ids are `1..=blocks_num` and stable for the pool's lifetime.
/// The free list is LIFO: recently freed blocks are reissued first.
/// Contiguous ids live in a disjoint numbering space and are never
/// reissued once freed.
#[derive(Debug)]
pub struct BlockAllocator {
    config: AllocatorConfig,
    region: Arc<MemoryRegion>,
    free_blocks: Vec<BlockId>,
    allocated: HashSet<BlockId>,
    held_back: VecDeque<HeldBlocks>,
    contiguous: HashMap<u64, Arc<MemoryRegion>>,
    next_contiguous_id: u64,
}

impl BlockAllocator {
    pub fn new(config: AllocatorConfig) -> Result<Self, CoreError> {
        if config.blocks_num == 0 || config.block_size == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "block pool needs positive blocks_num and block_size, got {} x {}",
                config.blocks_num, config.block_size
            )));
        }
        let region = Arc::new(MemoryRegion::reserve(
            config.blocks_num * config.block_size,
            config.tier,
            config.device_id,
        )?);
        // Reversed so the first allocations come out as 1, 2, 3, ...
        let free_blocks = (1..=config.blocks_num as BlockId).rev().collect();
        Ok(Self {
            config,
            region,
            free_blocks,
            allocated: HashSet::new(),
            held_back: VecDeque::new(),
            contiguous: HashMap::new(),
            next_contiguous_id: 1,
        })
    }

    /// Allocates exactly `n` blocks, or fails without side effects.
    ///
    /// Blocks released against a still-pending event are only handed out
    /// after the event fires; if the ready free list is short, this
    /// waits on the oldest pending events (copies already in flight,
    /// short relative to a forward step) before reporting `OutOfMemory`.
    #[instrument(skip(self), fields(tier = ?self.config.tier))]
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, CoreError> {
        if n == 0 {
            return Err(CoreError::InvalidArgument("allocate(0) is meaningless".into()));
        }
        self.reclaim_ready();
        while self.free_blocks.len() < n {
            match self.held_back.pop_front() {
                Some(held) => {
                    held.event.wait();
                    self.free_blocks.extend(held.ids);
                }
                None => break,
            }
        }
        if self.free_blocks.len() < n {
            error!(
                requested = n,
                free = self.free_blocks.len(),
                "block pool exhausted"
            );
            return Err(CoreError::OutOfMemory(format!(
                "requested {n} blocks, only {} free on {:?} tier",
                self.free_blocks.len(),
                self.config.tier
            )));
        }
        let split = self.free_blocks.len() - n;
        let ids = self.free_blocks.split_off(split);
        self.allocated.extend(ids.iter().copied());
        trace!(?ids, "allocated blocks");
        Ok(ids)
    }

    /// Returns blocks to the free list. The whole call is rejected, with
    /// no mutation, if any id is unknown or already free.
    pub fn free(&mut self, ids: &[BlockId]) -> Result<(), CoreError> {
        self.check_live(ids)?;
        for id in ids {
            self.allocated.remove(id);
            self.free_blocks.push(*id);
        }
        Ok(())
    }

    /// Returns blocks against a pending stream event. The ids become
    /// allocatable only once `event` fires.
    pub fn free_with_event(&mut self, ids: &[BlockId], event: DeviceEvent) -> Result<(), CoreError> {
        self.check_live(ids)?;
        for id in ids {
            self.allocated.remove(id);
        }
        self.held_back.push_back(HeldBlocks {
            event,
            ids: ids.to_vec(),
        });
        Ok(())
    }

    /// Address of an allocated block.
    pub fn ptr(&self, id: BlockId) -> Result<NonNull<u8>, CoreError> {
        if !self.allocated.contains(&id) {
            return Err(CoreError::InvalidArgument(format!(
                "block {id} is not currently allocated"
            )));
        }
        Ok(self
            .region
            .ptr_at((id as usize - 1) * self.config.block_size))
    }

    /// Number of immediately allocatable blocks. Blocks held back on a
    /// pending event count once the event has fired.
    pub fn free_count(&mut self) -> usize {
        self.reclaim_ready();
        self.free_blocks.len()
    }

    /// Blocks parked behind a still-pending event. They are neither
    /// free nor attached to a request; the accounting identity counts
    /// them as in flight.
    pub fn pending_count(&self) -> usize {
        self.held_back.iter().map(|held| held.ids.len()).sum()
    }

    pub fn total_blocks(&self) -> usize {
        self.config.blocks_num
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub(crate) fn region(&self) -> &Arc<MemoryRegion> {
        &self.region
    }

    /// Services a contiguous (non-paged) allocation of `size` bytes.
    /// Returned ids are positive, monotonically increasing, and never
    /// reissued.
    pub fn allocate_contiguous(&mut self, size: usize) -> Result<u64, CoreError> {
        let region = Arc::new(MemoryRegion::reserve(
            size,
            self.config.tier,
            self.config.device_id,
        )?);
        let alloc_id = self.next_contiguous_id;
        self.next_contiguous_id += 1;
        self.contiguous.insert(alloc_id, region);
        Ok(alloc_id)
    }

    /// Frees a contiguous allocation. Freeing twice is an error.
    pub fn free_contiguous(&mut self, alloc_id: u64) -> Result<(), CoreError> {
        self.contiguous.remove(&alloc_id).map(|_| ()).ok_or_else(|| {
            CoreError::InvalidArgument(format!("contiguous allocation {alloc_id} is not live"))
        })
    }

    pub fn ptr_contiguous(&self, alloc_id: u64) -> Result<NonNull<u8>, CoreError> {
        self.contiguous
            .get(&alloc_id)
            .map(|region| region.ptr_at(0))
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!("contiguous allocation {alloc_id} is not live"))
            })
    }

    fn reclaim_ready(&mut self) {
        while self
            .held_back
            .front()
            .is_some_and(|held| held.event.query())
        {
            if let Some(held) = self.held_back.pop_front() {
                self.free_blocks.extend(held.ids);
            }
        }
    }

    fn check_live(&self, ids: &[BlockId]) -> Result<(), CoreError> {
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if !self.allocated.contains(id) || !seen.insert(*id) {
                error!(block = id, "double free or unknown block id");
                return Err(CoreError::InvalidArgument(format!(
                    "block {id} is not currently allocated"
                )));
            }
        }
        Ok(())
    }
}
