use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use crate::block_manager::BlockManager;
use crate::error::CoreError;
use crate::sampling::{Sampler, SamplingConfig};
use crate::types::{BlockId, ReadLock, TokenId, WriteLock};
use crate::worker::WorkerGroup;

/// Lifecycle stage of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferStage {
    /// First forward pass over the whole prompt.
    Prefill,
    /// Producing one output token per step.
    Decode,
    /// Blocks moved to the host tier under memory pressure.
    Swapped,
    Finished,
    Aborted,
}

impl InferStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InferStage::Finished | InferStage::Aborted)
    }
}

/// Why a request was aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    Cancelled,
    Timeout,
    OutOfMemory,
    Terminated,
    Internal,
}

/// Terminal status of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum FinishReason {
    /// The EOS token was emitted.
    EndOfSequence,
    /// The output-length limit was reached.
    LengthCapped,
    Aborted(AbortReason),
}

/// One-shot completion waiter. `notify` signals exactly once; later
/// calls are no-ops.
#[derive(Debug, Default)]
pub struct Waiter {
    signaled: AtomicBool,
    notify: Notify,
}

impl Waiter {
    pub fn notify(&self) {
        if !self.signaled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag: `notify_waiters` wakes
            // only registered waiters, so the other order can lose a
            // signal that lands between the check and the await.
            notified.as_mut().enable();
            if self.signaled.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Direction of an in-flight swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapDirection {
    Out,
    In,
}

/// Mutable request state, serialized by the scheduler mutex for queue
/// transitions and read by workers through snapshots.
#[derive(Debug)]
pub struct RequestState {
    pub stage: InferStage,
    /// Decode step counter: 1 after prefill, then 2, 3, ...
    pub step: u32,
    /// Device block ids backing the KV cache, indexed by accelerator.
    pub kv_cache_blocks: Vec<Vec<BlockId>>,
    /// Host block ids while swapped out, indexed by accelerator.
    pub host_kv_cache_blocks: Vec<Vec<BlockId>>,
    /// A swap copy is still in flight.
    pub swap_pending: bool,
    pub swap_direction: Option<SwapDirection>,
    /// Set when the scheduler admits the request into the running batch.
    pub admitted_at: Option<Instant>,
    /// Row of this request in the step's logits buffer.
    pub logits_offset: usize,
    /// Prompt padding up to the block boundary.
    pub padded_size: usize,
    pub finish_reason: Option<FinishReason>,
}

/// The unit of scheduling: one client request with its token state,
/// sampling configuration, per-accelerator block lists, and waiters.
///
/// Block managers are injected at construction; request state holds
/// block ids only and resolves them to pointers at the point of
/// compute.
pub struct InferRequest {
    /// Runtime-assigned monotone id.
    pub req_id: u64,
    /// Client-chosen identifier, echoed in responses.
    pub request_id: String,
    pub input_tokens: Vec<TokenId>,
    /// Always contains `input_tokens` as a prefix. Guarded by the
    /// output mutex: the sampling path appends while the response path
    /// reads.
    output_tokens: Mutex<Vec<TokenId>>,
    pub sampling_config: SamplingConfig,
    sampler: Mutex<Sampler>,
    state: RwLock<RequestState>,
    aborted: AtomicBool,
    waiter: Waiter,
    step_notify: Notify,
    /// Wall-clock enqueue time in milliseconds since the epoch.
    pub timestamp_admit_ms: u64,
    enqueued_at: Instant,
    /// Tokens served from the prefix cache; they need no fresh blocks.
    pub prefix_cache_len: usize,
    block_token_num: usize,
    block_managers: Vec<Arc<BlockManager>>,
}

impl InferRequest {
    pub fn new(
        req_id: u64,
        request_id: String,
        input_tokens: Vec<TokenId>,
        sampling_config: SamplingConfig,
        block_token_num: usize,
        block_managers: Vec<Arc<BlockManager>>,
    ) -> Self {
        let seed = sampling_config.random_seed.unwrap_or(req_id);
        let device_count = block_managers.len();
        let timestamp_admit_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            req_id,
            request_id,
            output_tokens: Mutex::new(input_tokens.clone()),
            input_tokens,
            sampling_config,
            sampler: Mutex::new(Sampler::new(seed)),
            state: RwLock::new(RequestState {
                stage: InferStage::Prefill,
                step: 0,
                kv_cache_blocks: vec![Vec::new(); device_count],
                host_kv_cache_blocks: vec![Vec::new(); device_count],
                swap_pending: false,
                swap_direction: None,
                admitted_at: None,
                logits_offset: 0,
                padded_size: 0,
                finish_reason: None,
            }),
            aborted: AtomicBool::new(false),
            waiter: Waiter::default(),
            step_notify: Notify::new(),
            timestamp_admit_ms,
            enqueued_at: Instant::now(),
            prefix_cache_len: 0,
            block_token_num,
            block_managers,
        }
    }

    /// Signals the completion waiter. Idempotent.
    pub fn notify_finished(&self) {
        trace!(req_id = self.req_id, "request finished");
        self.waiter.notify();
    }

    /// Signals the step waiter; paired one-to-one with the scheduler's
    /// step barrier.
    pub fn notify_step(&self) {
        self.step_notify.notify_waiters();
    }

    pub async fn wait_finished(&self) {
        self.waiter.wait().await;
    }

    pub async fn wait_step(&self) {
        self.step_notify.notified().await;
    }

    /// Requests cancellation. The scheduler reaps the request at the
    /// end of the current tick; an in-flight step is not interrupted.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn waiting_age_ms(&self) -> u64 {
        self.enqueued_at.elapsed().as_millis() as u64
    }

    /// Appends one sampled token. Called by the sampling path only.
    pub fn append_output_token(&self, token: TokenId) {
        self.lock_output().push(token);
    }

    pub fn output_tokens(&self) -> Vec<TokenId> {
        self.lock_output().clone()
    }

    pub fn last_output_token(&self) -> Option<TokenId> {
        self.lock_output().last().copied()
    }

    /// Total tokens incl. the prompt.
    pub fn total_tokens(&self) -> usize {
        self.lock_output().len()
    }

    /// Tokens generated beyond the prompt.
    pub fn generated_len(&self) -> usize {
        self.total_tokens() - self.input_tokens.len()
    }

    /// Blocks needed per accelerator to back `token_count` tokens.
    pub fn required_blocks(&self, token_count: usize) -> usize {
        let fresh = token_count.saturating_sub(self.prefix_cache_len);
        fresh.div_ceil(self.block_token_num)
    }

    /// True when the most recent token landed exactly on a block
    /// boundary, i.e. the next decode step needs one more block.
    pub fn last_block_is_full(&self) -> bool {
        let fresh = self.total_tokens().saturating_sub(self.prefix_cache_len);
        fresh > 0 && fresh % self.block_token_num == 0
    }

    pub fn sampler(&self) -> MutexGuard<'_, Sampler> {
        self.sampler.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn block_managers(&self) -> &[Arc<BlockManager>] {
        &self.block_managers
    }

    /// Resolves this request's block list on one accelerator to
    /// addresses, at the immediate point of compute.
    pub fn block_ptrs_on(&self, device_id: u32) -> Result<Vec<NonNull<u8>>, CoreError> {
        let state = self.read_lock()?;
        let ids = &state.kv_cache_blocks[device_id as usize];
        self.block_managers[device_id as usize].get_ptrs(ids)
    }

    /// Resolves the per-accelerator block lists to addresses through
    /// each accelerator's block manager.
    pub fn get_block_ptrs(&self) -> Result<Vec<Vec<NonNull<u8>>>, CoreError> {
        (0..self.block_managers.len() as u32)
            .map(|device_id| self.block_ptrs_on(device_id))
            .collect()
    }

    /// Per-accelerator addresses of this request's logits row, the
    /// output of forward and input of sampling.
    pub fn get_logits_ptrs(&self, workers: &WorkerGroup) -> Result<Vec<NonNull<f32>>, CoreError> {
        let offset = self.read_lock()?.logits_offset;
        (0..self.block_managers.len() as u32)
            .map(|rank| workers.logits_ptr(rank, offset))
            .collect()
    }

    pub fn stage(&self) -> Result<InferStage, CoreError> {
        Ok(self.read_lock()?.stage)
    }

    pub fn finish_reason(&self) -> Result<Option<FinishReason>, CoreError> {
        Ok(self.read_lock()?.finish_reason)
    }

    fn lock_output(&self) -> MutexGuard<'_, Vec<TokenId>> {
        self.output_tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReadLock for InferRequest {
    type Inner = RequestState;

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, RequestState>, CoreError> {
        self.state
            .read()
            .map_err(|e| CoreError::Runtime(format!("request state lock poisoned: {e}")))
    }
}

impl WriteLock for InferRequest {
    type Inner = RequestState;

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, RequestState>, CoreError> {
        self.state
            .write()
            .map_err(|e| CoreError::Runtime(format!("request state lock poisoned: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: Vec<TokenId>) -> InferRequest {
        InferRequest::new(
            1,
            "req-1".into(),
            input,
            SamplingConfig::default(),
            16,
            Vec::new(),
        )
    }

    #[test]
    fn output_tokens_start_with_the_prompt() {
        let req = request(vec![5, 6, 7]);
        assert_eq!(req.output_tokens(), vec![5, 6, 7]);
        req.append_output_token(8);
        assert_eq!(req.generated_len(), 1);
        assert_eq!(req.output_tokens(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn block_demand_follows_token_count() {
        let req = request((0..33).collect());
        assert_eq!(req.required_blocks(33), 3);
        assert_eq!(req.required_blocks(32), 2);
        assert!(!req.last_block_is_full());
    }

    #[tokio::test]
    async fn completion_waiter_is_idempotent() {
        let req = request(vec![1]);
        req.notify_finished();
        req.notify_finished();
        // A waiter arriving after the signal returns immediately.
        req.wait_finished().await;
        assert!(req.waiter.is_signaled());
    }
}
