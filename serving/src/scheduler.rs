use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::block_manager::{BlockManager, SwapFuture};
use crate::config::BatchSchedulerConfig;
use crate::error::CoreError;
use crate::model_executor::{ForwardBatch, ForwardEntry, ForwardShape};
use crate::request::{AbortReason, FinishReason, InferRequest, InferStage, SwapDirection};
use crate::types::{GenerateRequest, MemoryTier, ReadLock, TokenId, WriteLock};
use crate::worker::WorkerGroup;

/// Poll cadence when no wakeup arrives; bounds the latency of
/// waiting-queue timeout scans.
const TICK_PERIOD: Duration = Duration::from_millis(20);

/// The three scheduler queues. A request is in exactly one of them at
/// any time; transitions are serialized by the scheduler mutex, which
/// also guards per-request stage changes.
#[derive(Default)]
struct SchedulerState {
    waiting: VecDeque<Arc<InferRequest>>,
    running: Vec<Arc<InferRequest>>,
    swapped: VecDeque<Arc<InferRequest>>,
}

/// Continuous-batching scheduler.
///
/// One cooperative task drives step ticks. Each tick reaps terminal
/// requests, resumes swapped requests when memory allows, relieves
/// memory pressure by swapping victims out, admits waiting prefills,
/// and runs one forward + sampling step over the running batch. The
/// scheduler mutex is released while workers run.
pub struct BatchScheduler {
    config: BatchSchedulerConfig,
    block_token_num: usize,
    eos_token_id: TokenId,
    block_managers: Vec<Arc<BlockManager>>,
    workers: WorkerGroup,
    state: Mutex<SchedulerState>,
    wakeup: Arc<Notify>,
    next_req_id: AtomicU64,
}

impl BatchScheduler {
    pub fn new(
        config: BatchSchedulerConfig,
        block_token_num: usize,
        eos_token_id: TokenId,
        block_managers: Vec<Arc<BlockManager>>,
        workers: WorkerGroup,
    ) -> Self {
        Self {
            config,
            block_token_num,
            eos_token_id,
            block_managers,
            workers,
            state: Mutex::new(SchedulerState::default()),
            wakeup: Arc::new(Notify::new()),
            next_req_id: AtomicU64::new(1),
        }
    }

    pub fn workers(&self) -> &WorkerGroup {
        &self.workers
    }

    /// Accepts a request into the waiting queue. Never blocks a step:
    /// the caller gets the request handle back immediately and observes
    /// progress through its waiters.
    #[instrument(skip_all, fields(request_id = %request.request_id))]
    pub fn enqueue(&self, request: GenerateRequest) -> Result<Arc<InferRequest>, CoreError> {
        // Queue capacity is checked before anything about the request
        // itself: a full queue answers `Backpressure` even to a prompt
        // that would also be invalid.
        let mut state = self.lock_state();
        if state.waiting.len() >= self.config.max_waiting_queue_len {
            counter!("scheduler-backpressure-total").increment(1);
            return Err(CoreError::Backpressure(format!(
                "waiting queue is full ({} requests)",
                state.waiting.len()
            )));
        }
        if request.input_tokens.is_empty() {
            return Err(CoreError::InvalidArgument("empty prompt".into()));
        }
        if request.input_tokens.len() > self.config.max_input_len {
            return Err(CoreError::InvalidArgument(format!(
                "prompt of {} tokens exceeds max_input_len {}",
                request.input_tokens.len(),
                self.config.max_input_len
            )));
        }

        let req = Arc::new(InferRequest::new(
            self.next_req_id.fetch_add(1, Ordering::Relaxed),
            request.request_id,
            request.input_tokens,
            request.sampling,
            self.block_token_num,
            self.block_managers.clone(),
        ));
        state.waiting.push_back(req.clone());
        drop(state);

        counter!("scheduler-requests-total").increment(1);
        self.wakeup.notify_one();
        Ok(req)
    }

    /// Drives step ticks until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoreError> {
        info!("batch scheduler started");
        loop {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(TICK_PERIOD) => {}
                _ = shutdown.changed() => {
                    info!("batch scheduler shutting down");
                    self.drain()?;
                    return Ok(());
                }
            }
            if let Err(e) = self.tick().await {
                // Keep the system live; the failed tick's requests have
                // been aborted individually.
                error!("scheduler tick failed: {e}");
            }
        }
    }

    /// One step: phases 1-5 under the mutex, forward with the mutex
    /// released, then collect and notify under the mutex again.
    pub(crate) async fn tick(&self) -> Result<(), CoreError> {
        let batch = {
            let mut state = self.lock_state();
            self.reap(&mut state)?;
            self.try_swap_in(&mut state)?;
            self.relieve_pressure(&mut state)?;
            self.admit(&mut state)?;
            self.assemble(&state)?
        };
        let Some(batch) = batch else {
            return Ok(());
        };

        let started = Instant::now();
        let result = self.workers.execute_step(batch.clone()).await;
        histogram!("scheduler-step-seconds").record(started.elapsed().as_secs_f32());

        let mut state = self.lock_state();
        match result {
            Ok(()) => self.collect(&mut state, &batch)?,
            Err(e) => {
                error!("step execution failed, aborting the batch: {e}");
                for entry in &batch.entries {
                    self.finish(&entry.request, FinishReason::Aborted(AbortReason::Internal))?;
                }
            }
        }
        // Phase 8: one step signal per request in the batch.
        for entry in &batch.entries {
            entry.request.notify_step();
        }
        gauge!("scheduler-running-requests").set(state.running.len() as f64);
        // Terminal requests are reaped (and their waiters signaled) at
        // the top of the next tick.
        self.wakeup.notify_one();
        Ok(())
    }

    /// Phase 1: remove terminal requests and expired waiters, release
    /// their blocks, and signal their completion waiters.
    fn reap(&self, state: &mut SchedulerState) -> Result<(), CoreError> {
        // Waiting queue: client aborts and admission timeouts.
        let timeout_ms = self.config.waiting_timeout_in_ms;
        let mut kept = VecDeque::with_capacity(state.waiting.len());
        for req in state.waiting.drain(..) {
            if req.is_aborted() {
                self.finish(&req, FinishReason::Aborted(AbortReason::Cancelled))?;
                self.signal_finished(&req);
            } else if req.waiting_age_ms() > timeout_ms {
                warn!(req_id = req.req_id, "request timed out in the waiting queue");
                counter!("scheduler-waiting-timeouts-total").increment(1);
                self.finish(&req, FinishReason::Aborted(AbortReason::Timeout))?;
                self.signal_finished(&req);
            } else {
                kept.push_back(req);
            }
        }
        state.waiting = kept;

        // Running queue: requests marked terminal during collect.
        let mut still_running = Vec::with_capacity(state.running.len());
        for req in state.running.drain(..) {
            let stage = req.stage()?;
            if stage.is_terminal() {
                self.release_device_blocks(&req)?;
                self.signal_finished(&req);
            } else {
                still_running.push(req);
            }
        }
        state.running = still_running;

        // Swapped queue: aborted requests are reaped once their copy
        // settled; host blocks cannot be touched mid-flight.
        let mut kept = VecDeque::with_capacity(state.swapped.len());
        for req in state.swapped.drain(..) {
            let settled = !req.read_lock()?.swap_pending;
            if req.is_aborted() && settled {
                self.release_device_blocks(&req)?;
                self.release_host_blocks(&req)?;
                self.finish(&req, FinishReason::Aborted(AbortReason::Cancelled))?;
                self.signal_finished(&req);
            } else {
                kept.push_back(req);
            }
        }
        state.swapped = kept;
        Ok(())
    }

    /// Phase 2: promote settled swap-ins, then resume further swapped
    /// requests while device memory and batch capacity allow.
    fn try_swap_in(&self, state: &mut SchedulerState) -> Result<(), CoreError> {
        // Promote requests whose swap-in copies have settled, as long as
        // the batch has room for them.
        let mut kept = VecDeque::with_capacity(state.swapped.len());
        for req in state.swapped.drain(..) {
            let settled_in = {
                let st = req.read_lock()?;
                st.swap_direction == Some(SwapDirection::In) && !st.swap_pending
            };
            if settled_in && state.running.len() < self.config.max_batch_size {
                let mut st = req.write_lock()?;
                st.swap_direction = None;
                st.stage = InferStage::Decode;
                drop(st);
                counter!("scheduler-swapins-total").increment(1);
                state.running.push(req);
            } else {
                kept.push_back(req);
            }
        }
        state.swapped = kept;

        // Resume swapped requests oldest first; a request whose
        // swap-out is still in flight blocks younger ones from jumping
        // the queue. Requests with a swap-in already issued count
        // against batch capacity but are skipped over.
        let mut index = 0;
        while index < state.swapped.len() {
            let req = state.swapped[index].clone();
            {
                let st = req.read_lock()?;
                if st.swap_direction == Some(SwapDirection::In) {
                    index += 1;
                    continue;
                }
                if st.swap_pending {
                    break;
                }
            }
            let inflight = self.inflight_swap_ins(state)?;
            if state.running.len() + inflight >= self.config.max_batch_size
                || self.batch_tokens(state)? + inflight + 1 > self.config.max_token_number
            {
                break;
            }
            let need = req.required_blocks(req.total_tokens());
            let free = self.block_managers[0].available_count();
            if (free as f32) < self.config.swapin_block_threshold * need as f32 {
                self.report_starvation_if_stuck(state, &req, need)?;
                break;
            }

            match self.issue_swap_in(&req) {
                Ok(()) => {
                    // Stays in the swapped queue with its copies in
                    // flight; it joins the running batch once they
                    // settle.
                    index += 1;
                }
                Err(e) => {
                    warn!(req_id = req.req_id, "swap-in failed: {e}");
                    state.swapped.retain(|r| !Arc::ptr_eq(r, &req));
                    self.release_host_blocks(&req)?;
                    self.finish(&req, FinishReason::Aborted(AbortReason::OutOfMemory))?;
                    self.signal_finished(&req);
                }
            }
        }
        Ok(())
    }

    /// Swapped-queue entries whose swap-in copies are still in flight;
    /// they already hold device blocks and a future batch slot.
    fn inflight_swap_ins(&self, state: &SchedulerState) -> Result<usize, CoreError> {
        let mut count = 0;
        for req in &state.swapped {
            if req.read_lock()?.swap_direction == Some(SwapDirection::In) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Phase 3: when free device blocks run low, swap out victims —
    /// largest block count first, then youngest admission, then higher
    /// req id.
    fn relieve_pressure(&self, state: &mut SchedulerState) -> Result<(), CoreError> {
        loop {
            let demand = state
                .running
                .iter()
                .filter(|req| matches!(req.stage().ok(), Some(InferStage::Decode)))
                .count();
            if demand == 0 {
                return Ok(());
            }
            let free = self.block_managers[0].available_count();
            if (free as f32) >= self.config.swapout_block_threshold * demand as f32 {
                return Ok(());
            }

            let Some(victim) = self.select_victim(state)? else {
                return Ok(());
            };
            debug!(req_id = victim.req_id, "swapping out under memory pressure");
            counter!("scheduler-swapouts-total").increment(1);
            state.running.retain(|req| !Arc::ptr_eq(req, &victim));
            match self.issue_swap_out(&victim) {
                Ok(()) => state.swapped.push_back(victim),
                Err(e) => {
                    // Host tier exhausted: the request cannot be saved.
                    warn!(req_id = victim.req_id, "swap-out failed: {e}");
                    self.release_device_blocks(&victim)?;
                    self.finish(&victim, FinishReason::Aborted(AbortReason::OutOfMemory))?;
                    self.signal_finished(&victim);
                }
            }
        }
    }

    /// Phase 4: admit waiting prefills in arrival order while batch,
    /// token, and block budgets hold.
    fn admit(&self, state: &mut SchedulerState) -> Result<(), CoreError> {
        while let Some(front) = state.waiting.front().cloned() {
            // In-flight swap-ins hold batch slots they have not claimed
            // yet; admitting into them would overflow the batch later.
            let inflight = self.inflight_swap_ins(state)?;
            if state.running.len() + inflight >= self.config.max_batch_size {
                break;
            }
            if self.batch_tokens(state)? + inflight + front.total_tokens()
                > self.config.max_token_number
            {
                break;
            }
            let need = front.required_blocks(front.total_tokens());
            let free = self.block_managers[0].available_count();
            if (free as f32) < self.config.launch_block_threshold * need as f32 {
                break;
            }

            match self.allocate_everywhere(need) {
                Ok(per_device) => {
                    let mut st = front.write_lock()?;
                    st.kv_cache_blocks = per_device;
                    st.stage = InferStage::Prefill;
                    st.admitted_at = Some(Instant::now());
                    st.padded_size = need * self.block_token_num - front.total_tokens();
                    drop(st);
                    state.waiting.pop_front();
                    state.running.push(front);
                    counter!("scheduler-admissions-total").increment(1);
                }
                Err(e) => {
                    // Recoverable: the request stays at the front of the
                    // waiting queue and admission stops for this tick.
                    debug!("admission paused, allocation failed: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Phase 5: gather the running batch into the shape the attention
    /// kernels expect.
    fn assemble(&self, state: &SchedulerState) -> Result<Option<Arc<ForwardBatch>>, CoreError> {
        if state.running.is_empty() {
            return Ok(None);
        }
        let mut entries = Vec::with_capacity(state.running.len());
        let mut max_tokens = 0;
        let mut layer_block_num = 0;
        for (slot, req) in state.running.iter().enumerate() {
            let mut st = req.write_lock()?;
            st.logits_offset = slot;
            let stage = if st.step == 0 {
                InferStage::Prefill
            } else {
                InferStage::Decode
            };
            layer_block_num = layer_block_num.max(st.kv_cache_blocks[0].len());
            drop(st);

            let tokens = match stage {
                InferStage::Prefill => req.output_tokens(),
                _ => vec![req.last_output_token().ok_or_else(|| {
                    CoreError::Runtime("decode-stage request with no tokens".into())
                })?],
            };
            max_tokens = max_tokens.max(tokens.len());
            entries.push(ForwardEntry {
                request: req.clone(),
                stage,
                tokens,
                logits_offset: slot,
            });
        }
        let shape = ForwardShape {
            batch_size: entries.len(),
            max_tokens,
            layer_block_num,
        };
        Ok(Some(Arc::new(ForwardBatch {
            entries,
            shape,
            block_token_num: self.block_token_num,
        })))
    }

    /// Phase 7: account the sampled token, advance the step counter,
    /// evaluate termination, and top up blocks at block boundaries.
    fn collect(&self, state: &mut SchedulerState, batch: &ForwardBatch) -> Result<(), CoreError> {
        for entry in &batch.entries {
            let req = &entry.request;
            {
                let mut st = req.write_lock()?;
                st.step += 1;
                if st.stage == InferStage::Prefill {
                    st.stage = InferStage::Decode;
                }
            }

            let emitted_eos = !req.sampling_config.ignore_eos
                && req.last_output_token() == Some(self.eos_token_id);
            if emitted_eos {
                self.finish(req, FinishReason::EndOfSequence)?;
                continue;
            }
            if req.generated_len() >= self.config.max_output_len {
                self.finish(req, FinishReason::LengthCapped)?;
                continue;
            }
            if req.is_aborted() {
                self.finish(req, FinishReason::Aborted(AbortReason::Cancelled))?;
                continue;
            }

            // The step just filled the last block: pre-request one more
            // on every accelerator so the next step has a slot.
            if req.last_block_is_full() {
                match self.allocate_everywhere(1) {
                    Ok(per_device) => {
                        let mut st = req.write_lock()?;
                        for (device, mut ids) in per_device.into_iter().enumerate() {
                            st.kv_cache_blocks[device].append(&mut ids);
                        }
                    }
                    Err(_) => {
                        // Recoverable: park the request on the host tier.
                        debug!(req_id = req.req_id, "decode-time allocation failed, swapping out");
                        counter!("scheduler-swapouts-total").increment(1);
                        state.running.retain(|r| !Arc::ptr_eq(r, req));
                        match self.issue_swap_out(req) {
                            Ok(()) => state.swapped.push_back(req.clone()),
                            Err(e) => {
                                warn!(req_id = req.req_id, "swap-out failed: {e}");
                                self.release_device_blocks(req)?;
                                self.finish(req, FinishReason::Aborted(AbortReason::OutOfMemory))?;
                                self.signal_finished(req);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Aborts and drains everything at shutdown.
    fn drain(&self) -> Result<(), CoreError> {
        let mut state = self.lock_state();
        let mut all: Vec<_> = state.waiting.drain(..).collect();
        all.extend(state.running.drain(..));
        all.extend(state.swapped.drain(..));
        drop(state);
        for req in all {
            if !req.stage()?.is_terminal() {
                let settled = !req.read_lock()?.swap_pending;
                if settled {
                    self.release_device_blocks(&req)?;
                    self.release_host_blocks(&req)?;
                }
                self.finish(&req, FinishReason::Aborted(AbortReason::Terminated))?;
            }
            self.signal_finished(&req);
        }
        Ok(())
    }

    fn select_victim(&self, state: &SchedulerState) -> Result<Option<Arc<InferRequest>>, CoreError> {
        let mut candidates = Vec::new();
        for req in &state.running {
            let st = req.read_lock()?;
            if st.stage != InferStage::Decode || st.step == 0 {
                continue;
            }
            candidates.push((
                st.kv_cache_blocks[0].len(),
                st.admitted_at.unwrap_or_else(Instant::now),
                req.req_id,
                req.clone(),
            ));
        }
        // Largest block count first; youngest admission breaks block
        // ties; higher req id breaks admission ties.
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| b.2.cmp(&a.2))
        });
        Ok(candidates.into_iter().next().map(|(_, _, _, req)| req))
    }

    fn issue_swap_out(&self, req: &Arc<InferRequest>) -> Result<(), CoreError> {
        let kv_blocks = req.read_lock()?.kv_cache_blocks.clone();
        let mut host_blocks = Vec::with_capacity(kv_blocks.len());
        let mut futures = Vec::with_capacity(kv_blocks.len());
        for (manager, ids) in self.block_managers.iter().zip(kv_blocks.iter()) {
            match manager.swap_out(ids) {
                Ok((host_ids, future)) => {
                    host_blocks.push(host_ids);
                    futures.push(future);
                }
                Err(e) => {
                    // Earlier ranks already have copies in flight: their
                    // device ids are gone into the event-held free list
                    // and their host blocks are reclaimed once the
                    // copies settle. Keep only the untouched ranks on
                    // the request.
                    let done = host_blocks.len();
                    let mut st = req.write_lock()?;
                    for ids in st.kv_cache_blocks.iter_mut().take(done) {
                        ids.clear();
                    }
                    drop(st);
                    self.cleanup_partial_swap(req.clone(), host_blocks, futures, MemoryTier::Host);
                    return Err(e);
                }
            }
        }
        {
            let mut st = req.write_lock()?;
            st.host_kv_cache_blocks = host_blocks;
            st.kv_cache_blocks = vec![Vec::new(); self.block_managers.len()];
            st.stage = InferStage::Swapped;
            st.swap_pending = true;
            st.swap_direction = Some(SwapDirection::Out);
        }
        self.watch_swap(req.clone(), futures);
        Ok(())
    }

    fn issue_swap_in(&self, req: &Arc<InferRequest>) -> Result<(), CoreError> {
        let host_blocks = req.read_lock()?.host_kv_cache_blocks.clone();
        let mut device_blocks = Vec::with_capacity(host_blocks.len());
        let mut futures = Vec::with_capacity(host_blocks.len());
        for (manager, ids) in self.block_managers.iter().zip(host_blocks.iter()) {
            match manager.swap_in(ids) {
                Ok((device_ids, future)) => {
                    device_blocks.push(device_ids);
                    futures.push(future);
                }
                Err(e) => {
                    // Host ids of the ranks already issued are gone into
                    // the event-held free list; keep only the untouched
                    // ranks on the request.
                    let done = device_blocks.len();
                    let mut st = req.write_lock()?;
                    for ids in st.host_kv_cache_blocks.iter_mut().take(done) {
                        ids.clear();
                    }
                    drop(st);
                    self.cleanup_partial_swap(req.clone(), device_blocks, futures, MemoryTier::Device);
                    return Err(e);
                }
            }
        }
        {
            let mut st = req.write_lock()?;
            st.kv_cache_blocks = device_blocks;
            st.host_kv_cache_blocks = vec![Vec::new(); self.block_managers.len()];
            st.swap_pending = true;
            st.swap_direction = Some(SwapDirection::In);
        }
        self.watch_swap(req.clone(), futures);
        Ok(())
    }

    /// Clears `swap_pending` once every rank's copies settle, then
    /// wakes the scheduler.
    fn watch_swap(&self, req: Arc<InferRequest>, futures: Vec<SwapFuture>) {
        let wakeup = self.wakeup.clone();
        tokio::spawn(async move {
            for future in futures {
                if let Err(e) = future.wait().await {
                    error!(req_id = req.req_id, "swap supervision failed: {e}");
                }
            }
            if let Ok(mut st) = req.write_lock() {
                st.swap_pending = false;
            }
            wakeup.notify_one();
        });
    }

    /// Releases the destination blocks allocated on a prefix of the
    /// ranks after a mid-swap failure, once their in-flight copies
    /// settle.
    fn cleanup_partial_swap(
        &self,
        req: Arc<InferRequest>,
        allocated: Vec<Vec<crate::types::BlockId>>,
        futures: Vec<SwapFuture>,
        tier: MemoryTier,
    ) {
        let managers = self.block_managers.clone();
        tokio::spawn(async move {
            for future in futures {
                let _ = future.wait().await;
            }
            for (manager, ids) in managers.iter().zip(allocated.iter()) {
                if ids.is_empty() {
                    continue;
                }
                let result = match tier {
                    MemoryTier::Host => manager.free_host(ids),
                    MemoryTier::Device => manager.free(ids),
                };
                if let Err(e) = result {
                    error!(req_id = req.req_id, "failed to reclaim partial swap blocks: {e}");
                }
            }
        });
    }

    /// Forward-progress guard: a swapped request that could not resume
    /// even with the whole pool free will never make progress. Report
    /// it and fail the request instead of spinning silently.
    fn report_starvation_if_stuck(
        &self,
        state: &mut SchedulerState,
        front: &Arc<InferRequest>,
        need: usize,
    ) -> Result<(), CoreError> {
        if !state.running.is_empty() || !state.waiting.is_empty() {
            return Ok(());
        }
        let manager = &self.block_managers[0];
        if manager.available_count() < manager.total_blocks() {
            return Ok(());
        }
        error!(
            req_id = front.req_id,
            need,
            total = manager.total_blocks(),
            "swapped request can never resume; memory cannot be reclaimed"
        );
        counter!("scheduler-starvation-total").increment(1);
        state.swapped.retain(|req| !Arc::ptr_eq(req, front));
        self.release_host_blocks(front)?;
        self.finish(front, FinishReason::Aborted(AbortReason::OutOfMemory))?;
        self.signal_finished(front);
        Ok(())
    }

    /// Strict allocation of `n` blocks on every accelerator; rolls the
    /// prefix back if any rank fails.
    fn allocate_everywhere(&self, n: usize) -> Result<Vec<Vec<crate::types::BlockId>>, CoreError> {
        let mut per_device: Vec<Vec<crate::types::BlockId>> = Vec::with_capacity(self.block_managers.len());
        for (device, manager) in self.block_managers.iter().enumerate() {
            match manager.allocate(n) {
                Ok(ids) => per_device.push(ids),
                Err(e) => {
                    for (manager, ids) in self.block_managers[..device].iter().zip(per_device.iter())
                    {
                        if let Err(free_err) = manager.free(ids) {
                            error!("rollback free failed: {free_err}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(per_device)
    }

    /// Tokens this batch would occupy: a prefill contributes its whole
    /// prompt, a decode contributes one token.
    fn batch_tokens(&self, state: &SchedulerState) -> Result<usize, CoreError> {
        let mut total = 0;
        for req in &state.running {
            total += if req.read_lock()?.step == 0 {
                req.total_tokens()
            } else {
                1
            };
        }
        Ok(total)
    }

    fn release_device_blocks(&self, req: &Arc<InferRequest>) -> Result<(), CoreError> {
        let mut st = req.write_lock()?;
        for (manager, ids) in self.block_managers.iter().zip(st.kv_cache_blocks.iter()) {
            if !ids.is_empty() {
                manager.free(ids)?;
            }
        }
        for ids in st.kv_cache_blocks.iter_mut() {
            ids.clear();
        }
        Ok(())
    }

    fn release_host_blocks(&self, req: &Arc<InferRequest>) -> Result<(), CoreError> {
        let mut st = req.write_lock()?;
        for (manager, ids) in self.block_managers.iter().zip(st.host_kv_cache_blocks.iter()) {
            if !ids.is_empty() {
                manager.free_host(ids)?;
            }
        }
        for ids in st.host_kv_cache_blocks.iter_mut() {
            ids.clear();
        }
        Ok(())
    }

    /// Records the terminal status. The completion waiter is signaled
    /// separately, exactly once, when the request leaves its queue.
    fn finish(&self, req: &Arc<InferRequest>, reason: FinishReason) -> Result<(), CoreError> {
        let mut st = req.write_lock()?;
        if st.finish_reason.is_some() {
            return Ok(());
        }
        st.finish_reason = Some(reason);
        st.stage = match reason {
            FinishReason::Aborted(_) => InferStage::Aborted,
            _ => InferStage::Finished,
        };
        Ok(())
    }

    fn signal_finished(&self, req: &Arc<InferRequest>) {
        counter!("scheduler-finished-total").increment(1);
        req.notify_finished();
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
