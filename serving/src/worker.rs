use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, instrument, warn};

use crate::block_manager::BlockManager;
use crate::context::{Context, StreamSet};
use crate::error::CoreError;
use crate::model_executor::{DeviceForwardArgs, ForwardBatch, ModelExecutor};

/// Base address of one rank's logits buffer.
#[derive(Clone, Copy)]
struct LogitsBase(*mut f32);

// SAFETY: the buffer is a contiguous allocation owned by the worker
// group for its whole lifetime; each worker writes only its own rank's
// buffer, and the sampling path reads rank 0 only after the step
// barrier.
unsafe impl Send for LogitsBase {}
unsafe impl Sync for LogitsBase {}

struct StepCommand {
    batch: Arc<ForwardBatch>,
    reply: oneshot::Sender<Result<(), CoreError>>,
}

/// One worker per accelerator, each on a dedicated OS thread bound to
/// its rank's streams. Workers never touch the scheduler queues; they
/// execute the batch they are handed.
struct Worker {
    rank: u32,
    sender: Option<mpsc::UnboundedSender<StepCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        rank: u32,
        executor: Arc<dyn ModelExecutor>,
        streams: Arc<StreamSet>,
        logits: LogitsBase,
        vocab_size: usize,
    ) -> Result<Self, CoreError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StepCommand>();
        let handle = thread::Builder::new()
            .name(format!("worker-{rank}"))
            .spawn(move || {
                while let Some(command) = receiver.blocking_recv() {
                    let result = run_step(
                        rank,
                        &command.batch,
                        executor.as_ref(),
                        &streams,
                        logits,
                        vocab_size,
                    );
                    if let Err(e) = &result {
                        error!(rank, "step failed on worker: {e}");
                    }
                    command.reply.send(result).ok();
                }
            })
            .map_err(|e| CoreError::Runtime(format!("failed to spawn worker {rank}: {e}")))?;
        Ok(Self {
            rank,
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    fn submit(&self, batch: Arc<ForwardBatch>) -> Result<oneshot::Receiver<Result<(), CoreError>>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .as_ref()
            .ok_or_else(|| CoreError::Terminated("worker already stopped".into()))?
            .send(StepCommand { batch, reply })
            .map_err(|_| CoreError::Terminated(format!("worker {} is gone", self.rank)))?;
        Ok(rx)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Executes one step on one rank: resolve block pointers, run the
/// external forward kernels, and (on rank 0, where the logits are
/// gathered after the collective) sample the next token for every
/// entry.
fn run_step(
    rank: u32,
    batch: &ForwardBatch,
    executor: &dyn ModelExecutor,
    streams: &StreamSet,
    logits: LogitsBase,
    vocab_size: usize,
) -> Result<(), CoreError> {
    let mut block_ptrs = Vec::with_capacity(batch.entries.len());
    for entry in &batch.entries {
        block_ptrs.push(entry.request.block_ptrs_on(rank)?);
    }

    executor.forward(
        batch,
        DeviceForwardArgs {
            rank,
            block_ptrs: &block_ptrs,
            // SAFETY: the buffer base is non-null for the group's lifetime.
            logits: unsafe { NonNull::new_unchecked(logits.0) },
            stream: &streams.compute,
        },
    )?;

    if rank == 0 {
        for entry in &batch.entries {
            let row = unsafe {
                // SAFETY: one vocab-wide row per batch slot, written by
                // the forward pass above on this same thread.
                std::slice::from_raw_parts(
                    logits.0.add(entry.logits_offset * vocab_size),
                    vocab_size,
                )
            };
            let token = entry
                .request
                .sampler()
                .sample(row, &entry.request.sampling_config);
            entry.request.append_output_token(token);
        }
    }
    Ok(())
}

/// The per-accelerator worker set plus the logits buffers they share
/// with the sampling path. The step barrier is the join of one reply
/// per worker.
pub struct WorkerGroup {
    workers: Vec<Worker>,
    logits: Vec<(Arc<BlockManager>, u64, LogitsBase)>,
    vocab_size: usize,
}

impl WorkerGroup {
    #[instrument(skip_all)]
    pub fn new(
        context: &Context,
        block_managers: &[Arc<BlockManager>],
        executor: Arc<dyn ModelExecutor>,
        max_batch_size: usize,
    ) -> Result<Self, CoreError> {
        let vocab_size = executor.vocab_size();
        let mut logits = Vec::with_capacity(block_managers.len());
        let mut workers = Vec::with_capacity(block_managers.len());

        for (rank, manager) in block_managers.iter().enumerate() {
            let bytes = max_batch_size * vocab_size * std::mem::size_of::<f32>();
            let alloc_id = manager.allocate_contiguous(bytes)?;
            let base = LogitsBase(manager.get_contiguous_ptr(alloc_id)?.cast::<f32>().as_ptr());
            logits.push((manager.clone(), alloc_id, base));

            workers.push(Worker::spawn(
                rank as u32,
                executor.clone(),
                context.streams(rank as u32).clone(),
                base,
                vocab_size,
            )?);
        }

        info!(workers = workers.len(), "worker group ready");
        Ok(Self {
            workers,
            logits,
            vocab_size,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Address of one request's logits row on one rank.
    pub fn logits_ptr(&self, rank: u32, logits_offset: usize) -> Result<NonNull<f32>, CoreError> {
        let (_, _, base) = self
            .logits
            .get(rank as usize)
            .ok_or_else(|| CoreError::InvalidArgument(format!("no worker for rank {rank}")))?;
        // SAFETY: offsets are assigned within the batch bounds.
        Ok(unsafe { NonNull::new_unchecked(base.0.add(logits_offset * self.vocab_size)) })
    }

    /// Runs one forward + sampling step on every rank and awaits the
    /// per-step barrier.
    pub async fn execute_step(&self, batch: Arc<ForwardBatch>) -> Result<(), CoreError> {
        let mut barriers = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            barriers.push(worker.submit(batch.clone())?);
        }
        for reply in join_all(barriers).await {
            reply.map_err(|_| CoreError::Runtime("worker dropped its step reply".into()))??;
        }
        Ok(())
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        // Stop the workers before releasing the logits buffers they
        // write into.
        self.workers.clear();
        for (manager, alloc_id, _) in self.logits.drain(..) {
            if let Err(e) = manager.free_contiguous(alloc_id) {
                warn!("failed to release logits buffer: {e}");
            }
        }
    }
}
