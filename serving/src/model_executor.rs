use std::ptr::NonNull;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::CoreError;
use crate::request::{InferRequest, InferStage};
use crate::stream::DeviceStream;
use crate::types::TokenId;

/// Shape of one scheduled step, as expected by the attention kernels.
#[derive(Clone, Copy, Debug)]
pub struct ForwardShape {
    pub batch_size: usize,
    /// Longest per-request token span in this step.
    pub max_tokens: usize,
    /// Longest per-request block list in this step.
    pub layer_block_num: usize,
}

/// One request's slice of a step.
pub struct ForwardEntry {
    pub request: Arc<InferRequest>,
    /// `Prefill` on first appearance, `Decode` afterwards.
    pub stage: InferStage,
    /// Step input: the whole prompt for prefill, the last sampled token
    /// for decode.
    pub tokens: Vec<TokenId>,
    /// Row of this request in the logits buffer.
    pub logits_offset: usize,
}

/// A batch handed to the worker group for one forward + sampling step.
pub struct ForwardBatch {
    pub entries: Vec<ForwardEntry>,
    pub shape: ForwardShape,
    pub block_token_num: usize,
}

/// Rank-local arguments for one forward dispatch: the resolved KV block
/// addresses for every entry, the base of this rank's logits buffer,
/// and the rank's compute stream.
pub struct DeviceForwardArgs<'a> {
    pub rank: u32,
    pub block_ptrs: &'a [Vec<NonNull<u8>>],
    pub logits: NonNull<f32>,
    pub stream: &'a DeviceStream,
}

/// Seam to the external compute kernels.
///
/// One executor serves all ranks; `forward` is called once per rank per
/// step with that rank's resolved block pointers and logits buffer, and
/// dispatches the attention/MLP kernels on the rank's compute stream.
/// Logits for entry `i` are written at
/// `args.logits + entries[i].logits_offset * vocab_size`.
pub trait ModelExecutor: Send + Sync {
    fn vocab_size(&self) -> usize;
    fn eos_token_id(&self) -> TokenId;
    fn forward(&self, batch: &ForwardBatch, args: DeviceForwardArgs<'_>) -> Result<(), CoreError>;
}

/// Host-side stand-in executor used for scheduler bring-up and tests
/// when no kernel library is linked.
///
/// It stamps each entry's last KV block with the current token count
/// (so cache residency is observable) and fills the logits row with
/// seeded pseudo-random values over the vocabulary.
pub struct DummyModelExecutor {
    vocab_size: usize,
    eos_token_id: TokenId,
}

impl DummyModelExecutor {
    pub fn new(vocab_size: usize, eos_token_id: TokenId) -> Self {
        Self {
            vocab_size,
            eos_token_id,
        }
    }
}

impl ModelExecutor for DummyModelExecutor {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn eos_token_id(&self) -> TokenId {
        self.eos_token_id
    }

    fn forward(&self, batch: &ForwardBatch, args: DeviceForwardArgs<'_>) -> Result<(), CoreError> {
        for (entry, blocks) in batch.entries.iter().zip(args.block_ptrs.iter()) {
            if let Some(last_block) = blocks.last() {
                let stamp = entry.request.total_tokens() as u32;
                // SAFETY: the block is at least one stamp wide and owned
                // by this request for the duration of the step.
                unsafe { last_block.cast::<u32>().as_ptr().write(stamp) };
            }

            let mut rng = StdRng::seed_from_u64(
                entry.request.req_id ^ ((entry.request.total_tokens() as u64) << 32),
            );
            let row = unsafe {
                // SAFETY: the logits buffer has one vocab-wide row per
                // batch slot; `logits_offset` was assigned by the
                // scheduler within the batch.
                std::slice::from_raw_parts_mut(
                    args.logits.as_ptr().add(entry.logits_offset * self.vocab_size),
                    self.vocab_size,
                )
            };
            for logit in row.iter_mut() {
                *logit = rng.gen_range(0.0..1.0);
            }
        }
        Ok(())
    }
}
