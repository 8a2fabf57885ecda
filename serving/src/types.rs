use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::sampling::SamplingConfig;

/// Token identifier within the model vocabulary.
pub type TokenId = u32;

/// Stable identifier of a cache block within its tier. Ids are 1-based;
/// 0 is never a valid block id.
pub type BlockId = u32;

/// The memory tier a block pool lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryTier {
    /// Accelerator-local memory.
    Device,
    /// Pinned host memory, the target of swapped-out blocks.
    Host,
}

/// Closed set of element types the kernel façade dispatches over.
///
/// The core itself is dtype-agnostic; only the block-size derivation and
/// the external kernels care about the element width.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Fp16,
    Fp32,
    Bf16,
    Fp8E4m3,
    Fp8E5m2,
    Int8,
}

impl DataType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Fp16 | DataType::Bf16 => 2,
            DataType::Fp32 => 4,
            DataType::Fp8E4m3 | DataType::Fp8E5m2 | DataType::Int8 => 1,
        }
    }

    /// Parses a model-attributes `weight_data_type` value.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        match raw.to_ascii_lowercase().as_str() {
            "fp16" => Ok(DataType::Fp16),
            "fp32" => Ok(DataType::Fp32),
            "bf16" => Ok(DataType::Bf16),
            "fp8_e4m3" => Ok(DataType::Fp8E4m3),
            "fp8_e5m2" => Ok(DataType::Fp8E5m2),
            "int8" => Ok(DataType::Int8),
            other => Err(CoreError::InvalidArgument(format!(
                "unsupported data type `{other}`"
            ))),
        }
    }
}

pub trait ReadLock {
    type Inner;
    fn read_lock(&self) -> Result<RwLockReadGuard<Self::Inner>, CoreError>;
}

pub trait WriteLock {
    type Inner;
    fn write_lock(&self) -> Result<RwLockWriteGuard<Self::Inner>, CoreError>;
}

/// A text-generation request as submitted by a client. Tokenization
/// happens upstream; the runtime only ever sees token ids.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateRequest {
    /// Client-chosen identifier echoed back in the response.
    pub request_id: String,
    /// Prompt token ids.
    pub input_tokens: Vec<TokenId>,
    /// Sampling parameters.
    #[serde(default)]
    pub sampling: SamplingConfig,
}
