use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::memory::{self, AllocatorConfig};
use crate::types::{DataType, MemoryTier};

/// Device block count used when no device memory budget is configured
/// (`block_device_memory_ratio < 0`).
const DEFAULT_DEVICE_BLOCKS_NUM: usize = 512;

/// Top-level runtime configuration, loaded from the YAML file named on
/// the command line. Unknown keys are ignored; missing keys take the
/// documented defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub setting: Setting,
    #[serde(default)]
    pub model_spec: ModelSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub batch_scheduler: BatchSchedulerConfig,
    #[serde(default)]
    pub block_manager: BlockManagerConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_para_size")]
    pub tensor_para_size: usize,
    #[serde(default = "default_para_size")]
    pub pipeline_para_size: usize,
    #[serde(default)]
    pub enable_lora_adapter: bool,
}

fn default_para_size() -> usize {
    1
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            tensor_para_size: 1,
            pipeline_para_size: 1,
            enable_lora_adapter: false,
        }
    }
}

/// Admission, batching, and swap thresholds for the scheduler.
#[derive(Clone, Debug, Deserialize)]
pub struct BatchSchedulerConfig {
    #[serde(default = "default_waiting_timeout_in_ms")]
    pub waiting_timeout_in_ms: u64,
    #[serde(default = "default_max_waiting_queue_len")]
    pub max_waiting_queue_len: usize,
    /// Total tokens in the batch across all running requests.
    #[serde(default = "default_max_token_number")]
    pub max_token_number: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_len")]
    pub max_input_len: usize,
    #[serde(default = "default_max_len")]
    pub max_output_len: usize,
    /// Swap out when free device blocks drop below this multiple of the
    /// running batch's next-step block demand.
    #[serde(default = "default_swapout_block_threshold")]
    pub swapout_block_threshold: f32,
    /// Resume a swapped request only when free device blocks reach this
    /// multiple of the blocks it needs.
    #[serde(default = "default_swapin_block_threshold")]
    pub swapin_block_threshold: f32,
    /// Admit a new prefill only when free device blocks reach this
    /// multiple of the blocks it needs.
    #[serde(default = "default_launch_block_threshold")]
    pub launch_block_threshold: f32,
    #[serde(default = "default_swap_threadpool_size")]
    pub swap_threadpool_size: usize,
}

fn default_waiting_timeout_in_ms() -> u64 {
    600_000
}
fn default_max_waiting_queue_len() -> usize {
    256
}
fn default_max_token_number() -> usize {
    4096
}
fn default_max_batch_size() -> usize {
    8
}
fn default_max_len() -> usize {
    1024
}
fn default_swapout_block_threshold() -> f32 {
    1.0
}
fn default_swapin_block_threshold() -> f32 {
    2.0
}
fn default_launch_block_threshold() -> f32 {
    2.0
}
fn default_swap_threadpool_size() -> usize {
    8
}

impl Default for BatchSchedulerConfig {
    fn default() -> Self {
        Self {
            waiting_timeout_in_ms: default_waiting_timeout_in_ms(),
            max_waiting_queue_len: default_max_waiting_queue_len(),
            max_token_number: default_max_token_number(),
            max_batch_size: default_max_batch_size(),
            max_input_len: default_max_len(),
            max_output_len: default_max_len(),
            swapout_block_threshold: default_swapout_block_threshold(),
            swapin_block_threshold: default_swapin_block_threshold(),
            launch_block_threshold: default_launch_block_threshold(),
            swap_threadpool_size: default_swap_threadpool_size(),
        }
    }
}

/// Block pool sizing knobs.
#[derive(Clone, Debug, Deserialize)]
pub struct BlockManagerConfig {
    #[serde(default = "default_block_token_num")]
    pub block_token_num: usize,
    #[serde(default = "default_reserved_device_memory_ratio")]
    pub reserved_device_memory_ratio: f32,
    /// Fraction of device memory given to the block pool; negative
    /// selects the built-in default pool size.
    #[serde(default = "default_block_device_memory_ratio")]
    pub block_device_memory_ratio: f32,
    #[serde(default = "default_block_host_memory_factor")]
    pub block_host_memory_factor: f32,
    #[serde(default)]
    pub lora_device_memory_ratio: f32,
    #[serde(default = "default_block_host_memory_factor")]
    pub lora_host_memory_factor: f32,
}

fn default_block_token_num() -> usize {
    16
}
fn default_reserved_device_memory_ratio() -> f32 {
    0.05
}
fn default_block_device_memory_ratio() -> f32 {
    -1.0
}
fn default_block_host_memory_factor() -> f32 {
    10.0
}

impl Default for BlockManagerConfig {
    fn default() -> Self {
        Self {
            block_token_num: default_block_token_num(),
            reserved_device_memory_ratio: default_reserved_device_memory_ratio(),
            block_device_memory_ratio: default_block_device_memory_ratio(),
            block_host_memory_factor: default_block_host_memory_factor(),
            lora_device_memory_ratio: 0.0,
            lora_host_memory_factor: default_block_host_memory_factor(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub base_model: ModelEntry,
    #[serde(default)]
    pub lora_models: Vec<ModelEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub model_dir: String,
}

impl RuntimeConfig {
    /// Loads and validates the YAML configuration. Unreadable or
    /// malformed files are fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            CoreError::SegmentFault(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: RuntimeConfig = serde_yaml::from_str(&raw).map_err(|e| {
            CoreError::SegmentFault(format!("malformed config file {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CoreError> {
        let global = &self.setting.global;
        if global.tensor_para_size == 0 || global.pipeline_para_size == 0 {
            return Err(CoreError::InvalidArgument(
                "tensor_para_size and pipeline_para_size should be > 0".into(),
            ));
        }
        let scheduler = &self.setting.batch_scheduler;
        if scheduler.max_batch_size == 0 {
            return Err(CoreError::InvalidArgument("max_batch_size should be > 0".into()));
        }
        if scheduler.max_token_number < scheduler.max_input_len {
            return Err(CoreError::InvalidArgument(format!(
                "max_token_number ({}) is smaller than max_input_len ({}); no prompt of the \
                 permitted length could ever be scheduled",
                scheduler.max_token_number, scheduler.max_input_len
            )));
        }
        if self.setting.block_manager.block_token_num == 0 {
            return Err(CoreError::InvalidArgument("block_token_num should be > 0".into()));
        }
        Ok(())
    }
}

/// Model attributes read from `<model_dir>/attributes.ini`, a flat
/// `key = value` file with an optional `[model_name]` section header.
#[derive(Clone, Debug)]
pub struct ModelAttributes {
    pub model_name: String,
    pub head_num: usize,
    pub num_key_value_heads: usize,
    pub size_per_head: usize,
    pub inter_size: usize,
    pub vocab_size: usize,
    pub num_layer: usize,
    pub rotary_embedding: usize,
    pub rope_theta: f32,
    pub layernorm_eps: f32,
    pub start_id: u32,
    pub end_id: u32,
    pub max_position_embeddings: usize,
    pub weight_data_type: DataType,
}

impl ModelAttributes {
    pub fn load(model_dir: impl AsRef<Path>, model_name: &str) -> Result<Self, CoreError> {
        let path = model_dir.as_ref().join("attributes.ini");
        let raw = fs::read_to_string(&path).map_err(|e| {
            CoreError::SegmentFault(format!(
                "model attributes file {} is not readable: {e}",
                path.display()
            ))
        })?;
        Self::parse(&raw, model_name)
    }

    fn parse(raw: &str, model_name: &str) -> Result<Self, CoreError> {
        let mut values: HashMap<&str, &str> = HashMap::new();
        let mut in_scope = true;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_scope = section.trim() == model_name;
                continue;
            }
            if !in_scope {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim(), value.trim());
            }
        }

        let weight_data_type = DataType::parse(required(&values, "weight_data_type")?)?;
        if weight_data_type != DataType::Fp16 {
            return Err(CoreError::InvalidArgument(format!(
                "only fp16 weights are supported, got {weight_data_type:?}"
            )));
        }

        let head_num = parse_key(&values, "head_num")?;
        let attributes = Self {
            model_name: model_name.to_string(),
            head_num,
            num_key_value_heads: parse_key_or(&values, "num_key_value_heads", head_num)?,
            size_per_head: parse_key(&values, "size_per_head")?,
            inter_size: parse_key(&values, "inter_size")?,
            vocab_size: parse_key(&values, "vocab_size")?,
            num_layer: parse_key(&values, "num_layer")?,
            rotary_embedding: parse_key(&values, "rotary_embedding")?,
            rope_theta: parse_key_or(&values, "rope_theta", 10_000.0)?,
            layernorm_eps: parse_key(&values, "layernorm_eps")?,
            start_id: parse_key(&values, "start_id")?,
            end_id: parse_key(&values, "end_id")?,
            max_position_embeddings: parse_key(&values, "max_position_embeddings")?,
            weight_data_type,
        };
        debug!(model = attributes.model_name, "loaded model attributes");
        Ok(attributes)
    }
}

fn required<'a>(values: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str, CoreError> {
    values
        .get(key)
        .copied()
        .ok_or_else(|| CoreError::InvalidArgument(format!("missing model attribute `{key}`")))
}

fn parse_key<T: std::str::FromStr>(
    values: &HashMap<&str, &str>,
    key: &str,
) -> Result<T, CoreError> {
    required(values, key)?
        .parse()
        .map_err(|_| CoreError::InvalidArgument(format!("model attribute `{key}` is malformed")))
}

fn parse_key_or<T: std::str::FromStr>(
    values: &HashMap<&str, &str>,
    key: &str,
    fallback: T,
) -> Result<T, CoreError> {
    match values.get(key) {
        Some(raw) => raw.parse().map_err(|_| {
            CoreError::InvalidArgument(format!("model attribute `{key}` is malformed"))
        }),
        None => Ok(fallback),
    }
}

/// Block pool shapes derived from the configuration and the model
/// attributes. The block size is identical on both tiers by
/// construction; `BlockManager` re-checks it at startup.
#[derive(Clone, Debug)]
pub struct BlockPoolPlan {
    pub block_token_num: usize,
    pub block_size: usize,
    pub device_blocks_num: usize,
    pub host_blocks_num: usize,
}

impl BlockPoolPlan {
    pub fn derive(
        block_manager: &BlockManagerConfig,
        global: &GlobalConfig,
        attributes: &ModelAttributes,
    ) -> Result<Self, CoreError> {
        if attributes.head_num % global.tensor_para_size != 0 {
            return Err(CoreError::InvalidArgument(format!(
                "head_num {} is not divisible by tensor_para_size {}",
                attributes.head_num, global.tensor_para_size
            )));
        }
        let token_size = (attributes.num_layer / global.pipeline_para_size)
            * (attributes.head_num / global.tensor_para_size)
            * attributes.size_per_head;
        // K and V, fp16.
        let block_size =
            token_size * block_manager.block_token_num * 2 * DataType::Fp16.size_bytes();

        let device_blocks_num = if block_manager.block_device_memory_ratio > 0.0 {
            let info = memory::device_memory_info(0)?;
            let budget = (info.total as f64
                * (block_manager.block_device_memory_ratio as f64
                    - block_manager.reserved_device_memory_ratio as f64))
                .max(0.0) as usize;
            budget / block_size
        } else {
            DEFAULT_DEVICE_BLOCKS_NUM
        };
        if device_blocks_num == 0 {
            return Err(CoreError::OutOfMemory(
                "device memory budget fits zero cache blocks".into(),
            ));
        }

        let mut host_blocks_num =
            (device_blocks_num as f64 * block_manager.block_host_memory_factor as f64) as usize;
        match memory::host_memory_info() {
            Ok(info) => {
                // Leave half of the available host memory to everything
                // that is not the swap tier.
                let cap = info.free / 2 / block_size;
                if host_blocks_num > cap {
                    warn!(
                        requested = host_blocks_num,
                        cap, "host block pool capped by available memory"
                    );
                    host_blocks_num = cap.max(1);
                }
            }
            Err(e) => warn!("host memory info unavailable, not capping host pool: {e}"),
        }

        Ok(Self {
            block_token_num: block_manager.block_token_num,
            block_size,
            device_blocks_num,
            host_blocks_num,
        })
    }

    pub fn device_config(&self, device_id: u32) -> AllocatorConfig {
        AllocatorConfig {
            blocks_num: self.device_blocks_num,
            block_size: self.block_size,
            tier: MemoryTier::Device,
            device_id: Some(device_id),
        }
    }

    pub fn host_config(&self, device_id: u32) -> AllocatorConfig {
        AllocatorConfig {
            blocks_num: self.host_blocks_num,
            block_size: self.block_size,
            tier: MemoryTier::Host,
            device_id: Some(device_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_documented_values() {
        let config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
        let scheduler = &config.setting.batch_scheduler;
        assert_eq!(scheduler.waiting_timeout_in_ms, 600_000);
        assert_eq!(scheduler.max_waiting_queue_len, 256);
        assert_eq!(scheduler.max_token_number, 4096);
        assert_eq!(scheduler.max_batch_size, 8);
        assert_eq!(scheduler.max_input_len, 1024);
        assert_eq!(scheduler.max_output_len, 1024);
        assert_eq!(scheduler.swap_threadpool_size, 8);
        assert_eq!(config.setting.block_manager.block_token_num, 16);
        assert_eq!(config.setting.global.tensor_para_size, 1);
    }

    #[test]
    fn yaml_overrides_are_honored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "setting:\n  batch_scheduler:\n    max_batch_size: 2\n    max_waiting_queue_len: 2\n  global:\n    tensor_para_size: 2"
        )
        .unwrap();
        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.setting.batch_scheduler.max_batch_size, 2);
        assert_eq!(config.setting.global.tensor_para_size, 2);
    }

    #[test]
    fn unreadable_config_is_a_segment_fault() {
        assert!(matches!(
            RuntimeConfig::load("/nonexistent/config.yaml"),
            Err(CoreError::SegmentFault(_))
        ));
    }

    #[test]
    fn malformed_config_is_a_segment_fault() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "setting: [not, a, mapping]").unwrap();
        assert!(matches!(
            RuntimeConfig::load(file.path()),
            Err(CoreError::SegmentFault(_))
        ));
    }

    const ATTRIBUTES: &str = "\
[llama-13b]
head_num = 40
size_per_head = 128
inter_size = 13824
vocab_size = 32000
num_layer = 40
rotary_embedding = 128
layernorm_eps = 1e-6
start_id = 1
end_id = 2
max_position_embeddings = 2048
weight_data_type = fp16
";

    #[test]
    fn attributes_parse_with_defaults() {
        let attributes = ModelAttributes::parse(ATTRIBUTES, "llama-13b").unwrap();
        assert_eq!(attributes.head_num, 40);
        // num_key_value_heads defaults to head_num.
        assert_eq!(attributes.num_key_value_heads, 40);
        assert_eq!(attributes.rope_theta, 10_000.0);
        assert_eq!(attributes.end_id, 2);
    }

    #[test]
    fn non_fp16_weights_are_rejected() {
        let raw = ATTRIBUTES.replace("fp16", "fp32");
        assert!(matches!(
            ModelAttributes::parse(&raw, "llama-13b"),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn block_size_derivation() {
        let attributes = ModelAttributes::parse(ATTRIBUTES, "llama-13b").unwrap();
        let plan = BlockPoolPlan::derive(
            &BlockManagerConfig::default(),
            &GlobalConfig::default(),
            &attributes,
        )
        .unwrap();
        // 40 layers * 40 heads * 128 * 16 tokens * 2 (K+V) * 2 bytes.
        assert_eq!(plan.block_size, 40 * 40 * 128 * 16 * 2 * 2);
        assert_eq!(plan.device_blocks_num, 512);
    }

    #[test]
    fn tensor_parallelism_splits_the_block() {
        let attributes = ModelAttributes::parse(ATTRIBUTES, "llama-13b").unwrap();
        let global = GlobalConfig {
            tensor_para_size: 2,
            ..Default::default()
        };
        let plan =
            BlockPoolPlan::derive(&BlockManagerConfig::default(), &global, &attributes).unwrap();
        assert_eq!(plan.block_size, 40 * 20 * 128 * 16 * 2 * 2);
    }
}
