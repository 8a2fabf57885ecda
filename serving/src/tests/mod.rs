use std::sync::Arc;
use std::time::Duration;

use crate::block_manager::BlockManager;
use crate::config::{BatchSchedulerConfig, ModelAttributes, RuntimeConfig};
use crate::context::Context;
use crate::error::CoreError;
use crate::memory::AllocatorConfig;
use crate::model_executor::DummyModelExecutor;
use crate::request::{AbortReason, FinishReason, InferRequest, InferStage};
use crate::sampling::SamplingConfig;
use crate::scheduler::BatchScheduler;
use crate::service::LlmService;
use crate::types::{DataType, GenerateRequest, MemoryTier, TokenId};
use crate::worker::WorkerGroup;

/// Small enough that the dummy executor never samples it.
const EOS_TOKEN_ID: TokenId = 2048;
const VOCAB_SIZE: usize = 128;

struct TestHarness {
    scheduler: Arc<BatchScheduler>,
    managers: Vec<Arc<BlockManager>>,
    _context: Arc<Context>,
}

fn harness(
    config: BatchSchedulerConfig,
    device_blocks: usize,
    host_blocks: usize,
    block_token_num: usize,
) -> TestHarness {
    let context = Arc::new(Context::new(1, 1).unwrap());
    let swap_pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap(),
    );
    let manager = Arc::new(
        BlockManager::new(
            AllocatorConfig {
                blocks_num: device_blocks,
                block_size: 1024,
                tier: MemoryTier::Device,
                device_id: Some(0),
            },
            AllocatorConfig {
                blocks_num: host_blocks,
                block_size: 1024,
                tier: MemoryTier::Host,
                device_id: Some(0),
            },
            context.streams(0).clone(),
            swap_pool,
        )
        .unwrap(),
    );
    let managers = vec![manager];
    let executor = Arc::new(DummyModelExecutor::new(VOCAB_SIZE, EOS_TOKEN_ID));
    let workers =
        WorkerGroup::new(&context, &managers, executor, config.max_batch_size).unwrap();
    let scheduler = Arc::new(BatchScheduler::new(
        config,
        block_token_num,
        EOS_TOKEN_ID,
        managers.clone(),
        workers,
    ));
    TestHarness {
        scheduler,
        managers,
        _context: context,
    }
}

fn request(id: &str, input_len: usize) -> GenerateRequest {
    GenerateRequest {
        request_id: id.into(),
        input_tokens: (0..input_len as TokenId).collect(),
        sampling: SamplingConfig::default(),
    }
}

async fn tick_until<F: Fn() -> bool>(harness: &TestHarness, done: F) {
    for _ in 0..300 {
        harness.scheduler.tick().await.unwrap();
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached within the tick budget");
}

fn is_finished(req: &Arc<InferRequest>) -> bool {
    req.stage().unwrap().is_terminal() && req.finish_reason().unwrap().is_some()
}

#[tokio::test]
async fn third_request_hits_backpressure() {
    let config = BatchSchedulerConfig {
        max_batch_size: 2,
        max_waiting_queue_len: 2,
        ..Default::default()
    };
    let harness = harness(config, 64, 64, 16);

    harness.scheduler.enqueue(request("a", 4)).unwrap();
    harness.scheduler.enqueue(request("b", 4)).unwrap();
    assert!(matches!(
        harness.scheduler.enqueue(request("c", 4)),
        Err(CoreError::Backpressure(_))
    ));
}

#[tokio::test]
async fn over_long_prompts_are_rejected() {
    let config = BatchSchedulerConfig {
        max_input_len: 8,
        ..Default::default()
    };
    let harness = harness(config, 64, 64, 16);
    assert!(matches!(
        harness.scheduler.enqueue(request("long", 9)),
        Err(CoreError::InvalidArgument(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decode_terminates_exactly_at_max_output_len() {
    let config = BatchSchedulerConfig {
        max_output_len: 4,
        ..Default::default()
    };
    let harness = harness(config, 64, 64, 16);

    let req = harness.scheduler.enqueue(request("cap", 8)).unwrap();
    harness.scheduler.tick().await.unwrap();

    // After the first step the request is live in the batch: its block
    // and logits addresses resolve.
    assert_eq!(req.get_block_ptrs().unwrap()[0].len(), 1);
    assert_eq!(
        req.get_logits_ptrs(harness.scheduler.workers()).unwrap().len(),
        1
    );

    tick_until(&harness, || is_finished(&req)).await;

    // Exactly max_output_len tokens beyond the prompt, one per step.
    assert_eq!(req.generated_len(), 4);
    assert_eq!(req.finish_reason().unwrap(), Some(FinishReason::LengthCapped));
    assert_eq!(req.stage().unwrap(), InferStage::Finished);
    let output = req.output_tokens();
    assert_eq!(&output[..8], &req.input_tokens[..]);

    // One extra tick reaps the request; the pool must be whole again.
    harness.scheduler.tick().await.unwrap();
    assert_eq!(
        harness.managers[0].free_count(),
        harness.managers[0].total_blocks()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_follows_enqueue_order() {
    let config = BatchSchedulerConfig {
        max_batch_size: 2,
        max_waiting_queue_len: 8,
        max_output_len: 64,
        ..Default::default()
    };
    let harness = harness(config, 64, 64, 16);

    let first = harness.scheduler.enqueue(request("first", 4)).unwrap();
    let second = harness.scheduler.enqueue(request("second", 4)).unwrap();
    let third = harness.scheduler.enqueue(request("third", 4)).unwrap();

    harness.scheduler.tick().await.unwrap();

    // The batch is full with the two oldest requests; the youngest is
    // still waiting.
    assert_eq!(first.generated_len(), 1);
    assert_eq!(second.generated_len(), 1);
    assert_eq!(third.generated_len(), 0);
    assert_eq!(third.stage().unwrap(), InferStage::Prefill);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pressure_picks_the_largest_youngest_victim() {
    let config = BatchSchedulerConfig {
        max_batch_size: 4,
        max_output_len: 3,
        swapout_block_threshold: 1.0,
        swapin_block_threshold: 1.0,
        launch_block_threshold: 1.0,
        ..Default::default()
    };
    // One token per block, so block counts track sequence lengths.
    let harness = harness(config, 10, 16, 1);

    let a = harness.scheduler.enqueue(request("a", 3)).unwrap();
    let b = harness.scheduler.enqueue(request("b", 5)).unwrap();

    // First tick admits both (8 blocks) and tops each up by one after
    // the first sampled token, leaving the pool empty.
    harness.scheduler.tick().await.unwrap();
    assert_eq!(a.generated_len(), 1);
    assert_eq!(b.generated_len(), 1);

    // Under pressure the victim is B: more blocks and younger.
    harness.scheduler.tick().await.unwrap();
    assert_eq!(b.stage().unwrap(), InferStage::Swapped);
    assert_ne!(a.stage().unwrap(), InferStage::Swapped);
    assert!(a.generated_len() >= 2);

    // A runs to completion, then B is swapped back in and finishes too;
    // its restored cache must carry it to the same terminal state.
    tick_until(&harness, || is_finished(&a)).await;
    assert_eq!(a.finish_reason().unwrap(), Some(FinishReason::LengthCapped));
    tick_until(&harness, || is_finished(&b)).await;
    assert_eq!(b.finish_reason().unwrap(), Some(FinishReason::LengthCapped));
    assert_eq!(b.generated_len(), 3);

    // Quiescent accounting: both pools whole again.
    harness.scheduler.tick().await.unwrap();
    assert_eq!(
        harness.managers[0].free_count(),
        harness.managers[0].total_blocks()
    );
    assert_eq!(
        harness.managers[0].host_free_count(),
        harness.managers[0].host_total_blocks()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresumable_swapped_request_is_reported_and_failed() {
    let config = BatchSchedulerConfig {
        max_output_len: 64,
        // Aggressive swap-out plus a swap-in threshold the pool can
        // never satisfy: 2x the request's five blocks exceeds the six
        // the device owns in total.
        swapout_block_threshold: 2.0,
        swapin_block_threshold: 2.0,
        launch_block_threshold: 1.0,
        ..Default::default()
    };
    let harness = harness(config, 6, 8, 1);

    let req = harness.scheduler.enqueue(request("hog", 4)).unwrap();
    // Prefill (four blocks) plus the boundary top-up leave one free
    // block; the next tick's pressure check swaps the request out.
    harness.scheduler.tick().await.unwrap();
    assert_eq!(req.generated_len(), 1);

    // With the queue otherwise empty and the whole pool free, the
    // swap-in threshold still cannot be met. The starvation condition
    // must fail the request rather than spin on it silently.
    tick_until(&harness, || is_finished(&req)).await;
    assert_eq!(req.stage().unwrap(), InferStage::Aborted);
    assert_eq!(
        req.finish_reason().unwrap(),
        Some(FinishReason::Aborted(AbortReason::OutOfMemory))
    );
    // It never came back as a running request.
    assert_eq!(req.generated_len(), 1);

    // Both tiers are whole again: nothing was leaked on either side.
    assert_eq!(harness.managers[0].free_count(), 6);
    assert_eq!(harness.managers[0].host_free_count(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborted_waiting_request_is_reaped() {
    let harness = harness(BatchSchedulerConfig::default(), 64, 64, 16);
    let req = harness.scheduler.enqueue(request("gone", 4)).unwrap();
    req.abort();
    harness.scheduler.tick().await.unwrap();
    assert_eq!(
        req.finish_reason().unwrap(),
        Some(FinishReason::Aborted(AbortReason::Cancelled))
    );
    req.wait_finished().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_timeout_aborts_unadmitted_requests() {
    let config = BatchSchedulerConfig {
        waiting_timeout_in_ms: 5,
        // An impossible launch threshold keeps the request waiting.
        launch_block_threshold: 1e9,
        ..Default::default()
    };
    let harness = harness(config, 16, 16, 16);
    let req = harness.scheduler.enqueue(request("slow", 4)).unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    harness.scheduler.tick().await.unwrap();
    assert_eq!(
        req.finish_reason().unwrap(),
        Some(FinishReason::Aborted(AbortReason::Timeout))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn aborting_a_running_request_frees_its_blocks() {
    let config = BatchSchedulerConfig {
        max_output_len: 1024,
        ..Default::default()
    };
    let harness = harness(config, 64, 64, 16);
    let req = harness.scheduler.enqueue(request("cancel-me", 8)).unwrap();

    harness.scheduler.tick().await.unwrap();
    assert_eq!(req.generated_len(), 1);

    req.abort();
    tick_until(&harness, || is_finished(&req)).await;
    assert_eq!(
        req.finish_reason().unwrap(),
        Some(FinishReason::Aborted(AbortReason::Cancelled))
    );
    harness.scheduler.tick().await.unwrap();
    assert_eq!(
        harness.managers[0].free_count(),
        harness.managers[0].total_blocks()
    );
}

fn test_attributes() -> ModelAttributes {
    ModelAttributes {
        model_name: "tiny-test".into(),
        head_num: 8,
        num_key_value_heads: 8,
        size_per_head: 4,
        inter_size: 64,
        vocab_size: VOCAB_SIZE,
        num_layer: 2,
        rotary_embedding: 4,
        rope_theta: 10_000.0,
        layernorm_eps: 1e-6,
        start_id: 1,
        end_id: EOS_TOKEN_ID,
        max_position_embeddings: 2048,
        weight_data_type: DataType::Fp16,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_runs_a_batch_of_requests_end_to_end() {
    const NUM_REQUESTS: usize = 16;

    let mut config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
    config.setting.batch_scheduler.max_batch_size = 4;
    config.setting.batch_scheduler.max_output_len = 8;

    let attributes = test_attributes();
    let executor = Arc::new(DummyModelExecutor::new(
        attributes.vocab_size,
        attributes.end_id,
    ));
    let service = LlmService::start(&config, &attributes, executor).unwrap();

    let outputs = futures::future::join_all(
        (0..NUM_REQUESTS).map(|i| service.generate(request(&format!("req-{i}"), 4 + i % 5))),
    )
    .await;

    for output in outputs {
        let output = output.unwrap();
        assert_eq!(output.output_tokens.len(), 8);
        assert_eq!(output.finish_reason, FinishReason::LengthCapped);
        assert!(output.output_tokens.iter().all(|t| (*t as usize) < VOCAB_SIZE));
    }

    service.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_terminates_in_flight_requests() {
    let mut config: RuntimeConfig = serde_yaml::from_str("{}").unwrap();
    // Large output budget: the request cannot finish on its own.
    config.setting.batch_scheduler.max_output_len = 1024;

    let attributes = test_attributes();
    let executor = Arc::new(DummyModelExecutor::new(
        attributes.vocab_size,
        attributes.end_id,
    ));
    let service = LlmService::start(&config, &attributes, executor).unwrap();

    let req = service.enqueue(request("drain-me", 4)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.stop().await.unwrap();

    req.wait_finished().await;
    assert_eq!(
        req.finish_reason().unwrap(),
        Some(FinishReason::Aborted(AbortReason::Terminated))
    );
}
