use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument, Instrument};

use crate::block_manager::BlockManager;
use crate::config::{BlockPoolPlan, ModelAttributes, RuntimeConfig};
use crate::context::Context;
use crate::error::CoreError;
use crate::model_executor::ModelExecutor;
use crate::request::{FinishReason, InferRequest};
use crate::scheduler::BatchScheduler;
use crate::types::{GenerateRequest, ReadLock, TokenId};
use crate::worker::WorkerGroup;

/// Response for one finished request.
#[derive(Clone, Debug, Serialize)]
pub struct GenerateOutput {
    pub request_id: String,
    /// Generated tokens only; the prompt is not echoed.
    pub output_tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

/// The serving entrypoint: owns the accelerator context, the
/// per-accelerator block managers, the worker group, and the scheduler
/// task. Requests go in through `enqueue`/`generate`; tokens come back
/// through the request's waiters.
pub struct LlmService {
    scheduler: Arc<BatchScheduler>,
    // Keeps the streams alive for as long as workers may use them.
    _context: Arc<Context>,
    scheduler_handle: Mutex<Option<JoinHandle<Result<(), CoreError>>>>,
    shutdown: watch::Sender<bool>,
    start_time: Instant,
}

impl LlmService {
    /// Builds the whole runtime from configuration and starts the
    /// scheduler task. `executor` is the external kernel seam; the
    /// runtime never inspects the model beyond its vocabulary size and
    /// EOS id.
    #[instrument(skip_all)]
    pub fn start(
        config: &RuntimeConfig,
        attributes: &ModelAttributes,
        executor: Arc<dyn ModelExecutor>,
    ) -> Result<Self, CoreError> {
        info!(
            model = %attributes.model_name,
            devices = config.setting.global.tensor_para_size,
            "starting llm service"
        );
        let global = &config.setting.global;
        let context = Arc::new(Context::new(
            global.tensor_para_size,
            global.pipeline_para_size,
        )?);

        let plan = BlockPoolPlan::derive(&config.setting.block_manager, global, attributes)?;
        let swap_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.setting.batch_scheduler.swap_threadpool_size)
                .thread_name(|i| format!("swap-{i}"))
                .build()
                .map_err(|e| CoreError::Runtime(format!("failed to build swap pool: {e}")))?,
        );

        let mut block_managers = Vec::with_capacity(context.device_count());
        for device_id in 0..context.device_count() as u32 {
            block_managers.push(Arc::new(BlockManager::new(
                plan.device_config(device_id),
                plan.host_config(device_id),
                context.streams(device_id).clone(),
                swap_pool.clone(),
            )?));
        }

        let workers = WorkerGroup::new(
            &context,
            &block_managers,
            executor.clone(),
            config.setting.batch_scheduler.max_batch_size,
        )?;

        let scheduler = Arc::new(BatchScheduler::new(
            config.setting.batch_scheduler.clone(),
            plan.block_token_num,
            executor.eos_token_id(),
            block_managers,
            workers,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler_task = scheduler.clone();
        let scheduler_handle = tokio::spawn(
            async move { scheduler_task.run(shutdown_rx).await }
                .instrument(info_span!("scheduler")),
        );

        Ok(Self {
            scheduler,
            _context: context,
            scheduler_handle: Mutex::new(Some(scheduler_handle)),
            shutdown,
            start_time: Instant::now(),
        })
    }

    /// Submits a request and returns its handle immediately.
    pub fn enqueue(&self, request: GenerateRequest) -> Result<Arc<InferRequest>, CoreError> {
        self.scheduler.enqueue(request)
    }

    /// Submits a request and waits for its terminal status.
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateOutput, CoreError> {
        let req = self.enqueue(request)?;
        req.wait_finished().await;

        let finish_reason = req.read_lock()?.finish_reason.ok_or_else(|| {
            CoreError::Unknown("request completed without a terminal status".into())
        })?;
        let output_tokens = req.output_tokens().split_off(req.input_tokens.len());
        Ok(GenerateOutput {
            request_id: req.request_id.clone(),
            output_tokens,
            finish_reason,
        })
    }

    /// Signals shutdown and waits for the scheduler to drain. In-flight
    /// requests are aborted as `Terminated`. Idempotent.
    pub async fn stop(&self) -> Result<(), CoreError> {
        info!(
            "stopping llm service, running time: {:?}",
            self.start_time.elapsed()
        );
        // A closed channel also counts as a shutdown signal.
        let _ = self.shutdown.send(true);
        let handle = self
            .scheduler_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!("scheduler task failed: {e}");
                    Err(CoreError::Runtime(format!("scheduler task panicked: {e}")))
                }
            },
            None => Ok(()),
        }
    }
}
