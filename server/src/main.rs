use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stratus_serving::{DummyModelExecutor, LlmService, ModelAttributes, ModelExecutor, RuntimeConfig};

mod api;

#[derive(Debug, Parser)]
#[command(name = "stratus-server", about = "Continuous-batching LLM serving runtime")]
struct Args {
    /// Path to the runtime configuration file.
    #[arg(long, default_value = "config/stratus_llm.yaml")]
    config_file: PathBuf,
    /// HTTP service hostname.
    #[arg(long, default_value = "localhost")]
    host: String,
    /// HTTP service port.
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

/// Selects the kernel backend for the configured model. Accelerator
/// backends register here; without one linked in, the host stand-in
/// keeps the endpoint serviceable for scheduling and bring-up work.
fn make_executor(attributes: &ModelAttributes) -> Arc<dyn ModelExecutor> {
    Arc::new(DummyModelExecutor::new(
        attributes.vocab_size,
        attributes.end_id,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Configuration or initialization failures exit non-zero.
    let args = Args::parse();
    let config = RuntimeConfig::load(&args.config_file)?;
    let base_model = &config.model_spec.base_model;
    let attributes = ModelAttributes::load(&base_model.model_dir, &base_model.model_name)?;

    let executor = make_executor(&attributes);
    let service = Arc::new(LlmService::start(&config, &attributes, executor)?);

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!(host = %args.host, port = args.port, "listening");

    let router = api::router(service.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl-c handler");
            info!("shutdown signal received");
        })
        .await?;

    // Drain in-flight requests; they complete as `terminated`.
    service.stop().await?;
    Ok(())
}
