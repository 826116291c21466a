mod bootstrap;
mod broker;
mod cli;
mod config;
mod error;
mod event;
mod pipeline;
mod retry;
mod service_context;
mod web;

use anyhow::{Context, Result};
use cli::Args;
use config::PipelineConfig;
use pipeline::orchestrator::start_pipeline;
use service_context::ServiceContext;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use web::server::run_status_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let args = Args::parse_args();

    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = PipelineConfig::try_from(&args).context("Invalid configuration")?;
    let ctx = Arc::new(ServiceContext::new(config));

    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl-C");
                ctx.request_shutdown();
            }
        }
    });

    let status = ctx.config.status_addr.map(|addr| {
        let watch_ctx = ctx.clone();
        let stopped = async move {
            while watch_ctx.is_running() {
                tokio::time::sleep(watch_ctx.poll_interval()).await;
            }
        };
        tokio::spawn(run_status_server(addr, ctx.clone(), stopped))
    });

    // Blocking HTTP clients and broker handshakes must stay off the async workers
    let runtime = tokio::runtime::Handle::current();
    let pipeline = tokio::task::spawn_blocking({
        let ctx = ctx.clone();
        move || {
            let components = bootstrap::build_components(&ctx, runtime)?;
            start_pipeline(ctx, components)
        }
    })
    .await
    .context("Startup task panicked")??;

    let result = tokio::task::spawn_blocking(move || pipeline.join())
        .await
        .context("Pipeline task panicked")?;

    ctx.request_shutdown();
    if let Some(status) = status {
        match status.await {
            Ok(Err(e)) => tracing::warn!("Status endpoint stopped with error: {:#}", e),
            Err(e) => tracing::warn!("Status endpoint task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    result
}
