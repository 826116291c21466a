// Startup wiring: turns a validated configuration into live collaborators

use crate::broker;
use crate::pipeline::detection::detector_factory;
use crate::pipeline::fetch::HttpSnapshotFetcher;
use crate::pipeline::orchestrator::PipelineComponents;
use crate::pipeline::storage::{ObjectStore, S3ObjectStore};
use crate::service_context::ServiceContext;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Build every external collaborator. Blocking: call from a plain thread or
/// `spawn_blocking`, never from an async task.
pub fn build_components(ctx: &ServiceContext, runtime: Handle) -> Result<PipelineComponents> {
    let config = &ctx.config;

    let (source, sink) = broker::connect(&config.broker, ctx).context("Broker unavailable")?;

    let fetcher = HttpSnapshotFetcher::new(config.fetch.base_url.clone(), config.fetch.timeout)
        .context("Failed to build snapshot HTTP client")?;

    let store: Option<Arc<dyn ObjectStore>> = if config.storage.upload_annotated {
        let store = S3ObjectStore::new(&config.storage, runtime)
            .context("Failed to configure object store")?;
        // Unreachable storage only degrades uploads; records keep flowing
        if let Err(e) = store.ensure_bucket() {
            tracing::warn!(
                "Object store at {} not ready: {:#}",
                config.storage.endpoint,
                e
            );
        }
        Some(Arc::new(store))
    } else {
        tracing::info!("Annotated uploads disabled");
        None
    };

    Ok(PipelineComponents {
        source,
        fetcher: Arc::new(fetcher),
        inference: detector_factory(&config.detector),
        store,
        sink,
    })
}
