use crate::error::{PipelineError, PipelineResult};
use crate::event::CameraUpdateEvent;
use crate::pipeline::fetch::SnapshotFetcher;
use crate::pipeline::queue::{PushError, Pulled, QueueConsumer, QueueProducer};
use crate::pipeline::types::{Counters, DecodedTask};
use crate::retry::RetryPolicy;
use crate::service_context::ServiceContext;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

/// Fetch + decode for one camera event.
pub struct Downloader {
    fetcher: Arc<dyn SnapshotFetcher>,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(fetcher: Arc<dyn SnapshotFetcher>, retry: RetryPolicy) -> Self {
        Self { fetcher, retry }
    }

    pub fn fetch_and_decode(
        &self,
        event: CameraUpdateEvent,
        ctx: &ServiceContext,
    ) -> PipelineResult<DecodedTask> {
        let bytes = self
            .retry
            .run(|| ctx.is_running(), |_| self.fetcher.fetch(&event))?;
        Counters::bump(&ctx.state.counters.fetched);

        let image = image::load_from_memory(&bytes)?;
        Ok(DecodedTask { event, image })
    }
}

/// Download pool worker: admission queue -> fetch/decode -> inference queue.
///
/// Fetch and decode failures drop the item. Exits when the admission queue
/// closes or shutdown is requested.
pub fn download_worker(
    rx: QueueConsumer<CameraUpdateEvent>,
    tx: QueueProducer<DecodedTask>,
    downloader: Arc<Downloader>,
    ctx: Arc<ServiceContext>,
) -> Result<()> {
    let counters = &ctx.state.counters;

    while ctx.is_running() {
        let event = match rx.pull_timeout(ctx.poll_interval()) {
            Pulled::Item(event) => event,
            Pulled::Empty => continue,
            Pulled::Closed => break,
        };

        let camera_id = event.camera_id.clone();
        let start = Instant::now();
        let task = match downloader.fetch_and_decode(event, &ctx) {
            Ok(task) => task,
            Err(PipelineError::Shutdown) => break,
            Err(e) => {
                match e {
                    PipelineError::Decode(_) => Counters::bump(&counters.decode_failed),
                    _ => Counters::bump(&counters.fetch_failed),
                }
                ctx.state.stage_failed("download", 1);
                tracing::warn!("Dropping camera {}: {}", camera_id, e);
                continue;
            }
        };
        ctx.state
            .update_stage("download", 1, start.elapsed().as_secs_f64() * 1000.0);

        match tx.push(task, &ctx) {
            Ok(()) => {}
            Err(PushError::Shutdown(task)) => {
                Counters::bump(&counters.dropped_at_shutdown);
                tracing::debug!("Dropping camera {} at shutdown", task.event.camera_id);
                break;
            }
            Err(PushError::Closed(_)) => {
                anyhow::bail!("inference queue closed while downloads were still running");
            }
        }
    }

    Ok(())
}
