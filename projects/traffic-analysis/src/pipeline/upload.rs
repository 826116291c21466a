use crate::broker::RecordSink;
use crate::error::PipelineResult;
use crate::event::OutputRecord;
use crate::pipeline::annotate::render_annotated;
use crate::pipeline::queue::{Pulled, QueueConsumer};
use crate::pipeline::storage::{object_key, ObjectStore};
use crate::pipeline::types::{Counters, InferenceOutput};
use crate::service_context::ServiceContext;
use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Renders, stores and publishes one inference result.
pub struct Publisher {
    /// `None` when annotated uploads are disabled.
    store: Option<Arc<dyn ObjectStore>>,
    sink: Arc<dyn RecordSink>,
    display_offset: FixedOffset,
}

impl Publisher {
    pub fn new(
        store: Option<Arc<dyn ObjectStore>>,
        sink: Arc<dyn RecordSink>,
        display_offset: FixedOffset,
    ) -> Self {
        Self {
            store,
            sink,
            display_offset,
        }
    }

    /// Render and upload the annotated snapshot. Any failure degrades to `None`.
    fn upload_annotation(&self, output: &InferenceOutput, ctx: &ServiceContext) -> Option<String> {
        let store = self.store.as_ref()?;
        let camera_id = &output.event.camera_id;

        let taken_at: DateTime<FixedOffset> = output
            .event
            .display_time(self.display_offset)
            .unwrap_or_else(|| Utc::now().with_timezone(&self.display_offset));
        let key = object_key(camera_id, &taken_at);

        let uploaded = render_annotated(&output.image, &output.detections.boxes)
            .and_then(|jpeg| store.put(&key, jpeg, "image/jpeg"));

        match uploaded {
            Ok(url) => {
                Counters::bump(&ctx.state.counters.uploaded);
                Some(url)
            }
            Err(e) => {
                Counters::bump(&ctx.state.counters.upload_failed);
                tracing::warn!(
                    "Annotated upload failed for camera {}: {}; publishing without image",
                    camera_id,
                    e
                );
                None
            }
        }
    }

    pub fn publish(
        &self,
        output: InferenceOutput,
        ctx: &ServiceContext,
    ) -> PipelineResult<OutputRecord> {
        let url = self.upload_annotation(&output, ctx);
        let record = OutputRecord::new(&output.event, &output.detections, url, self.display_offset);
        let payload = record.to_payload()?;
        self.sink.publish(&record.camera_id, &payload)?;
        Ok(record)
    }
}

/// Upload pool worker: upload queue -> object store -> output topic.
pub fn upload_worker(
    rx: QueueConsumer<InferenceOutput>,
    publisher: Arc<Publisher>,
    ctx: Arc<ServiceContext>,
) -> Result<()> {
    let counters = &ctx.state.counters;

    while ctx.is_running() {
        let output = match rx.pull_timeout(ctx.poll_interval()) {
            Pulled::Item(output) => output,
            Pulled::Empty => continue,
            Pulled::Closed => break,
        };

        let camera_id = output.event.camera_id.clone();
        let start = Instant::now();
        match publisher.publish(output, &ctx) {
            Ok(record) => {
                Counters::bump(&counters.published);
                ctx.state
                    .update_stage("upload", 1, start.elapsed().as_secs_f64() * 1000.0);
                tracing::debug!(
                    "Published camera {} ({} objects)",
                    record.camera_id,
                    record.total_count
                );
            }
            Err(e) => {
                Counters::bump(&counters.publish_failed);
                ctx.state.stage_failed("upload", 1);
                tracing::warn!("Publishing camera {} failed: {}", camera_id, e);
            }
        }
    }

    Ok(())
}
