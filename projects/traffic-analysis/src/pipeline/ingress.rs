use crate::broker::{EventSource, Polled};
use crate::event::CameraUpdateEvent;
use crate::pipeline::queue::{PushError, QueueProducer};
use crate::pipeline::types::Counters;
use crate::service_context::ServiceContext;
use anyhow::Result;
use std::sync::Arc;

/// Ingress loop: broker -> admission queue.
///
/// Malformed messages are logged and skipped. Submission blocks while the
/// download pool is saturated. Returns when the source is exhausted or
/// shutdown is requested; dropping `tx` then lets the downstream stages drain.
pub fn ingress_loop(
    mut source: Box<dyn EventSource>,
    tx: QueueProducer<CameraUpdateEvent>,
    ctx: Arc<ServiceContext>,
) -> Result<()> {
    let counters = &ctx.state.counters;

    while ctx.is_running() {
        let payload = match source.poll(ctx.poll_interval()) {
            Ok(Polled::Message(payload)) => payload,
            Ok(Polled::Idle) => continue,
            Ok(Polled::Exhausted) => {
                tracing::info!("Event source exhausted, draining pipeline");
                break;
            }
            Err(e) => {
                tracing::warn!("Broker poll failed: {}", e);
                ctx.sleep_while_running(ctx.poll_interval());
                continue;
            }
        };
        Counters::bump(&counters.received);

        let event = match CameraUpdateEvent::from_slice(&payload) {
            Ok(event) => event,
            Err(e) => {
                Counters::bump(&counters.malformed);
                ctx.state.stage_failed("ingress", 1);
                tracing::warn!("Skipping malformed event: {}", e);
                continue;
            }
        };

        tracing::trace!("Admitting camera {}", event.camera_id);
        match tx.push(event, &ctx) {
            Ok(()) => {
                Counters::bump(&counters.admitted);
                ctx.state.update_stage("ingress", 1, 0.0);
            }
            Err(PushError::Shutdown(_)) => {
                Counters::bump(&counters.dropped_at_shutdown);
                break;
            }
            Err(PushError::Closed(_)) => {
                anyhow::bail!("admission queue closed while ingress was running");
            }
        }
    }

    Ok(())
}
