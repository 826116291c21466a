// Message broker boundary
//
// Ingress reads raw event payloads from an `EventSource`; the upload stage
// publishes keyed records through a `RecordSink`. Delivery, partitioning and
// offsets belong to the concrete client.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod stdio;

use crate::cli::BrokerKind;
use crate::config::BrokerConfig;
use crate::error::PipelineResult;
use crate::service_context::ServiceContext;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one bounded poll
#[derive(Debug, PartialEq, Eq)]
pub enum Polled {
    Message(Vec<u8>),
    /// Nothing arrived within the timeout
    Idle,
    /// The source is finite and has no more messages
    Exhausted,
}

pub trait EventSource: Send {
    fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled>;
}

pub trait RecordSink: Send + Sync {
    fn publish(&self, key: &str, payload: &[u8]) -> PipelineResult<()>;
}

/// Open the configured source and sink, verifying connectivity at startup.
pub fn connect(
    config: &BrokerConfig,
    ctx: &ServiceContext,
) -> Result<(Box<dyn EventSource>, Arc<dyn RecordSink>)> {
    match config.kind {
        BrokerKind::Stdio => {
            tracing::info!("Reading events from stdin, writing records to stdout");
            Ok((
                Box::new(stdio::LineSource::stdin()),
                Arc::new(stdio::LineSink::stdout()),
            ))
        }
        BrokerKind::Kafka => connect_kafka(config, ctx),
    }
}

#[cfg(feature = "kafka")]
fn connect_kafka(
    config: &BrokerConfig,
    ctx: &ServiceContext,
) -> Result<(Box<dyn EventSource>, Arc<dyn RecordSink>)> {
    let source = kafka::KafkaSource::connect(config, || ctx.is_running())?;
    let sink = kafka::KafkaSink::connect(config)?;
    Ok((Box::new(source), Arc::new(sink)))
}

#[cfg(not(feature = "kafka"))]
fn connect_kafka(
    _config: &BrokerConfig,
    _ctx: &ServiceContext,
) -> Result<(Box<dyn EventSource>, Arc<dyn RecordSink>)> {
    anyhow::bail!("BROKER_KIND=kafka requires a build with the `kafka` feature")
}
