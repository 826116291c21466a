use crate::broker::{EventSource, Polled, RecordSink};
use crate::config::BrokerConfig;
use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{BaseRecord, DefaultProducerContext, Producer, ThreadedProducer};
use rdkafka::Message;
use std::time::Duration;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn client_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    client
}

/// Consumer subscribed to the input topic.
pub struct KafkaSource {
    consumer: BaseConsumer,
}

impl KafkaSource {
    /// Connect with bounded retries; exhausting them is fatal.
    pub fn connect(config: &BrokerConfig, keep_going: impl FnMut() -> bool) -> Result<Self> {
        let consumer: BaseConsumer = client_config(config)
            .set("group.id", &config.group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("session.timeout.ms", "10000")
            .create()
            .context("Failed to create Kafka consumer")?;

        config
            .connect_retry
            .run(keep_going, |attempt| {
                consumer
                    .fetch_metadata(Some(&config.input_topic), METADATA_TIMEOUT)
                    .map(|_| ())
                    .map_err(|e| {
                        tracing::warn!(
                            "Kafka not reachable at {} (attempt {}/{}): {}",
                            config.bootstrap_servers,
                            attempt,
                            config.connect_retry.max_attempts,
                            e
                        );
                        PipelineError::Broker(e.to_string())
                    })
            })
            .context("Could not connect to Kafka")?;

        consumer
            .subscribe(&[&config.input_topic])
            .with_context(|| format!("Failed to subscribe to {}", config.input_topic))?;
        tracing::info!(
            "Subscribed to '{}' as group '{}'",
            config.input_topic,
            config.group_id
        );
        Ok(Self { consumer })
    }
}

impl EventSource for KafkaSource {
    fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled> {
        match self.consumer.poll(timeout) {
            None => Ok(Polled::Idle),
            Some(Ok(message)) => Ok(message
                .payload()
                .map(|payload| Polled::Message(payload.to_vec()))
                .unwrap_or(Polled::Idle)),
            Some(Err(e)) => Err(PipelineError::Broker(e.to_string())),
        }
    }
}

/// Producer for the output topic; messages are keyed by camera id.
pub struct KafkaSink {
    producer: ThreadedProducer<DefaultProducerContext>,
    topic: String,
}

impl KafkaSink {
    pub fn connect(config: &BrokerConfig) -> Result<Self> {
        let producer: ThreadedProducer<DefaultProducerContext> = client_config(config)
            .set("message.timeout.ms", "30000")
            .create()
            .context("Failed to create Kafka producer")?;
        tracing::info!("Publishing records to '{}'", config.output_topic);
        Ok(Self {
            producer,
            topic: config.output_topic.clone(),
        })
    }
}

impl RecordSink for KafkaSink {
    fn publish(&self, key: &str, payload: &[u8]) -> PipelineResult<()> {
        self.producer
            .send(BaseRecord::to(&self.topic).key(key).payload(payload))
            .map_err(|(e, _)| PipelineError::Publish(e.to_string()))
    }
}

impl Drop for KafkaSink {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT) {
            tracing::warn!("Kafka producer flush failed: {}", e);
        }
    }
}
