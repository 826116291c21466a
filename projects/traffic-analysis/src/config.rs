// Validated pipeline configuration
//
// Built once from CLI/env arguments at startup and never mutated afterwards.

use crate::cli::{Args, BrokerKind, DetectorKind};
use crate::error::{PipelineError, PipelineResult};
use crate::retry::RetryPolicy;
use chrono::FixedOffset;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Upper bound on every blocking wait so shutdown stays responsive.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub bootstrap_servers: String,
    pub input_topic: String,
    pub output_topic: String,
    pub group_id: String,
    pub connect_retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub base_url: Url,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub endpoint: Url,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub public_url: Url,
    pub upload_annotated: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub batch_timeout: Duration,
    pub inference_queue_multiplier: usize,
    pub upload_queue_multiplier: usize,
}

impl BatchConfig {
    pub fn inference_queue_capacity(&self) -> usize {
        self.max_batch_size * self.inference_queue_multiplier
    }

    pub fn upload_queue_capacity(&self) -> usize {
        self.max_batch_size * self.upload_queue_multiplier
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    pub model_path: PathBuf,
    pub url: Url,
    pub min_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub broker: BrokerConfig,
    pub fetch: FetchConfig,
    pub storage: StorageConfig,
    pub batch: BatchConfig,
    pub detector: DetectorConfig,
    pub download_workers: usize,
    pub upload_workers: usize,
    pub display_offset: FixedOffset,
    pub poll_interval: Duration,
    pub status_addr: Option<SocketAddr>,
}

impl PipelineConfig {
    /// Admission queue between ingress and the download pool.
    pub fn admission_capacity(&self) -> usize {
        // Two pending events per download worker
        self.download_workers * 2
    }
}

fn parse_url(name: &str, value: &str) -> PipelineResult<Url> {
    Url::parse(value).map_err(|e| PipelineError::Config(format!("{} '{}': {}", name, value, e)))
}

fn require(name: &str, value: &str) -> PipelineResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Config(format!("{} must be set", name)));
    }
    Ok(trimmed.to_string())
}

fn at_least_one(name: &str, value: usize) -> PipelineResult<usize> {
    if value == 0 {
        return Err(PipelineError::Config(format!("{} must be at least 1", name)));
    }
    Ok(value)
}

impl TryFrom<&Args> for PipelineConfig {
    type Error = PipelineError;

    fn try_from(args: &Args) -> PipelineResult<Self> {
        if !args.broker_kind.is_available() {
            return Err(PipelineError::Config(format!(
                "BROKER_KIND={:?} is not available in this build",
                args.broker_kind
            )));
        }
        let broker = BrokerConfig {
            kind: args.broker_kind,
            bootstrap_servers: require("KAFKA_BROKER", &args.kafka_broker)?,
            input_topic: require("KAFKA_INPUT_TOPIC", &args.input_topic)?,
            output_topic: require("KAFKA_OUTPUT_TOPIC", &args.output_topic)?,
            group_id: require("KAFKA_GROUP_ID", &args.group_id)?,
            connect_retry: RetryPolicy::new(
                args.broker_connect_attempts,
                Duration::from_secs(args.broker_connect_backoff_secs),
            ),
        };

        // Relative snapshot paths are joined onto the base, which needs a trailing slash
        let mut base = args.image_base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let fetch = FetchConfig {
            base_url: parse_url("IMAGE_BASE_URL", &base)?,
            timeout: Duration::from_secs(args.image_fetch_timeout_secs.max(1)),
            retry: RetryPolicy::new(
                args.fetch_max_attempts,
                Duration::from_millis(args.fetch_retry_backoff_ms),
            ),
        };

        let storage = StorageConfig {
            endpoint: parse_url("MINIO_ENDPOINT", args.minio_endpoint.trim())?,
            access_key: require("MINIO_ACCESS_KEY", &args.minio_access_key)?,
            secret_key: require("MINIO_SECRET_KEY", &args.minio_secret_key)?,
            bucket: require("MINIO_BUCKET_NAME", &args.minio_bucket)?,
            region: require("MINIO_REGION", &args.minio_region)?,
            public_url: parse_url("MINIO_PUBLIC_URL", args.minio_public_url.trim())?,
            upload_annotated: args.upload_annotated,
        };

        if !args.batch_timeout.is_finite() || args.batch_timeout <= 0.0 {
            return Err(PipelineError::Config(format!(
                "BATCH_TIMEOUT must be a positive number of seconds, got {}",
                args.batch_timeout
            )));
        }
        let batch = BatchConfig {
            max_batch_size: at_least_one("BATCH_SIZE", args.batch_size)?,
            batch_timeout: Duration::from_secs_f64(args.batch_timeout),
            inference_queue_multiplier: at_least_one(
                "INFERENCE_QUEUE_MULTIPLIER",
                args.inference_queue_multiplier,
            )?,
            upload_queue_multiplier: at_least_one(
                "UPLOAD_QUEUE_MULTIPLIER",
                args.upload_queue_multiplier,
            )?,
        };

        if !(0.0..=1.0).contains(&args.min_confidence) {
            return Err(PipelineError::Config(format!(
                "MIN_CONFIDENCE must be within [0, 1], got {}",
                args.min_confidence
            )));
        }
        let detector = DetectorConfig {
            kind: args.detector,
            model_path: args.model_path.clone(),
            url: parse_url("DETECTOR_URL", args.detector_url.trim())?,
            min_confidence: args.min_confidence,
        };
        if detector.kind == DetectorKind::Rtdetr && !detector.model_path.is_file() {
            return Err(PipelineError::Config(format!(
                "model file not found: {}",
                detector.model_path.display()
            )));
        }

        let display_offset = Some(args.display_utc_offset_hours)
            .filter(|hours| (-14..=14).contains(hours))
            .and_then(|hours| FixedOffset::east_opt(hours * 3600))
            .ok_or_else(|| {
                PipelineError::Config(format!(
                    "DISPLAY_UTC_OFFSET_HOURS out of range: {}",
                    args.display_utc_offset_hours
                ))
            })?;

        let poll_interval = Duration::from_millis(args.shutdown_poll_ms.max(1)).min(MAX_POLL_INTERVAL);

        let status_addr = if args.status_port == 0 {
            None
        } else {
            Some(SocketAddr::new(args.status_host, args.status_port))
        };

        Ok(Self {
            broker,
            fetch,
            storage,
            batch,
            detector,
            download_workers: at_least_one("DOWNLOAD_WORKERS", args.download_workers)?,
            upload_workers: at_least_one("UPLOAD_WORKERS", args.upload_workers)?,
            display_offset,
            poll_interval,
            status_addr,
        })
    }
}

#[cfg(test)]
impl PipelineConfig {
    /// Small, fast configuration for in-process pipeline tests.
    pub fn test_defaults() -> Self {
        let args = Args::parse_from_iter(["traffic-analysis", "--broker-kind", "stdio"]);
        let mut config = PipelineConfig::try_from(&args).expect("test config");
        config.batch.max_batch_size = 4;
        config.batch.batch_timeout = Duration::from_millis(50);
        config.batch.inference_queue_multiplier = 2;
        config.batch.upload_queue_multiplier = 2;
        config.download_workers = 2;
        config.upload_workers = 2;
        config.poll_interval = Duration::from_millis(20);
        config.status_addr = None;
        config
    }
}

#[cfg(test)]
impl Args {
    pub fn parse_from_iter<'a>(argv: impl IntoIterator<Item = &'a str>) -> Self {
        use clap::Parser;
        Self::parse_from(argv)
    }
}
