use clap::{Parser, ValueEnum};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerKind {
    /// Kafka consumer/producer (requires the `kafka` feature)
    Kafka,
    /// JSON lines on stdin, records on stdout
    Stdio,
}

impl BrokerKind {
    /// Whether this build can open the transport.
    pub fn is_available(self) -> bool {
        match self {
            BrokerKind::Kafka => cfg!(feature = "kafka"),
            BrokerKind::Stdio => true,
        }
    }
}

/// Kafka when it is compiled in, stdio otherwise
const DEFAULT_BROKER_KIND: &str = if cfg!(feature = "kafka") {
    "kafka"
} else {
    "stdio"
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectorKind {
    /// In-process RT-DETR (requires the `rtdetr` feature)
    Rtdetr,
    /// Remote detection endpoint over HTTP
    Remote,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Traffic camera analysis pipeline", long_about = None)]
pub struct Args {
    /// Broker transport
    #[arg(long, env = "BROKER_KIND", value_enum, default_value = DEFAULT_BROKER_KIND)]
    pub broker_kind: BrokerKind,

    /// Kafka bootstrap servers
    #[arg(long, env = "KAFKA_BROKER", default_value = "broker:29092")]
    pub kafka_broker: String,

    /// Topic carrying camera update events
    #[arg(long, env = "KAFKA_INPUT_TOPIC", default_value = "hcm_traffic_data")]
    pub input_topic: String,

    /// Topic receiving enriched traffic metrics
    #[arg(long, env = "KAFKA_OUTPUT_TOPIC", default_value = "traffic_metrics_topic")]
    pub output_topic: String,

    /// Consumer group id
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "traffic-analysis-group")]
    pub group_id: String,

    /// Startup connection attempts before giving up
    #[arg(long, env = "BROKER_CONNECT_ATTEMPTS", default_value_t = 10)]
    pub broker_connect_attempts: u32,

    /// Seconds between startup connection attempts
    #[arg(long, env = "BROKER_CONNECT_BACKOFF_SECS", default_value_t = 5)]
    pub broker_connect_backoff_secs: u64,

    /// Base URL for relative snapshot paths
    #[arg(long, env = "IMAGE_BASE_URL", default_value = "https://api.notis.vn/v4/")]
    pub image_base_url: String,

    /// Snapshot fetch timeout in seconds
    #[arg(long, env = "IMAGE_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    pub image_fetch_timeout_secs: u64,

    /// Fetch attempts per snapshot (1 = no retry)
    #[arg(long, env = "FETCH_MAX_ATTEMPTS", default_value_t = 1)]
    pub fetch_max_attempts: u32,

    /// Milliseconds between fetch attempts
    #[arg(long, env = "FETCH_RETRY_BACKOFF_MS", default_value_t = 1000)]
    pub fetch_retry_backoff_ms: u64,

    /// Object store endpoint
    #[arg(long, env = "MINIO_ENDPOINT", default_value = "http://minio:9000")]
    pub minio_endpoint: String,

    #[arg(long, env = "MINIO_ACCESS_KEY", default_value = "minioadmin")]
    pub minio_access_key: String,

    #[arg(long, env = "MINIO_SECRET_KEY", default_value = "minioadmin", hide_env_values = true)]
    pub minio_secret_key: String,

    #[arg(long, env = "MINIO_BUCKET_NAME", default_value = "traffic-analyzed-images")]
    pub minio_bucket: String,

    #[arg(long, env = "MINIO_REGION", default_value = "us-east-1")]
    pub minio_region: String,

    /// Public base URL used to build `annotated_image_url`
    #[arg(long, env = "MINIO_PUBLIC_URL", default_value = "http://localhost:9000")]
    pub minio_public_url: String,

    /// Render and upload annotated snapshots
    #[arg(long, env = "UPLOAD_ANNOTATED", default_value_t = true, action = clap::ArgAction::Set)]
    pub upload_annotated: bool,

    /// Maximum images per inference call
    #[arg(long, env = "BATCH_SIZE", default_value_t = 32)]
    pub batch_size: usize,

    /// Seconds to wait for a batch to fill once its first item arrived
    #[arg(long, env = "BATCH_TIMEOUT", default_value_t = 0.1)]
    pub batch_timeout: f64,

    #[arg(long, env = "DOWNLOAD_WORKERS", default_value_t = 4)]
    pub download_workers: usize,

    #[arg(long, env = "UPLOAD_WORKERS", default_value_t = 4)]
    pub upload_workers: usize,

    /// Inference queue capacity = batch size x multiplier
    #[arg(long, env = "INFERENCE_QUEUE_MULTIPLIER", default_value_t = 4)]
    pub inference_queue_multiplier: usize,

    /// Upload queue capacity = batch size x multiplier
    #[arg(long, env = "UPLOAD_QUEUE_MULTIPLIER", default_value_t = 4)]
    pub upload_queue_multiplier: usize,

    /// Granularity of every blocking wait, in milliseconds
    #[arg(long, env = "SHUTDOWN_POLL_MS", default_value_t = 500)]
    pub shutdown_poll_ms: u64,

    /// Detection backend
    #[arg(long, env = "DETECTOR", value_enum, default_value = "remote")]
    pub detector: DetectorKind,

    /// Model file for the in-process detector
    #[arg(long, env = "YOLO_MODEL_PATH", default_value = "/app/models/rtdetr.onnx")]
    pub model_path: PathBuf,

    /// Remote detection endpoint
    #[arg(long, env = "DETECTOR_URL", default_value = "http://ai-service:5000/detect")]
    pub detector_url: String,

    #[arg(long, env = "MIN_CONFIDENCE", default_value_t = 0.35)]
    pub min_confidence: f32,

    /// Offset of the display timezone used for `timestamp_vn`
    #[arg(long, env = "DISPLAY_UTC_OFFSET_HOURS", default_value_t = 7, allow_hyphen_values = true)]
    pub display_utc_offset_hours: i32,

    /// Host for the status endpoint
    #[arg(long, env = "STATUS_HOST", default_value = "0.0.0.0")]
    pub status_host: IpAddr,

    /// Port for the status endpoint (0 disables it)
    #[arg(long, env = "STATUS_PORT", default_value_t = 8088)]
    pub status_port: u16,

    /// Fallback log filter when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
