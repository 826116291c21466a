// Object storage for annotated snapshots
//
// Keys follow analyzed-images/{camera_id}/{YYYY-MM-DD}/{HHMMSS}.jpg in the
// display timezone. The S3 client is async; upload workers are plain threads
// and drive it through the tokio runtime handle.

use crate::config::StorageConfig;
use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, FixedOffset};
use s3::creds::Credentials;
use s3::{Bucket, BucketConfiguration, Region};
use tokio::runtime::Handle;
use url::Url;

pub const KEY_PREFIX: &str = "analyzed-images";

/// Stores one object and returns its public URL.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> PipelineResult<String>;
}

/// Deterministic object key for a camera snapshot taken at `at`.
pub fn object_key(camera_id: &str, at: &DateTime<FixedOffset>) -> String {
    format!(
        "{}/{}/{}/{}.jpg",
        KEY_PREFIX,
        camera_id.replace('/', "_"),
        at.format("%Y-%m-%d"),
        at.format("%H%M%S")
    )
}

/// `{public_base}/{bucket}/{key}` with every path segment percent-encoded.
pub fn public_url(public_base: &Url, bucket: &str, key: &str) -> String {
    let encoded_key: Vec<String> = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    format!(
        "{}/{}/{}",
        public_base.as_str().trim_end_matches('/'),
        urlencoding::encode(bucket),
        encoded_key.join("/")
    )
}

/// MinIO / S3 store with path-style addressing.
pub struct S3ObjectStore {
    bucket: Box<Bucket>,
    region: Region,
    credentials: Credentials,
    public_base: Url,
    runtime: Handle,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig, runtime: Handle) -> anyhow::Result<Self> {
        let region = Region::Custom {
            region: config.region.clone(),
            endpoint: config.endpoint.as_str().trim_end_matches('/').to_string(),
        };
        let credentials = Credentials::new(
            Some(&config.access_key),
            Some(&config.secret_key),
            None,
            None,
            None,
        )?;
        let bucket =
            Bucket::new(&config.bucket, region.clone(), credentials.clone())?.with_path_style();

        Ok(Self {
            bucket,
            region,
            credentials,
            public_base: config.public_url.clone(),
            runtime,
        })
    }

    /// Create the bucket if it does not exist yet. Must not be called from
    /// inside an async task.
    pub fn ensure_bucket(&self) -> anyhow::Result<()> {
        let name = self.bucket.name();
        let exists = self.runtime.block_on(self.bucket.exists())?;
        if exists {
            tracing::info!("Bucket '{}' is ready", name);
            return Ok(());
        }

        let response = self.runtime.block_on(Bucket::create_with_path_style(
            &name,
            self.region.clone(),
            self.credentials.clone(),
            BucketConfiguration::default(),
        ))?;
        if !response.success() {
            anyhow::bail!(
                "creating bucket '{}' failed with status {}: {}",
                name,
                response.response_code,
                response.response_text
            );
        }
        tracing::info!("Created bucket '{}'", name);
        Ok(())
    }
}

impl ObjectStore for S3ObjectStore {
    fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> PipelineResult<String> {
        let response = self
            .runtime
            .block_on(
                self.bucket
                    .put_object_with_content_type(key, &bytes, content_type),
            )
            .map_err(|e| PipelineError::upload(key, e))?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(PipelineError::upload(key, format!("status {}", status)));
        }
        Ok(public_url(&self.public_base, &self.bucket.name(), key))
    }
}
