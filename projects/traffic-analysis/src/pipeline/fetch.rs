use crate::error::{PipelineError, PipelineResult};
use crate::event::CameraUpdateEvent;
use reqwest::blocking::Client;
use std::time::Duration;
use url::Url;

/// Fetches the raw snapshot bytes for one camera event.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, event: &CameraUpdateEvent) -> PipelineResult<Vec<u8>>;
}

/// Resolve `liveviewUrl`: absolute URLs are used as-is, anything else is
/// joined onto the image base URL.
pub fn resolve_snapshot_url(base: &Url, liveview: &str) -> PipelineResult<Url> {
    let liveview = liveview.trim();
    if liveview.starts_with("http://") || liveview.starts_with("https://") {
        return Url::parse(liveview).map_err(|e| PipelineError::fetch(liveview, e));
    }
    base.join(liveview.trim_start_matches('/'))
        .map_err(|e| PipelineError::fetch(liveview, e))
}

/// HTTP snapshot fetcher with a per-request timeout
pub struct HttpSnapshotFetcher {
    client: Client,
    base_url: Url,
}

impl HttpSnapshotFetcher {
    /// Must be built outside of an async runtime context.
    pub fn new(base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("traffic-analysis/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url })
    }
}

impl SnapshotFetcher for HttpSnapshotFetcher {
    fn fetch(&self, event: &CameraUpdateEvent) -> PipelineResult<Vec<u8>> {
        let url = resolve_snapshot_url(&self.base_url, &event.snapshot_url)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| PipelineError::fetch(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(url.as_str(), format!("status {}", status)));
        }

        let bytes = response
            .bytes()
            .map_err(|e| PipelineError::fetch(url.as_str(), e))?;
        if bytes.is_empty() {
            return Err(PipelineError::fetch(url.as_str(), "empty body"));
        }

        tracing::debug!("Fetched {} bytes for camera {}", bytes.len(), event.camera_id);
        Ok(bytes.to_vec())
    }
}
