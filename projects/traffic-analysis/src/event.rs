// Wire data model
//
// Camera update events consumed from the input topic and the enriched
// records published to the output topic.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::types::DetectionSet;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;

/// Epoch values above this are milliseconds rather than seconds.
const MILLIS_THRESHOLD: f64 = 1_000_000_000_000.0;

/// Display format of `timestamp_vn`.
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Deserialize, Debug)]
struct RawLocation {
    #[serde(default)]
    coordinates: Vec<f64>,
}

/// Camera update as published by the ingestion service
#[derive(Deserialize, Debug)]
struct RawCameraEvent {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    dist: Option<String>,
    #[serde(rename = "liveviewUrl", default)]
    liveview_url: Option<String>,
    #[serde(default)]
    loc: Option<RawLocation>,
    #[serde(default)]
    timestamp: Option<Number>,
}

/// A validated camera update. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraUpdateEvent {
    pub camera_id: String,
    pub name: Option<String>,
    pub district: Option<String>,
    /// (lon, lat)
    pub coordinates: Option<(f64, f64)>,
    /// `liveviewUrl` exactly as received; may be relative to the image base URL.
    pub snapshot_url: String,
    pub timestamp: Option<Number>,
}

impl TryFrom<RawCameraEvent> for CameraUpdateEvent {
    type Error = PipelineError;

    fn try_from(raw: RawCameraEvent) -> PipelineResult<Self> {
        let camera_id = raw.id.trim().to_string();
        if camera_id.is_empty() {
            return Err(PipelineError::Malformed("empty camera id".into()));
        }

        let snapshot_url = raw
            .liveview_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                PipelineError::Malformed(format!("camera {} has no liveviewUrl", camera_id))
            })?;

        let coordinates = raw.loc.and_then(|loc| match loc.coordinates.as_slice() {
            [lon, lat] => Some((*lon, *lat)),
            _ => None,
        });

        Ok(Self {
            camera_id,
            name: raw.name,
            district: raw.dist,
            coordinates,
            snapshot_url,
            timestamp: raw.timestamp,
        })
    }
}

impl CameraUpdateEvent {
    /// Deserialize one broker message.
    pub fn from_slice(payload: &[u8]) -> PipelineResult<Self> {
        let raw: RawCameraEvent = serde_json::from_slice(payload)?;
        raw.try_into()
    }

    /// Event time in epoch seconds, if the event carries a usable timestamp.
    pub fn epoch_seconds(&self) -> Option<f64> {
        self.timestamp
            .as_ref()
            .and_then(Number::as_f64)
            .and_then(normalize_epoch_seconds)
    }

    /// Event time in the display timezone.
    pub fn display_time(&self, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        self.epoch_seconds()
            .and_then(|secs| to_display_time(secs, offset))
    }
}

/// Accepts seconds or milliseconds; zero and negative values are treated as absent.
pub fn normalize_epoch_seconds(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    if raw > MILLIS_THRESHOLD {
        Some(raw / 1000.0)
    } else {
        Some(raw)
    }
}

pub fn to_display_time(secs: f64, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(whole, nanos).map(|dt| dt.with_timezone(&offset))
}

pub fn format_display_time(dt: &DateTime<FixedOffset>) -> String {
    dt.format(DISPLAY_FORMAT).to_string()
}

/// Enriched result published to the output topic. Field order is the wire order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub camera_id: String,
    pub camera_name: Option<String>,
    pub district: Option<String>,
    pub liveview_url: String,
    pub coordinates: Vec<f64>,
    pub total_count: u32,
    pub detection_details: BTreeMap<String, u32>,
    pub timestamp: Option<Number>,
    pub timestamp_vn: Option<String>,
    pub annotated_image_url: Option<String>,
}

impl OutputRecord {
    pub fn new(
        event: &CameraUpdateEvent,
        detections: &DetectionSet,
        annotated_image_url: Option<String>,
        offset: FixedOffset,
    ) -> Self {
        let coordinates = event
            .coordinates
            .map(|(lon, lat)| vec![lon, lat])
            .unwrap_or_default();

        Self {
            camera_id: event.camera_id.clone(),
            camera_name: event.name.clone(),
            district: event.district.clone(),
            liveview_url: event.snapshot_url.clone(),
            coordinates,
            total_count: detections.total,
            detection_details: detections.details.clone(),
            timestamp: event.timestamp.clone(),
            timestamp_vn: event.display_time(offset).map(|dt| format_display_time(&dt)),
            annotated_image_url,
        }
    }

    pub fn to_payload(&self) -> PipelineResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
