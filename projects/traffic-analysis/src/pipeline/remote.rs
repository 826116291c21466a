use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::annotate::encode_jpeg;
use crate::pipeline::classes::TrafficClass;
use crate::pipeline::detection::Inference;
use crate::pipeline::types::{BBox, Detection, DetectionSet};
use image::DynamicImage;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// JPEG quality for images shipped to the detection service
const UPLOAD_QUALITY: u8 = 90;

#[derive(Deserialize, Debug)]
struct RemoteResponse {
    results: Vec<RemoteImageResult>,
}

#[derive(Deserialize, Debug)]
struct RemoteImageResult {
    #[serde(default)]
    detections: Vec<RemoteDetection>,
}

#[derive(Deserialize, Debug)]
struct RemoteDetection {
    #[serde(default)]
    class_id: Option<usize>,
    #[serde(default)]
    label: Option<String>,
    confidence: f32,
    bbox: [f32; 4],
}

impl RemoteDetection {
    fn class(&self) -> Option<TrafficClass> {
        match self.class_id {
            Some(id) => TrafficClass::from_coco_id(id),
            None => self.label.as_deref().and_then(TrafficClass::from_label),
        }
    }
}

/// Detector backed by an HTTP detection service.
///
/// One multipart POST per batch, images in submission order under the
/// repeated `images` field.
pub struct RemoteDetector {
    client: Client,
    url: Url,
    min_confidence: f32,
}

impl RemoteDetector {
    /// Must be built outside of an async runtime context.
    pub fn new(url: Url, timeout: Duration, min_confidence: f32) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url,
            min_confidence,
        })
    }
}

/// Map a service response onto per-image detection sets.
fn parse_response(
    body: &[u8],
    expected: usize,
    min_confidence: f32,
) -> PipelineResult<Vec<DetectionSet>> {
    let response: RemoteResponse = serde_json::from_slice(body)
        .map_err(|e| PipelineError::Inference(format!("bad detector response: {}", e)))?;

    if response.results.len() != expected {
        return Err(PipelineError::Inference(format!(
            "detector returned {} results for {} images",
            response.results.len(),
            expected
        )));
    }

    Ok(response
        .results
        .into_iter()
        .map(|result| {
            let detections = result
                .detections
                .into_iter()
                .filter(|d| d.confidence >= min_confidence)
                .filter_map(|d| {
                    let class = d.class()?;
                    let [x1, y1, x2, y2] = d.bbox;
                    Some(Detection {
                        class,
                        confidence: d.confidence,
                        bbox: BBox { x1, y1, x2, y2 },
                    })
                })
                .collect();
            DetectionSet::from_detections(detections)
        })
        .collect())
}

impl Inference for RemoteDetector {
    fn infer(&mut self, images: &[DynamicImage]) -> PipelineResult<Vec<DetectionSet>> {
        let mut form = Form::new();
        for (i, image) in images.iter().enumerate() {
            let jpeg = encode_jpeg(&image.to_rgb8(), UPLOAD_QUALITY)
                .map_err(|e| PipelineError::Inference(e.to_string()))?;
            let part = Part::bytes(jpeg)
                .file_name(format!("{}.jpg", i))
                .mime_str("image/jpeg")
                .map_err(|e| PipelineError::Inference(e.to_string()))?;
            form = form.part("images", part);
        }

        let response = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .map_err(|e| PipelineError::Inference(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Inference(format!(
                "detector responded with status {}",
                status
            )));
        }

        let body = response
            .bytes()
            .map_err(|e| PipelineError::Inference(e.to_string()))?;
        parse_response(&body, images.len(), self.min_confidence)
    }

    fn name(&self) -> &str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counts_known_classes() {
        let body = br#"{"results": [
            {"detections": [
                {"class_id": 2, "label": "car", "confidence": 0.9, "bbox": [0, 0, 10, 10]},
                {"class_id": 3, "confidence": 0.8, "bbox": [5, 5, 20, 20]},
                {"label": "motorbike", "confidence": 0.7, "bbox": [1, 1, 2, 2]},
                {"class_id": 4, "label": "airplane", "confidence": 0.99, "bbox": [0, 0, 1, 1]},
                {"class_id": 7, "confidence": 0.1, "bbox": [0, 0, 1, 1]}
            ]},
            {"detections": []}
        ]}"#;
        let sets = parse_response(body, 2, 0.35).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].total, 3);
        assert_eq!(sets[0].details.get("car"), Some(&1));
        assert_eq!(sets[0].details.get("motorcycle"), Some(&2));
        assert_eq!(sets[0].details.get("truck"), None);
        assert_eq!(sets[1].total, 0);
    }

    #[test]
    fn test_missing_detections_field_is_empty_set() {
        let sets = parse_response(br#"{"results": [{}]}"#, 1, 0.0).unwrap();
        assert_eq!(sets[0].total, 0);
    }

    #[test]
    fn test_result_count_mismatch_fails_batch() {
        let err = parse_response(br#"{"results": [{}]}"#, 3, 0.0).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn test_garbage_body_fails_batch() {
        let err = parse_response(b"<html>", 1, 0.0).unwrap_err();
        assert!(err.to_string().contains("bad detector response"));
    }
}
