// Test doubles for the pipeline's external collaborators

use crate::broker::{EventSource, Polled, RecordSink};
use crate::error::{PipelineError, PipelineResult};
use crate::event::{CameraUpdateEvent, OutputRecord};
use crate::pipeline::classes::TrafficClass;
use crate::pipeline::detection::Inference;
use crate::pipeline::fetch::SnapshotFetcher;
use crate::pipeline::storage::ObjectStore;
use crate::pipeline::types::{BBox, DecodedTask, Detection, DetectionSet};
use image::{DynamicImage, ImageFormat};
use std::collections::{HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn event_json(camera_id: &str) -> Vec<u8> {
    serde_json::json!({
        "id": camera_id,
        "name": format!("Camera {}", camera_id),
        "dist": "Quan 1",
        "liveviewUrl": format!("cameras/{}/snapshot", camera_id),
        "loc": {"type": "Point", "coordinates": [106.7, 10.77]},
        "timestamp": 1_700_000_000_000u64,
    })
    .to_string()
    .into_bytes()
}

pub fn event(camera_id: &str) -> CameraUpdateEvent {
    CameraUpdateEvent::from_slice(&event_json(camera_id)).unwrap()
}

pub fn decoded(camera_id: &str) -> DecodedTask {
    DecodedTask {
        event: event(camera_id),
        image: DynamicImage::new_rgb8(16, 16),
    }
}

pub fn png_bytes() -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::new_rgb8(16, 16)
        .write_to(&mut buffer, ImageFormat::Png)
        .unwrap();
    buffer.into_inner()
}

/// Serves a small PNG for every camera except the ones told to fail.
#[derive(Default)]
pub struct MockFetcher {
    pub fail_for: HashSet<String>,
    pub corrupt_for: HashSet<String>,
    pub calls: AtomicUsize,
}

impl MockFetcher {
    pub fn failing_for(ids: &[&str]) -> Self {
        Self {
            fail_for: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

impl SnapshotFetcher for MockFetcher {
    fn fetch(&self, event: &CameraUpdateEvent) -> PipelineResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.contains(&event.camera_id) {
            return Err(PipelineError::fetch(&event.snapshot_url, "status 404"));
        }
        if self.corrupt_for.contains(&event.camera_id) {
            return Ok(b"definitely not an image".to_vec());
        }
        Ok(png_bytes())
    }
}

/// Observations shared between a `MockInference` and the test.
#[derive(Default)]
pub struct InferenceProbe {
    pub batch_sizes: Mutex<Vec<usize>>,
    pub call_times: Mutex<Vec<Instant>>,
    pub in_flight: AtomicBool,
    pub overlapped: AtomicBool,
    pub calls: AtomicUsize,
}

impl InferenceProbe {
    pub fn sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

/// Detects one car per image. Can be slowed down or told to fail given calls.
pub struct MockInference {
    pub probe: Arc<InferenceProbe>,
    pub delay: Duration,
    /// 1-based call numbers that fail
    pub fail_calls: HashSet<usize>,
}

impl MockInference {
    pub fn new() -> (Self, Arc<InferenceProbe>) {
        let probe = Arc::new(InferenceProbe::default());
        (
            Self {
                probe: probe.clone(),
                delay: Duration::ZERO,
                fail_calls: HashSet::new(),
            },
            probe,
        )
    }
}

impl Inference for MockInference {
    fn infer(&mut self, images: &[DynamicImage]) -> PipelineResult<Vec<DetectionSet>> {
        if self.probe.in_flight.swap(true, Ordering::SeqCst) {
            self.probe.overlapped.store(true, Ordering::SeqCst);
        }
        let call = self.probe.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.batch_sizes.lock().unwrap().push(images.len());
        self.probe.call_times.lock().unwrap().push(Instant::now());

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.probe.in_flight.store(false, Ordering::SeqCst);

        if self.fail_calls.contains(&call) {
            return Err(PipelineError::Inference(format!("call {} failed", call)));
        }
        Ok(images
            .iter()
            .map(|_| {
                DetectionSet::from_detections(vec![Detection {
                    class: TrafficClass::Car,
                    confidence: 0.9,
                    bbox: BBox {
                        x1: 1.0,
                        y1: 1.0,
                        x2: 8.0,
                        y2: 8.0,
                    },
                }])
            })
            .collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[derive(Default)]
pub struct MockStore {
    pub fail: bool,
    pub keys: Mutex<Vec<String>>,
}

impl ObjectStore for MockStore {
    fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> PipelineResult<String> {
        assert_eq!(content_type, "image/jpeg");
        assert!(!bytes.is_empty());
        if self.fail {
            return Err(PipelineError::upload(key, "connection refused"));
        }
        self.keys.lock().unwrap().push(key.to_string());
        Ok(format!("http://store.test/bucket/{}", key))
    }
}

/// Collects published records in memory.
#[derive(Default)]
pub struct MemorySink {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<OutputRecord> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn publish(&self, key: &str, payload: &[u8]) -> PipelineResult<()> {
        self.published
            .lock()
            .unwrap()
            .push((key.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Finite in-memory source. With `hold_open` it idles instead of exhausting.
pub struct VecSource {
    pub messages: VecDeque<Vec<u8>>,
    pub hold_open: bool,
}

impl VecSource {
    pub fn new(messages: Vec<Vec<u8>>) -> Self {
        Self {
            messages: messages.into(),
            hold_open: false,
        }
    }
}

impl EventSource for VecSource {
    fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled> {
        match self.messages.pop_front() {
            Some(message) => Ok(Polled::Message(message)),
            None if self.hold_open => {
                std::thread::sleep(timeout);
                Ok(Polled::Idle)
            }
            None => Ok(Polled::Exhausted),
        }
    }
}
