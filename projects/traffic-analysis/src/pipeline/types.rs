use crate::event::CameraUpdateEvent;
use crate::pipeline::classes::TrafficClass;
use image::DynamicImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Pixel-space bounding box (x1, y1, x2, y2)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A single counted detection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class: TrafficClass,
    pub confidence: f32,
    pub bbox: BBox,
}

/// Per-image output of the inference capability
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub total: u32,
    pub details: BTreeMap<String, u32>,
    /// Boxes kept for the annotation overlay; not part of the published record.
    #[serde(skip)]
    pub boxes: Vec<Detection>,
}

impl DetectionSet {
    pub fn from_detections(boxes: Vec<Detection>) -> Self {
        let mut details = BTreeMap::new();
        for det in &boxes {
            *details.entry(det.class.as_str().to_string()).or_insert(0) += 1;
        }
        Self {
            total: boxes.len() as u32,
            details,
            boxes,
        }
    }
}

/// A fetched and decoded snapshot, owned by whichever stage currently holds it
#[derive(Debug)]
pub struct DecodedTask {
    pub event: CameraUpdateEvent,
    pub image: DynamicImage,
}

/// Result of one image's inference, handed to the upload stage
#[derive(Debug)]
pub struct InferenceOutput {
    pub event: CameraUpdateEvent,
    pub detections: DetectionSet,
    pub image: DynamicImage,
}

#[derive(Debug, Serialize, Clone, Default)]
pub struct StageProgress {
    pub processed: u64,
    pub failed: u64,
    pub active_workers: usize,
    pub ms_per_item: f64,
}

/// Event counters for the whole pipeline
#[derive(Debug, Default)]
pub struct Counters {
    pub received: AtomicU64,
    pub malformed: AtomicU64,
    pub admitted: AtomicU64,
    pub fetched: AtomicU64,
    pub fetch_failed: AtomicU64,
    pub decode_failed: AtomicU64,
    pub batches: AtomicU64,
    pub batch_failures: AtomicU64,
    pub inferred: AtomicU64,
    pub dropped_at_shutdown: AtomicU64,
    pub uploaded: AtomicU64,
    pub upload_failed: AtomicU64,
    pub published: AtomicU64,
    pub publish_failed: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BTreeMap::from([
            ("received", load(&self.received)),
            ("malformed", load(&self.malformed)),
            ("admitted", load(&self.admitted)),
            ("fetched", load(&self.fetched)),
            ("fetch_failed", load(&self.fetch_failed)),
            ("decode_failed", load(&self.decode_failed)),
            ("batches", load(&self.batches)),
            ("batch_failures", load(&self.batch_failures)),
            ("inferred", load(&self.inferred)),
            ("dropped_at_shutdown", load(&self.dropped_at_shutdown)),
            ("uploaded", load(&self.uploaded)),
            ("upload_failed", load(&self.upload_failed)),
            ("published", load(&self.published)),
            ("publish_failed", load(&self.publish_failed)),
        ])
    }
}

/// Read-only view of a bounded queue for the status endpoint
pub trait QueueProbe: Send + Sync {
    fn len(&self) -> usize;
    fn capacity(&self) -> usize;
    fn blocked_pushes(&self) -> u64;
}

/// Processing state shared between workers and the status handler
pub struct PipelineState {
    pub counters: Counters,
    /// Progress per stage ("ingress", "download", "inference", "upload")
    pub stages: RwLock<BTreeMap<String, StageProgress>>,
    pub queues: RwLock<BTreeMap<String, Arc<dyn QueueProbe>>>,
    pub max_batch_seen: AtomicUsize,
    /// Current batch scheduler state ("idle", "accumulating", "dispatching")
    pub scheduler: RwLock<&'static str>,
    pub start_time: Instant,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    pub const STAGES: [&'static str; 4] = ["ingress", "download", "inference", "upload"];

    pub fn new() -> Self {
        let stages = Self::STAGES
            .iter()
            .map(|s| (s.to_string(), StageProgress::default()))
            .collect();

        Self {
            counters: Counters::default(),
            stages: RwLock::new(stages),
            queues: RwLock::new(BTreeMap::new()),
            max_batch_seen: AtomicUsize::new(0),
            scheduler: RwLock::new("idle"),
            start_time: Instant::now(),
        }
    }

    pub fn update_stage(&self, stage: &str, items: u64, ms_per_item: f64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.processed += items;
                // Simple exponential moving average for smoothing durations
                if progress.ms_per_item == 0.0 {
                    progress.ms_per_item = ms_per_item;
                } else {
                    progress.ms_per_item = progress.ms_per_item * 0.9 + ms_per_item * 0.1;
                }
            }
        }
    }

    pub fn stage_failed(&self, stage: &str, items: u64) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.failed += items;
            }
        }
    }

    pub fn worker_started(&self, stage: &str) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.active_workers += 1;
            }
        }
    }

    pub fn worker_stopped(&self, stage: &str) {
        if let Ok(mut stages) = self.stages.write() {
            if let Some(progress) = stages.get_mut(stage) {
                progress.active_workers = progress.active_workers.saturating_sub(1);
            }
        }
    }

    pub fn active_workers(&self, stage: &str) -> usize {
        self.stages
            .read()
            .ok()
            .and_then(|stages| stages.get(stage).map(|p| p.active_workers))
            .unwrap_or(0)
    }

    pub fn register_queue(&self, name: &str, probe: Arc<dyn QueueProbe>) {
        if let Ok(mut queues) = self.queues.write() {
            queues.insert(name.to_string(), probe);
        }
    }

    pub fn record_batch_size(&self, size: usize) {
        self.max_batch_seen.fetch_max(size, Ordering::Relaxed);
    }

    pub fn set_scheduler_state(&self, label: &'static str) {
        if let Ok(mut current) = self.scheduler.write() {
            *current = label;
        }
    }

    pub fn scheduler_state(&self) -> &'static str {
        self.scheduler.read().map(|s| *s).unwrap_or("unknown")
    }

    pub fn to_progress_json(&self) -> serde_json::Value {
        let stages = self
            .stages
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let stages_json: BTreeMap<String, serde_json::Value> = stages
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    serde_json::json!({
                        "processed": v.processed,
                        "failed": v.failed,
                        "active_workers": v.active_workers,
                        "ms_per_item": v.ms_per_item,
                        "items_per_sec": if v.ms_per_item > 0.0 { 1000.0 / v.ms_per_item } else { 0.0 }
                    }),
                )
            })
            .collect();

        let queues_json: BTreeMap<String, serde_json::Value> = self
            .queues
            .read()
            .map(|queues| {
                queues
                    .iter()
                    .map(|(name, probe)| {
                        (
                            name.clone(),
                            serde_json::json!({
                                "depth": probe.len(),
                                "capacity": probe.capacity(),
                                "blocked_pushes": probe.blocked_pushes(),
                            }),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let elapsed = self.start_time.elapsed().as_secs_f64();
        let published = self.counters.published.load(Ordering::Relaxed);

        serde_json::json!({
            "uptime_secs": elapsed,
            "counters": self.counters.snapshot(),
            "stages": stages_json,
            "queues": queues_json,
            "max_batch_seen": self.max_batch_seen.load(Ordering::Relaxed),
            "scheduler": self.scheduler_state(),
            "published_per_sec": if elapsed > 0.0 { published as f64 / elapsed } else { 0.0 },
        })
    }
}
