// Pipeline orchestrator: wires stages together and owns their lifecycle
//
// ingress -> [admission] -> download pool -> [inference] -> batch scheduler
//         -> [upload] -> upload pool -> output topic
//
// Every sender is owned by the stage that produces into it, so end of input
// drains stage by stage as each queue disconnects.

use crate::broker::{EventSource, RecordSink};
use crate::event::CameraUpdateEvent;
use crate::pipeline::detection::InferenceFactory;
use crate::pipeline::download::{download_worker, Downloader};
use crate::pipeline::fetch::SnapshotFetcher;
use crate::pipeline::ingress::ingress_loop;
use crate::pipeline::queue::{bounded_queue, QueueConsumer};
use crate::pipeline::scheduler::spawn_scheduler;
use crate::pipeline::storage::ObjectStore;
use crate::pipeline::types::{Counters, DecodedTask, InferenceOutput};
use crate::pipeline::upload::{upload_worker, Publisher};
use crate::pipeline::workers::{spawn_worker, WorkerPool};
use crate::service_context::ServiceContext;
use anyhow::Result;
use std::sync::Arc;
use std::thread::JoinHandle;

/// External collaborators the pipeline runs against.
pub struct PipelineComponents {
    pub source: Box<dyn EventSource>,
    pub fetcher: Arc<dyn SnapshotFetcher>,
    pub inference: InferenceFactory,
    pub store: Option<Arc<dyn ObjectStore>>,
    pub sink: Arc<dyn RecordSink>,
}

/// Running pipeline. Holds only the consuming ends of the queues so it never
/// keeps a stage's input open.
pub struct PipelineHandle {
    ctx: Arc<ServiceContext>,
    ingress: JoinHandle<Result<()>>,
    downloads: WorkerPool,
    scheduler: JoinHandle<Result<()>>,
    uploads: WorkerPool,
    admission_rx: QueueConsumer<CameraUpdateEvent>,
    inference_rx: QueueConsumer<DecodedTask>,
    upload_rx: QueueConsumer<InferenceOutput>,
}

/// Start every stage. The detector loads first; if it fails nothing else is started.
pub fn start_pipeline(ctx: Arc<ServiceContext>, components: PipelineComponents) -> Result<PipelineHandle> {
    let config = &ctx.config;
    let (admission_tx, admission_rx) = bounded_queue("admission", config.admission_capacity());
    let (inference_tx, inference_rx) =
        bounded_queue("inference", config.batch.inference_queue_capacity());
    let (upload_tx, upload_rx) = bounded_queue("upload", config.batch.upload_queue_capacity());

    ctx.state.register_queue("admission", admission_rx.probe());
    ctx.state.register_queue("inference", inference_rx.probe());
    ctx.state.register_queue("upload", upload_rx.probe());

    tracing::info!(
        "Starting pipeline: {} download workers, {} upload workers, batch {} / {:?}, queues {}/{}/{}",
        config.download_workers,
        config.upload_workers,
        config.batch.max_batch_size,
        config.batch.batch_timeout,
        config.admission_capacity(),
        config.batch.inference_queue_capacity(),
        config.batch.upload_queue_capacity()
    );

    let scheduler = spawn_scheduler(
        components.inference,
        inference_rx.clone(),
        upload_tx,
        ctx.clone(),
    )?;

    let publisher = Arc::new(Publisher::new(
        components.store,
        components.sink,
        config.display_offset,
    ));
    let uploads = WorkerPool::start("upload", config.upload_workers, &ctx, |_| {
        let rx = upload_rx.clone();
        let publisher = publisher.clone();
        let ctx = ctx.clone();
        move || upload_worker(rx, publisher, ctx)
    })?;

    let downloader = Arc::new(Downloader::new(components.fetcher, config.fetch.retry));
    let downloads = WorkerPool::start("download", config.download_workers, &ctx, |_| {
        let rx = admission_rx.clone();
        let tx = inference_tx.clone();
        let downloader = downloader.clone();
        let ctx = ctx.clone();
        move || download_worker(rx, tx, downloader, ctx)
    })?;
    drop(inference_tx);

    let source = components.source;
    let ingress = spawn_worker("ingress", 0, ctx.clone(), {
        let ctx = ctx.clone();
        move || ingress_loop(source, admission_tx, ctx)
    })?;

    Ok(PipelineHandle {
        ctx,
        ingress,
        downloads,
        scheduler,
        uploads,
        admission_rx,
        inference_rx,
        upload_rx,
    })
}

impl PipelineHandle {
    /// Wait for every stage to finish, upstream first. Items still queued
    /// after a shutdown are dropped and counted. Fails if any thread panicked
    /// or the batch scheduler stopped with an error.
    pub fn join(self) -> Result<()> {
        let mut panicked = 0;
        if self.ingress.join().is_err() {
            panicked += 1;
        }
        panicked += self.downloads.join();
        let scheduler_error = match self.scheduler.join() {
            Ok(result) => result.err(),
            Err(_) => {
                panicked += 1;
                None
            }
        };
        panicked += self.uploads.join();

        let leftover = self.admission_rx.discard_pending()
            + self.inference_rx.discard_pending()
            + self.upload_rx.discard_pending();
        if leftover > 0 {
            Counters::add(&self.ctx.state.counters.dropped_at_shutdown, leftover as u64);
            tracing::info!("Dropped {} queued items at shutdown", leftover);
        }

        tracing::info!("Pipeline stopped: {}", self.ctx.state.to_progress_json()["counters"]);
        if panicked > 0 {
            anyhow::bail!("{} pipeline threads panicked", panicked);
        }
        match scheduler_error {
            Some(e) => Err(e.context("Batch scheduler stopped")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::detection::Inference;
    use crate::pipeline::testing::{
        event_json, InferenceProbe, MemorySink, MockFetcher, MockInference, MockStore, VecSource,
    };
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    struct Harness {
        sink: Arc<MemorySink>,
        probe: Arc<InferenceProbe>,
        ctx: Arc<ServiceContext>,
    }

    fn run_to_completion(
        config: PipelineConfig,
        messages: Vec<Vec<u8>>,
        fetcher: MockFetcher,
        mock: MockInference,
        probe: Arc<InferenceProbe>,
        store: MockStore,
    ) -> Harness {
        let ctx = Arc::new(ServiceContext::new(config));
        let sink = Arc::new(MemorySink::default());
        let components = PipelineComponents {
            source: Box::new(VecSource::new(messages)),
            fetcher: Arc::new(fetcher),
            inference: Box::new(move || -> Result<Box<dyn Inference>> { Ok(Box::new(mock)) }),
            store: Some(Arc::new(store)),
            sink: sink.clone(),
        };
        start_pipeline(ctx.clone(), components).unwrap().join().unwrap();
        Harness { sink, probe, ctx }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("cam-{}", i)).collect()
    }

    #[test]
    fn test_end_of_input_drains_every_event() {
        let cameras = ids(10);
        let (mock, probe) = MockInference::new();
        let h = run_to_completion(
            PipelineConfig::test_defaults(),
            cameras.iter().map(|id| event_json(id)).collect(),
            MockFetcher::default(),
            mock,
            probe,
            MockStore::default(),
        );

        let published: BTreeSet<String> = h.sink.records().into_iter().map(|r| r.camera_id).collect();
        assert_eq!(published, cameras.into_iter().collect());
        assert_eq!(h.probe.sizes().iter().sum::<usize>(), 10);
        assert!(h.probe.sizes().iter().all(|&s| (1..=4).contains(&s)));
        assert_eq!(h.ctx.state.counters.published.load(Ordering::Relaxed), 10);
        assert_eq!(h.ctx.state.active_workers("download"), 0);
        assert_eq!(h.ctx.state.active_workers("upload"), 0);
    }

    #[test]
    fn test_failed_fetch_only_drops_that_camera() {
        let cameras = ids(6);
        let mut messages: Vec<Vec<u8>> = cameras.iter().map(|id| event_json(id)).collect();
        messages.insert(3, event_json("cam-7"));
        let (mock, probe) = MockInference::new();

        let h = run_to_completion(
            PipelineConfig::test_defaults(),
            messages,
            MockFetcher::failing_for(&["cam-7"]),
            mock,
            probe,
            MockStore::default(),
        );

        let published: BTreeSet<String> = h.sink.records().into_iter().map(|r| r.camera_id).collect();
        assert!(!published.contains("cam-7"));
        assert_eq!(published, cameras.into_iter().collect());
        assert_eq!(h.ctx.state.counters.fetch_failed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_failed_batch_drops_only_its_cameras() {
        let mut config = PipelineConfig::test_defaults();
        config.batch.max_batch_size = 2;
        config.download_workers = 1;
        let (mut mock, probe) = MockInference::new();
        mock.fail_calls.insert(1);

        let h = run_to_completion(
            config,
            ids(6).iter().map(|id| event_json(id)).collect(),
            MockFetcher::default(),
            mock,
            probe,
            MockStore::default(),
        );

        let records = h.sink.records();
        let failed = h.probe.sizes()[0];
        assert_eq!(records.len(), 6 - failed);
        assert_eq!(h.ctx.state.counters.batch_failures.load(Ordering::Relaxed), 1);
        assert!(h.probe.calls.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_upload_failure_publishes_without_image_url() {
        let (mock, probe) = MockInference::new();
        let h = run_to_completion(
            PipelineConfig::test_defaults(),
            vec![event_json("cam-1")],
            MockFetcher::default(),
            mock,
            probe,
            MockStore {
                fail: true,
                ..Default::default()
            },
        );

        let records = h.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].camera_id, "cam-1");
        assert!(records[0].annotated_image_url.is_none());
        assert_eq!(records[0].detection_details.get("car"), Some(&1));
    }

    #[test]
    fn test_duplicate_events_yield_independent_records() {
        let (mock, probe) = MockInference::new();
        let h = run_to_completion(
            PipelineConfig::test_defaults(),
            vec![event_json("cam-1"), event_json("cam-1")],
            MockFetcher::default(),
            mock,
            probe,
            MockStore::default(),
        );

        let records = h.sink.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.camera_id == "cam-1"));
        assert_eq!(h.sink.keys(), vec!["cam-1", "cam-1"]);
    }

    #[test]
    fn test_records_only_for_submitted_cameras() {
        let cameras = ids(12);
        let (mock, probe) = MockInference::new();
        let mut messages: Vec<Vec<u8>> = cameras.iter().map(|id| event_json(id)).collect();
        messages.push(b"garbage".to_vec());

        let h = run_to_completion(
            PipelineConfig::test_defaults(),
            messages,
            MockFetcher::default(),
            mock,
            probe,
            MockStore::default(),
        );

        let submitted: HashSet<String> = cameras.into_iter().collect();
        assert!(h
            .sink
            .records()
            .iter()
            .all(|r| submitted.contains(&r.camera_id)));
        assert_eq!(h.ctx.state.counters.malformed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_slow_inference_backs_up_downloads() {
        let mut config = PipelineConfig::test_defaults();
        config.batch.max_batch_size = 2;
        config.batch.inference_queue_multiplier = 1;
        config.download_workers = 4;
        let capacity = config.batch.inference_queue_capacity();
        let (mut mock, probe) = MockInference::new();
        mock.delay = Duration::from_millis(100);

        let h = run_to_completion(
            config,
            ids(16).iter().map(|id| event_json(id)).collect(),
            MockFetcher::default(),
            mock,
            probe,
            MockStore::default(),
        );

        let queues = h.ctx.state.to_progress_json()["queues"].clone();
        assert_eq!(queues["inference"]["capacity"], capacity);
        assert!(queues["inference"]["blocked_pushes"].as_u64().unwrap() > 0);
        assert_eq!(h.sink.records().len(), 16);
        assert!(!h.probe.overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_stops_a_running_pipeline() {
        let ctx = Arc::new(ServiceContext::new(PipelineConfig::test_defaults()));
        let mut source = VecSource::new(ids(3).iter().map(|id| event_json(id)).collect());
        source.hold_open = true;
        let (mock, _probe) = MockInference::new();
        let sink = Arc::new(MemorySink::default());
        let components = PipelineComponents {
            source: Box::new(source),
            fetcher: Arc::new(MockFetcher::default()),
            inference: Box::new(move || -> Result<Box<dyn Inference>> { Ok(Box::new(mock)) }),
            store: None,
            sink: sink.clone(),
        };

        let handle = start_pipeline(ctx.clone(), components).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(sink.records().len(), 3);

        let start = Instant::now();
        ctx.request_shutdown();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(ctx.state.active_workers("ingress"), 0);
        assert_eq!(ctx.state.active_workers("inference"), 0);
    }

    struct PanickingInference;

    impl Inference for PanickingInference {
        fn infer(
            &mut self,
            _images: &[image::DynamicImage],
        ) -> crate::error::PipelineResult<Vec<crate::pipeline::types::DetectionSet>> {
            panic!("detector crashed");
        }
    }

    #[test]
    fn test_scheduler_crash_shuts_the_pipeline_down() {
        let mut config = PipelineConfig::test_defaults();
        config.batch.max_batch_size = 2;
        config.batch.inference_queue_multiplier = 1;
        let ctx = Arc::new(ServiceContext::new(config));
        let mut source = VecSource::new(ids(32).iter().map(|id| event_json(id)).collect());
        source.hold_open = true;
        let components = PipelineComponents {
            source: Box::new(source),
            fetcher: Arc::new(MockFetcher::default()),
            inference: Box::new(|| -> Result<Box<dyn Inference>> {
                Ok(Box::new(PanickingInference))
            }),
            store: None,
            sink: Arc::new(MemorySink::default()),
        };

        let start = Instant::now();
        let result = start_pipeline(ctx.clone(), components).unwrap().join();
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(ctx.is_shutting_down());
        assert_eq!(ctx.state.active_workers("inference"), 0);
        assert_eq!(ctx.state.active_workers("download"), 0);
        assert_eq!(ctx.state.active_workers("ingress"), 0);
    }

    #[test]
    fn test_detector_load_failure_is_fatal() {
        let ctx = Arc::new(ServiceContext::new(PipelineConfig::test_defaults()));
        let components = PipelineComponents {
            source: Box::new(VecSource::new(vec![event_json("cam-1")])),
            fetcher: Arc::new(MockFetcher::default()),
            inference: Box::new(|| -> Result<Box<dyn Inference>> { anyhow::bail!("no model") }),
            store: None,
            sink: Arc::new(MemorySink::default()),
        };
        let err = start_pipeline(ctx.clone(), components).err().unwrap();
        assert!(err.to_string().contains("no model"));
        assert_eq!(ctx.state.active_workers("download"), 0);
    }
}
