// Batch scheduler
//
// Single dedicated thread between the inference queue and the upload queue.
// Buffers decoded snapshots and dispatches them to the detector when the
// buffer is full (size) or when the oldest buffered item has waited
// `batch_timeout` (timeout). Size wins when both hold. The deadline is armed
// when the buffer goes from empty to non-empty and is re-armed only after a
// dispatch. This thread is the only caller of `Inference::infer`.

use crate::pipeline::detection::{infer_checked, Inference, InferenceFactory};
use crate::pipeline::queue::{PushError, Pulled, QueueConsumer, QueueProducer};
use crate::pipeline::types::{Counters, DecodedTask, InferenceOutput};
use crate::pipeline::workers::spawn_critical_worker;
use crate::service_context::ServiceContext;
use anyhow::{anyhow, Result};
use crossbeam::channel;
use image::DynamicImage;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchTrigger {
    /// Buffer reached `max_batch_size`
    Size,
    /// Oldest buffered item waited `batch_timeout`
    Timeout,
    /// Input closed; flush the remainder
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Accumulating { armed_at: Instant },
    /// Inference call in flight; new items wait in the queue
    Dispatching,
}

impl SchedulerState {
    pub fn label(&self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Accumulating { .. } => "accumulating",
            SchedulerState::Dispatching => "dispatching",
        }
    }
}

/// Dispatch decision for the current buffer. Pure so it can be tested
/// without threads or clocks.
pub fn decide(
    buffered: usize,
    max_batch_size: usize,
    armed_at: Option<Instant>,
    batch_timeout: Duration,
    now: Instant,
) -> Option<DispatchTrigger> {
    if buffered == 0 {
        return None;
    }
    if buffered >= max_batch_size {
        return Some(DispatchTrigger::Size);
    }
    match armed_at {
        Some(armed) if now.saturating_duration_since(armed) >= batch_timeout => {
            Some(DispatchTrigger::Timeout)
        }
        _ => None,
    }
}

/// Items buffered for the next dispatch, owned by the scheduler thread.
pub struct BatchSlot {
    items: Vec<DecodedTask>,
    armed_at: Option<Instant>,
}

impl BatchSlot {
    pub fn with_capacity(max_batch_size: usize) -> Self {
        Self {
            items: Vec::with_capacity(max_batch_size),
            armed_at: None,
        }
    }

    pub fn push(&mut self, item: DecodedTask, now: Instant) {
        if self.items.is_empty() {
            self.armed_at = Some(now);
        }
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn armed_at(&self) -> Option<Instant> {
        self.armed_at
    }

    /// Time left until the deadline, if one is armed.
    pub fn remaining(&self, batch_timeout: Duration, now: Instant) -> Option<Duration> {
        self.armed_at
            .map(|armed| (armed + batch_timeout).saturating_duration_since(now))
    }

    /// Hand the buffered items over for dispatch and disarm the deadline.
    pub fn take(&mut self) -> Vec<DecodedTask> {
        self.armed_at = None;
        std::mem::take(&mut self.items)
    }
}

pub struct BatchScheduler {
    inference: Box<dyn Inference>,
    rx: QueueConsumer<DecodedTask>,
    tx: QueueProducer<InferenceOutput>,
    ctx: Arc<ServiceContext>,
    slot: BatchSlot,
    state: SchedulerState,
    max_batch_size: usize,
    batch_timeout: Duration,
}

impl BatchScheduler {
    pub fn new(
        inference: Box<dyn Inference>,
        rx: QueueConsumer<DecodedTask>,
        tx: QueueProducer<InferenceOutput>,
        ctx: Arc<ServiceContext>,
    ) -> Self {
        let max_batch_size = ctx.config.batch.max_batch_size;
        let batch_timeout = ctx.config.batch.batch_timeout;
        Self {
            inference,
            rx,
            tx,
            ctx,
            slot: BatchSlot::with_capacity(max_batch_size),
            state: SchedulerState::Idle,
            max_batch_size,
            batch_timeout,
        }
    }

    /// Run until the inference queue closes (drain) or shutdown is requested.
    pub fn run(mut self) -> Result<()> {
        tracing::info!(
            "Batch scheduler started (max batch {}, timeout {:?}, detector {})",
            self.max_batch_size,
            self.batch_timeout,
            self.inference.name()
        );

        loop {
            if self.ctx.is_shutting_down() {
                let dropped = self.slot.take().len();
                if dropped > 0 {
                    Counters::add(&self.ctx.state.counters.dropped_at_shutdown, dropped as u64);
                    tracing::info!("Dropped {} buffered items at shutdown", dropped);
                }
                break;
            }

            let now = Instant::now();
            if let Some(trigger) = decide(
                self.slot.len(),
                self.max_batch_size,
                self.slot.armed_at(),
                self.batch_timeout,
                now,
            ) {
                self.dispatch(trigger)?;
                continue;
            }

            let poll = self.ctx.poll_interval();
            let wait = self
                .slot
                .remaining(self.batch_timeout, now)
                .map_or(poll, |left| left.min(poll));

            match self.rx.pull_timeout(wait) {
                Pulled::Item(task) => {
                    let now = Instant::now();
                    self.slot.push(task, now);
                    let armed = (self.slot.armed_at(), self.state);
                    if let (Some(armed_at), SchedulerState::Idle) = armed {
                        self.enter(SchedulerState::Accumulating { armed_at });
                    }
                }
                Pulled::Empty => {}
                Pulled::Closed => {
                    if self.ctx.is_running() {
                        if !self.slot.is_empty() {
                            self.dispatch(DispatchTrigger::Drain)?;
                        }
                    } else {
                        let dropped = self.slot.take().len() as u64;
                        Counters::add(&self.ctx.state.counters.dropped_at_shutdown, dropped);
                    }
                    tracing::info!("Inference queue closed, batch scheduler exiting");
                    break;
                }
            }
        }

        Ok(())
    }

    fn enter(&mut self, state: SchedulerState) {
        self.state = state;
        self.ctx.state.set_scheduler_state(state.label());
    }

    /// Run one inference call over the whole slot and fan results out.
    fn dispatch(&mut self, trigger: DispatchTrigger) -> Result<()> {
        let waited = match self.state {
            SchedulerState::Accumulating { armed_at } => armed_at.elapsed(),
            SchedulerState::Idle => Duration::ZERO,
            SchedulerState::Dispatching => {
                anyhow::bail!("dispatch re-entered while a batch is in flight")
            }
        };
        let batch = self.slot.take();
        let size = batch.len();
        self.enter(SchedulerState::Dispatching);

        let ctx = Arc::clone(&self.ctx);
        let counters = &ctx.state.counters;
        Counters::bump(&counters.batches);
        self.ctx.state.record_batch_size(size);
        tracing::debug!(
            "Dispatching batch of {} ({:?} trigger, oldest waited {:?})",
            size,
            trigger,
            waited
        );

        let (events, images): (Vec<_>, Vec<DynamicImage>) =
            batch.into_iter().map(|task| (task.event, task.image)).unzip();

        let start = Instant::now();
        let result = infer_checked(self.inference.as_mut(), &images);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.enter(SchedulerState::Idle);

        let sets = match result {
            Ok(sets) => sets,
            Err(e) => {
                Counters::bump(&counters.batch_failures);
                self.ctx.state.stage_failed("inference", size as u64);
                let cameras: Vec<&str> = events.iter().map(|e| e.camera_id.as_str()).collect();
                tracing::error!(
                    "Inference failed for batch of {}: {}; dropping cameras {:?}",
                    size,
                    e,
                    cameras
                );
                return Ok(());
            }
        };

        Counters::add(&counters.inferred, size as u64);
        self.ctx
            .state
            .update_stage("inference", size as u64, elapsed_ms / size as f64);

        let mut outputs = events
            .into_iter()
            .zip(images)
            .zip(sets)
            .map(|((event, image), detections)| InferenceOutput {
                event,
                detections,
                image,
            });

        while let Some(output) = outputs.next() {
            match self.tx.push(output, &self.ctx) {
                Ok(()) => {}
                Err(PushError::Shutdown(_)) => {
                    let dropped = 1 + outputs.count();
                    Counters::add(&counters.dropped_at_shutdown, dropped as u64);
                    tracing::info!("Dropped {} inference results at shutdown", dropped);
                    break;
                }
                Err(PushError::Closed(_)) => {
                    return Err(anyhow!("upload queue closed while the scheduler was running"));
                }
            }
        }

        Ok(())
    }
}

/// Start the scheduler thread. The detector is built on that thread by
/// `factory`; this call waits for the load to finish so a bad model is
/// fatal at startup.
pub fn spawn_scheduler(
    factory: InferenceFactory,
    rx: QueueConsumer<DecodedTask>,
    tx: QueueProducer<InferenceOutput>,
    ctx: Arc<ServiceContext>,
) -> Result<JoinHandle<Result<()>>> {
    let (init_tx, init_rx) = channel::bounded::<std::result::Result<(), String>>(1);

    let handle = spawn_critical_worker("inference", 0, ctx.clone(), {
        let ctx = ctx.clone();
        move || {
            let inference = match factory() {
                Ok(inference) => {
                    let _ = init_tx.send(Ok(()));
                    inference
                }
                Err(e) => {
                    let _ = init_tx.send(Err(format!("{:#}", e)));
                    return Err(e.context("Failed to load detector"));
                }
            };
            BatchScheduler::new(inference, rx, tx, ctx).run()
        }
    })?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(reason)) => {
            let _ = handle.join();
            Err(anyhow!("Detector failed to load: {}", reason))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("Scheduler thread exited before the detector loaded"))
        }
    }
}
