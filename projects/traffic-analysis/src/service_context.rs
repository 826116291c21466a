// Service context shared by every worker
//
// Holds the validated configuration, the running flag and the pipeline
// state. Workers receive an `Arc<ServiceContext>` instead of reading globals.

use crate::config::PipelineConfig;
use crate::pipeline::types::PipelineState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub struct ServiceContext {
    pub config: PipelineConfig,
    pub state: PipelineState,
    running: AtomicBool,
}

impl ServiceContext {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            state: PipelineState::new(),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.is_running()
    }

    /// Ask every stage to stop at its next blocking-call boundary.
    pub fn request_shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
        }
    }

    /// Bound on every blocking wait inside the pipeline.
    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Sleep for `duration` in poll-sized slices. Returns false if shutdown
    /// was requested before the full duration elapsed.
    pub fn sleep_while_running(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(self.poll_interval()));
        }
    }
}
