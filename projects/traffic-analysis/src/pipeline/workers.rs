// Worker threads with an owned lifecycle
//
// A pool is started with a fixed worker count, stopped through the service
// shutdown flag (or by closing its input queue), and drained with `join`.

use crate::service_context::ServiceContext;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Marks the worker stopped however its thread ends, unwinding included.
struct Liveness {
    ctx: Arc<ServiceContext>,
    stage: &'static str,
    index: usize,
    critical: bool,
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.ctx.state.worker_stopped(self.stage);
        if self.critical && thread::panicking() {
            tracing::error!(
                "{} worker #{} panicked, shutting the pipeline down",
                self.stage,
                self.index
            );
            self.ctx.request_shutdown();
        }
    }
}

/// Spawn one named worker thread that reports its lifecycle into the pipeline state.
pub fn spawn_worker<F>(
    stage: &'static str,
    index: usize,
    ctx: Arc<ServiceContext>,
    body: F,
) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    spawn_with(stage, index, ctx, false, body)
}

/// Like [`spawn_worker`], for a stage with no redundant peer: if it fails or
/// panics, shutdown is requested so upstream stages stop blocking on it.
pub fn spawn_critical_worker<F>(
    stage: &'static str,
    index: usize,
    ctx: Arc<ServiceContext>,
    body: F,
) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    spawn_with(stage, index, ctx, true, body)
}

fn spawn_with<F>(
    stage: &'static str,
    index: usize,
    ctx: Arc<ServiceContext>,
    critical: bool,
    body: F,
) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    ctx.state.worker_started(stage);
    let liveness = Liveness {
        ctx: ctx.clone(),
        stage,
        index,
        critical,
    };
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", stage, index))
        .spawn(move || {
            let liveness = liveness;
            tracing::debug!("Spawning {} worker #{}", stage, index);
            let result = body();

            match &result {
                Err(e) if critical => {
                    tracing::error!(
                        "{} worker #{} failed, shutting the pipeline down: {:#}",
                        stage,
                        index,
                        e
                    );
                    liveness.ctx.request_shutdown();
                }
                Err(e) => tracing::error!("{} worker #{} failed: {:#}", stage, index, e),
                Ok(()) => tracing::debug!("{} worker #{} finished gracefully", stage, index),
            }
            drop(liveness);
            result
        });

    // A failed spawn drops the closure, and the guard with it
    spawned.with_context(|| format!("Failed to spawn {} worker #{}", stage, index))
}

/// Fixed-size pool of identical workers for one stage.
pub struct WorkerPool {
    stage: &'static str,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl WorkerPool {
    /// Start `count` workers; `make_worker` builds the body for worker `i`.
    pub fn start<M, F>(
        stage: &'static str,
        count: usize,
        ctx: &Arc<ServiceContext>,
        mut make_worker: M,
    ) -> Result<Self>
    where
        M: FnMut(usize) -> F,
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            handles.push(spawn_worker(stage, index, ctx.clone(), make_worker(index))?);
        }
        tracing::info!("Started {} {} workers", count, stage);
        Ok(Self { stage, handles })
    }

    /// Wait for every worker to exit. Returns the number of workers that panicked;
    /// workers that returned an error have already logged it.
    pub fn join(self) -> usize {
        let mut panicked = 0;
        for handle in self.handles {
            if handle.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            tracing::error!("{} of the {} workers panicked", panicked, self.stage);
        } else {
            tracing::info!("All {} workers stopped", self.stage);
        }
        panicked
    }
}
