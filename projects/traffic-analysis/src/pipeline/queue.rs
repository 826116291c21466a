// Bounded hand-off queues between pipeline stages
//
// Thin wrapper over crossbeam bounded channels: push blocks while the queue is
// full (never drops), pull waits at most the given timeout. Both observe the
// service shutdown flag at poll-interval granularity.

use crate::pipeline::types::QueueProbe;
use crate::service_context::ServiceContext;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct QueueShared {
    name: String,
    capacity: usize,
    blocked_pushes: AtomicU64,
}

/// Producer side. Cheap to clone; the queue closes once every producer is dropped.
pub struct QueueProducer<T> {
    tx: Sender<T>,
    shared: Arc<QueueShared>,
}

impl<T> Clone for QueueProducer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Consumer side. Cheap to clone for worker pools.
pub struct QueueConsumer<T> {
    rx: Receiver<T>,
    shared: Arc<QueueShared>,
}

impl<T> Clone for QueueConsumer<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        }
    }
}

/// Why a push gave the item back
#[derive(Debug)]
pub enum PushError<T> {
    /// Queue stayed full past one poll interval after shutdown was requested
    Shutdown(T),
    /// Every consumer is gone
    Closed(T),
}

/// Outcome of a bounded wait on a queue
#[derive(Debug)]
pub enum Pulled<T> {
    Item(T),
    Empty,
    /// Every producer is gone and the queue is drained
    Closed,
}

pub fn bounded_queue<T>(name: &str, capacity: usize) -> (QueueProducer<T>, QueueConsumer<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = channel::bounded(capacity);
    let shared = Arc::new(QueueShared {
        name: name.to_string(),
        capacity,
        blocked_pushes: AtomicU64::new(0),
    });
    (
        QueueProducer {
            tx,
            shared: shared.clone(),
        },
        QueueConsumer { rx, shared },
    )
}

impl<T> QueueProducer<T> {
    /// Enqueue, blocking while the queue is full.
    pub fn push(&self, item: T, ctx: &ServiceContext) -> Result<(), PushError<T>> {
        let mut item = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Disconnected(item)) => return Err(PushError::Closed(item)),
            Err(TrySendError::Full(item)) => item,
        };

        self.shared.blocked_pushes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("{} queue full, producer blocked", self.shared.name);

        loop {
            match self.tx.send_timeout(item, ctx.poll_interval()) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Disconnected(returned)) => {
                    return Err(PushError::Closed(returned))
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    if ctx.is_shutting_down() {
                        return Err(PushError::Shutdown(returned));
                    }
                    item = returned;
                }
            }
        }
    }
}

impl<T> QueueConsumer<T> {
    /// Wait at most `timeout` for the next item.
    pub fn pull_timeout(&self, timeout: Duration) -> Pulled<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Pulled::Item(item),
            Err(RecvTimeoutError::Timeout) => Pulled::Empty,
            Err(RecvTimeoutError::Disconnected) => Pulled::Closed,
        }
    }

    /// Discard whatever is queued right now, returning how many items were dropped.
    pub fn discard_pending(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl<T: Send + 'static> QueueConsumer<T> {
    /// Probe for the status endpoint.
    pub fn probe(&self) -> Arc<dyn QueueProbe> {
        Arc::new(Probe {
            rx: self.rx.clone(),
            shared: self.shared.clone(),
        })
    }
}

struct Probe<T> {
    rx: Receiver<T>,
    shared: Arc<QueueShared>,
}

impl<T: Send> QueueProbe for Probe<T> {
    fn len(&self) -> usize {
        self.rx.len()
    }

    fn capacity(&self) -> usize {
        self.shared.capacity
    }

    fn blocked_pushes(&self) -> u64 {
        self.shared.blocked_pushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use std::time::Instant;

    fn ctx() -> Arc<ServiceContext> {
        Arc::new(ServiceContext::new(PipelineConfig::test_defaults()))
    }

    #[test]
    fn test_fifo_single_producer() {
        let ctx = ctx();
        let (tx, rx) = bounded_queue("test", 8);
        for i in 0..5 {
            tx.push(i, &ctx).unwrap();
        }
        let mut seen = Vec::new();
        while let Pulled::Item(i) = rx.pull_timeout(Duration::from_millis(10)) {
            seen.push(i);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_pull_times_out_when_empty() {
        let (_tx, rx) = bounded_queue::<u32>("test", 2);
        let start = Instant::now();
        assert!(matches!(rx.pull_timeout(Duration::from_millis(30)), Pulled::Empty));
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_closed_after_producers_dropped() {
        let ctx = ctx();
        let (tx, rx) = bounded_queue("test", 2);
        tx.push(1, &ctx).unwrap();
        drop(tx);
        assert!(matches!(rx.pull_timeout(Duration::from_millis(10)), Pulled::Item(1)));
        assert!(matches!(rx.pull_timeout(Duration::from_millis(10)), Pulled::Closed));
    }

    #[test]
    fn test_push_blocks_until_consumer_drains() {
        let ctx = ctx();
        let (tx, rx) = bounded_queue("test", 1);
        tx.push(1, &ctx).unwrap();
        let probe = rx.probe();
        assert_eq!(probe.len(), 1);

        let producer_ctx = ctx.clone();
        let producer = std::thread::spawn(move || {
            let start = Instant::now();
            tx.push(2, &producer_ctx).unwrap();
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(200));
        // Capacity is never exceeded while the producer waits
        assert_eq!(probe.len(), 1);
        assert_eq!(probe.blocked_pushes(), 1);

        assert!(matches!(rx.pull_timeout(Duration::from_millis(10)), Pulled::Item(1)));
        let blocked_for = producer.join().unwrap();
        assert!(blocked_for >= Duration::from_millis(150));
        assert!(matches!(rx.pull_timeout(Duration::from_millis(100)), Pulled::Item(2)));
    }

    #[test]
    fn test_push_gives_item_back_on_shutdown() {
        let ctx = ctx();
        let (tx, _rx) = bounded_queue("test", 1);
        tx.push(1, &ctx).unwrap();
        ctx.request_shutdown();
        match tx.push(2, &ctx) {
            Err(PushError::Shutdown(item)) => assert_eq!(item, 2),
            other => panic!("unexpected push result: {:?}", other),
        }
    }

    #[test]
    fn test_push_to_closed_queue() {
        let ctx = ctx();
        let (tx, rx) = bounded_queue("test", 1);
        drop(rx);
        assert!(matches!(tx.push(7, &ctx), Err(PushError::Closed(7))));
    }

    #[test]
    fn test_discard_pending() {
        let ctx = ctx();
        let (tx, rx) = bounded_queue("test", 4);
        tx.push(1, &ctx).unwrap();
        tx.push(2, &ctx).unwrap();
        assert_eq!(rx.discard_pending(), 2);
        assert_eq!(rx.probe().len(), 0);
    }
}
