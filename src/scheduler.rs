//! Persistence scheduler: a periodic pass moves dirty chunks that have been
//! untouched for the stabilization threshold into the submission queue, then
//! kicks a background drain.
//!
//! `tick` is synchronous so tests and hosts can pump it directly; `spawn`
//! drives it from an owned tokio interval until the handle is stopped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::metrics::{metric_names, MetricsRegistry};
use crate::queue::SubmissionQueue;
use crate::store::SampleStore;

/// Receives delivery failures, drain timeouts and backpressure warnings.
pub type ErrorCallback = Arc<dyn Fn(&BufferError) + Send + Sync>;

/// What a single scheduler pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub enqueued: Vec<usize>,
    pub queue_depth: usize,
    pub backpressure: bool,
}

pub struct PersistScheduler {
    store: Arc<Mutex<SampleStore>>,
    queue: Arc<SubmissionQueue>,
    metrics: Arc<MetricsRegistry>,
    persist_interval: Duration,
    stabilization: Duration,
    backpressure_threshold: usize,
    drain_timeout: Duration,
    on_error: Option<ErrorCallback>,
}

impl PersistScheduler {
    pub fn new(
        config: &BufferConfig,
        store: Arc<Mutex<SampleStore>>,
        queue: Arc<SubmissionQueue>,
        metrics: Arc<MetricsRegistry>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            persist_interval: config.persist_interval(),
            stabilization: config.stabilization_threshold(),
            backpressure_threshold: config.backpressure_threshold,
            drain_timeout: config.drain_timeout(),
            on_error,
        }
    }

    fn report_error(&self, err: &BufferError) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }

    /// Enqueue `candidates`, warning once if the queue is over the threshold.
    /// The warning is advisory: every candidate is still enqueued.
    fn enqueue_all(&self, store: &mut SampleStore, candidates: Vec<usize>) -> TickReport {
        let mut report = TickReport::default();
        for index in candidates {
            let depth = store.queue_depth();
            if depth > self.backpressure_threshold && !report.backpressure {
                report.backpressure = true;
                let err = BufferError::Backpressure {
                    depth,
                    threshold: self.backpressure_threshold,
                };
                warn!(depth, threshold = self.backpressure_threshold, "backpressure: server falling behind");
                self.report_error(&err);
            }
            store.enqueue(index);
            report.enqueued.push(index);
        }
        report.queue_depth = store.queue_depth();
        report
    }

    /// One scheduler pass: enqueue every stable dirty chunk.
    pub fn tick(&self, now: Instant) -> TickReport {
        let mut store = self.store.lock();
        let candidates = store.stable_chunks(now, self.stabilization);
        let report = self.enqueue_all(&mut store, candidates);
        drop(store);

        self.metrics
            .record(metric_names::QUEUE_DEPTH, report.queue_depth as f64);
        if !report.enqueued.is_empty() {
            debug!(enqueued = ?report.enqueued, queue_depth = report.queue_depth, "chunks_enqueued");
        }
        report
    }

    /// Enqueue every dirty chunk now, ignoring the stabilization threshold.
    pub fn force_enqueue(&self) -> TickReport {
        let mut store = self.store.lock();
        let candidates = store.dirty_unqueued();
        self.enqueue_all(&mut store, candidates)
    }

    /// Pass + background drain. Drain errors go to the error callback.
    fn run_pass(self: &Arc<Self>) {
        let report = self.tick(Instant::now());
        if report.queue_depth == 0 {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.queue.drain(scheduler.drain_timeout).await {
                scheduler.report_error(&e);
            }
        });
    }

    /// Start the periodic pass on the current tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let cancelled = token.child_token();
        let scheduler = Arc::clone(self);
        let period = self.persist_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "persist scheduler started");
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => scheduler.run_pass(),
                }
            }
            info!("persist scheduler stopped");
        });

        SchedulerHandle {
            token,
            task: Some(task),
        }
    }
}

/// Keeps the periodic pass alive. Stopping or dropping it ends the timer;
/// drains already in flight run to completion.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop and wait for the timer task to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
