//! Submission queue: serial delivery of queued chunks through a transport.
//! At most one drain runs at a time; concurrent callers await the same one.
//! A drain runs as its own task, so a caller timing out only abandons the wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BufferError, Result};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::store::SampleStore;
use crate::transport::ChunkTransport;

type DrainFuture = Shared<BoxFuture<'static, Result<usize>>>;

pub struct SubmissionQueue {
    store: Arc<Mutex<SampleStore>>,
    transport: Arc<dyn ChunkTransport>,
    metrics: Arc<MetricsRegistry>,
    /// Drain currently running, tagged with its generation.
    in_flight: Mutex<Option<(u64, DrainFuture)>>,
    generation: AtomicU64,
}

impl SubmissionQueue {
    pub fn new(
        store: Arc<Mutex<SampleStore>>,
        transport: Arc<dyn ChunkTransport>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            store,
            transport,
            metrics,
            in_flight: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.store.lock().queue_depth()
    }

    pub fn is_draining(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Deliver the head-of-queue chunk. `Ok(None)` when the queue is empty.
    /// On failure the chunk stays at the head of the queue.
    pub async fn submit_one(&self) -> Result<Option<usize>> {
        let packed = {
            let store = self.store.lock();
            match store.queue_front() {
                Some(index) => store.pack(index)?,
                None => return Ok(None),
            }
        };

        let span = self.metrics.span(metric_names::DELIVERY_MS);
        match self.transport.submit(&packed).await {
            Ok(_) => {
                let elapsed_ms = span.finish();
                self.metrics
                    .record(metric_names::PACKED_BYTES, packed.body.len() as f64);
                self.store.lock().complete_delivery(&packed);
                debug!(chunk = packed.index, bytes = packed.body.len(), elapsed_ms, "chunk_delivered");
                Ok(Some(packed.index))
            }
            Err(e) => {
                self.metrics.record(metric_names::DELIVERY_FAILED, 1.0);
                warn!(chunk = packed.index, error = %e, "chunk delivery failed");
                Err(e)
            }
        }
    }

    /// Deliver until the queue is empty, stopping at the first failure.
    async fn deliver_all(&self) -> Result<usize> {
        let mut delivered = 0;
        while self.submit_one().await?.is_some() {
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Join the running drain or start one. The flag is `true` when joined.
    fn start_drain(self: &Arc<Self>) -> (DrainFuture, bool) {
        let mut slot = self.in_flight.lock();
        if let Some((_, running)) = slot.as_ref() {
            return (running.clone(), true);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let span = queue.metrics.span(metric_names::DRAIN_MS);
            let result = queue.deliver_all().await;
            let elapsed_ms = span.finish();
            queue.finish_drain(generation);
            match &result {
                Ok(delivered) => info!(generation, delivered, elapsed_ms, "drain_complete"),
                Err(e) => warn!(generation, error = %e, "drain_failed"),
            }
            result
        });
        let running: DrainFuture = async move {
            handle
                .await
                .unwrap_or_else(|e| Err(BufferError::Transport(format!("drain task failed: {e}"))))
        }
        .boxed()
        .shared();

        *slot = Some((generation, running.clone()));
        (running, false)
    }

    fn finish_drain(&self, generation: u64) {
        let mut slot = self.in_flight.lock();
        if matches!(slot.as_ref(), Some((g, _)) if *g == generation) {
            *slot = None;
        }
    }

    /// Kick a drain without waiting for it.
    pub fn spawn_drain(self: &Arc<Self>) {
        let _ = self.start_drain();
    }

    /// Deliver the whole queue, waiting at most `timeout`.
    /// Returns the number of chunks delivered by the drain that was awaited.
    pub async fn drain(self: &Arc<Self>, timeout: Duration) -> Result<usize> {
        let work = async {
            loop {
                let (running, joined) = self.start_drain();
                let delivered = running.await?;
                // A joined drain may have passed its last queue check before our
                // chunks were enqueued.
                if !joined || self.depth() == 0 {
                    return Ok(delivered);
                }
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(timeout_ms, queue_depth = self.depth(), "drain timed out, delivery continues");
                Err(BufferError::DrainTimeout { timeout_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::transport::MemoryTransport;
    use tokio::time::Instant;

    fn setup(transport: Arc<MemoryTransport>) -> (Arc<Mutex<SampleStore>>, Arc<SubmissionQueue>) {
        let config = BufferConfig {
            chunk_length: 10,
            fill: false,
            ..BufferConfig::default()
        };
        let store = Arc::new(Mutex::new(SampleStore::make(&config, 100, 10.0).unwrap()));
        let queue = Arc::new(SubmissionQueue::new(
            Arc::clone(&store),
            transport,
            Arc::new(MetricsRegistry::new()),
        ));
        (store, queue)
    }

    fn write_and_enqueue(store: &Mutex<SampleStore>, mediatime: f64) -> usize {
        let mut s = store.lock();
        s.write(mediatime, &[1.0], Instant::now()).unwrap();
        let index = s.frame_of(mediatime).unwrap() / s.chunk_length();
        s.enqueue(index);
        index
    }

    #[tokio::test]
    async fn submit_one_on_empty_queue() {
        let (_, queue) = setup(Arc::new(MemoryTransport::new()));
        assert_eq!(queue.submit_one().await.unwrap(), None);
    }

    #[tokio::test]
    async fn drain_delivers_in_queue_order() {
        let transport = Arc::new(MemoryTransport::new());
        let (store, queue) = setup(Arc::clone(&transport));
        write_and_enqueue(&store, 0.5);
        write_and_enqueue(&store, 2.5);

        let delivered = queue.drain(Duration::from_secs(1)).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(transport.requests(), vec![0, 2]);
        assert_eq!(queue.depth(), 0);
        assert!(store.lock().chunks().iter().all(|c| !c.dirty && !c.in_queue));
    }

    #[tokio::test]
    async fn failed_chunk_stays_queued() {
        let transport = Arc::new(MemoryTransport::new());
        let (store, queue) = setup(Arc::clone(&transport));
        write_and_enqueue(&store, 0.5);
        transport.fail_next(1);

        let err = queue.drain(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BufferError::Delivery { chunk: 0, .. }));
        assert_eq!(queue.depth(), 1);
        assert!(store.lock().chunk(0).unwrap().in_queue);

        assert_eq!(queue.drain(Duration::from_secs(1)).await.unwrap(), 1);
        assert_eq!(transport.requests(), vec![0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_drains_share_one_delivery() {
        let transport = Arc::new(MemoryTransport::with_latency(Duration::from_millis(50)));
        let (store, queue) = setup(Arc::clone(&transport));
        write_and_enqueue(&store, 0.5);

        let (a, b) = tokio::join!(
            queue.drain(Duration::from_secs(5)),
            queue.drain(Duration::from_secs(5))
        );
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(transport.requests(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_abandons_wait_but_delivery_finishes() {
        let transport = Arc::new(MemoryTransport::with_latency(Duration::from_secs(3)));
        let (store, queue) = setup(Arc::clone(&transport));
        write_and_enqueue(&store, 0.5);

        let err = queue.drain(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, BufferError::DrainTimeout { timeout_ms: 1000 });
        assert!(queue.is_draining());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(transport.stored_count(), 1);
        assert_eq!(queue.depth(), 0);
        assert!(!queue.is_draining());
    }
}
