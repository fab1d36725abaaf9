//! Producer / consumer facade.
//! `CaptureBuffer::Active` owns the store, submission queue and scheduler;
//! `CaptureBuffer::Disabled` accepts the same calls and records nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec;
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::queue::SubmissionQueue;
use crate::scheduler::{ErrorCallback, PersistScheduler, SchedulerHandle, TickReport};
use crate::store::{BufferStats, FrameRead, SampleStore, WriteOutcome};
use crate::transport::ChunkTransport;

pub enum CaptureBuffer {
    Active(ActiveBuffer),
    Disabled,
}

pub struct ActiveBuffer {
    instance: Uuid,
    store: Arc<Mutex<SampleStore>>,
    queue: Arc<SubmissionQueue>,
    scheduler: Arc<PersistScheduler>,
    timer: Mutex<Option<SchedulerHandle>>,
    transport: Arc<dyn ChunkTransport>,
    metrics: Arc<MetricsRegistry>,
}

impl CaptureBuffer {
    /// Allocate a buffer for `length` frames at `fps`. Returns `Disabled` when
    /// `config.enabled` is false. The scheduler is not running until `start`.
    pub fn make(
        config: BufferConfig,
        length: usize,
        fps: f64,
        transport: Arc<dyn ChunkTransport>,
        on_error: Option<ErrorCallback>,
    ) -> Result<Self> {
        if !config.enabled {
            info!("capture buffer disabled");
            return Ok(CaptureBuffer::Disabled);
        }

        let store = Arc::new(Mutex::new(SampleStore::make(&config, length, fps)?));
        let metrics = Arc::new(MetricsRegistry::new());
        let queue = Arc::new(SubmissionQueue::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(PersistScheduler::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&metrics),
            on_error,
        ));
        let instance = Uuid::new_v4();
        info!(%instance, length, fps, chunk_length = config.chunk_length, "capture buffer allocated");

        Ok(CaptureBuffer::Active(ActiveBuffer {
            instance,
            store,
            queue,
            scheduler,
            timer: Mutex::new(None),
            transport,
            metrics,
        }))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, CaptureBuffer::Active(_))
    }

    fn active(&self) -> Result<&ActiveBuffer> {
        match self {
            CaptureBuffer::Active(buf) => Ok(buf),
            CaptureBuffer::Disabled => Err(BufferError::Disabled),
        }
    }

    pub fn instance_id(&self) -> Option<Uuid> {
        self.active().ok().map(|b| b.instance)
    }

    /// Start the periodic persistence pass. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if let CaptureBuffer::Active(buf) = self {
            let mut timer = buf.timer.lock();
            if timer.is_none() {
                *timer = Some(buf.scheduler.spawn());
            }
        }
    }

    /// Stop the persistence scheduler. Queued chunks stay queued.
    pub fn destroy(&self) {
        if let CaptureBuffer::Active(buf) = self {
            if let Some(handle) = buf.timer.lock().take() {
                handle.stop();
                let delivery = buf.metrics.summary(metric_names::DELIVERY_MS);
                info!(
                    instance = %buf.instance,
                    delivered = delivery.as_ref().map_or(0, |d| d.count),
                    delivery_p95_ms = delivery.as_ref().map_or(0.0, |d| d.p95),
                    failed = buf.metrics.count(metric_names::DELIVERY_FAILED),
                    queue_depth = buf.queue.depth(),
                    "capture buffer destroyed"
                );
            }
        }
    }

    // --- producer API ---

    /// Record `payload` at `mediatime`.
    pub fn data(&self, mediatime: f64, payload: &[f64]) -> Result<WriteOutcome> {
        match self {
            CaptureBuffer::Active(buf) => buf.store.lock().write(mediatime, payload, Instant::now()),
            CaptureBuffer::Disabled => Ok(WriteOutcome::Discarded),
        }
    }

    /// Attach an irregular event at `mediatime`.
    pub fn log(&self, mediatime: f64, payload: serde_json::Value) -> Result<()> {
        match self {
            CaptureBuffer::Active(buf) => buf
                .store
                .lock()
                .log(mediatime, payload, Instant::now())
                .map(|_| ()),
            CaptureBuffer::Disabled => Ok(()),
        }
    }

    pub fn seek(&self, mediatime: f64) -> Result<()> {
        match self {
            CaptureBuffer::Active(buf) => buf.store.lock().seek(mediatime).map(|_| ()),
            CaptureBuffer::Disabled => Ok(()),
        }
    }

    /// Queue every dirty chunk and wait up to `timeout` for delivery.
    pub async fn flush(&self, timeout: Duration) -> Result<usize> {
        let buf = match self {
            CaptureBuffer::Active(buf) => buf,
            CaptureBuffer::Disabled => return Ok(0),
        };
        let report = buf.scheduler.force_enqueue();
        info!(instance = %buf.instance, enqueued = report.enqueued.len(), queue_depth = report.queue_depth, "flush");
        buf.queue.drain(timeout).await
    }

    /// Deliver what is already queued, waiting up to `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<usize> {
        match self {
            CaptureBuffer::Active(buf) => buf.queue.drain(timeout).await,
            CaptureBuffer::Disabled => Ok(0),
        }
    }

    /// Run one scheduler pass synchronously, without delivering.
    pub fn tick(&self) -> TickReport {
        match self {
            CaptureBuffer::Active(buf) => buf.scheduler.tick(Instant::now()),
            CaptureBuffer::Disabled => TickReport::default(),
        }
    }

    // --- consumer API ---

    /// Replace local content with the persisted bundle. Returns the chunk count.
    pub async fn load(&self) -> Result<usize> {
        let buf = match self {
            CaptureBuffer::Active(buf) => buf,
            CaptureBuffer::Disabled => return Ok(0),
        };
        let bytes = buf.transport.fetch_bundle().await?;
        let bundle = codec::unpack_chunk_bundle(&bytes).map_err(|e| {
            warn!(instance = %buf.instance, error = %e, "bundle decode failed");
            BufferError::Load(e.to_string())
        })?;
        let count = bundle.len();
        buf.store.lock().restore(bundle)?;
        info!(instance = %buf.instance, chunks = count, bytes = bytes.len(), "bundle loaded");
        Ok(count)
    }

    pub fn read(&self, mediatime: f64) -> Result<FrameRead> {
        self.active()?.store.lock().read(mediatime)
    }

    pub fn read_head(&self) -> Option<FrameRead> {
        self.active().ok()?.store.lock().read_head()
    }

    /// Lock the store for iteration. Writers block while the guard is held.
    pub fn read_store(&self) -> Result<MutexGuard<'_, SampleStore>> {
        Ok(self.active()?.store.lock())
    }

    pub fn stats(&self) -> Option<BufferStats> {
        self.active().ok().map(|b| b.store.lock().stats())
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.active().ok().map(|b| &b.metrics)
    }
}

impl Drop for ActiveBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Field;
    use crate::transport::MemoryTransport;

    fn buffer(config: BufferConfig) -> CaptureBuffer {
        CaptureBuffer::make(config, 1000, 100.0, Arc::new(MemoryTransport::new()), None).unwrap()
    }

    #[test]
    fn disabled_buffer_accepts_and_drops() {
        let buf = buffer(BufferConfig {
            enabled: false,
            ..BufferConfig::default()
        });
        assert!(!buf.is_active());
        assert_eq!(buf.data(1.0, &[1.0]).unwrap(), WriteOutcome::Discarded);
        assert!(buf.log(1.0, serde_json::json!(null)).is_ok());
        assert_eq!(buf.read(1.0).unwrap_err(), BufferError::Disabled);
        assert!(buf.read_head().is_none());
        assert!(buf.stats().is_none());
    }

    #[test]
    fn timestamp_column_is_stored() {
        let buf = buffer(BufferConfig {
            record_data_size: 2,
            write_timestamp: true,
            ..BufferConfig::default()
        });
        buf.data(1.0, &[0.0, 5.0]).unwrap();
        let record = buf.read(1.0).unwrap().record.unwrap();
        assert_eq!(record.len(), 4);
        assert_eq!(record[0], 1.0);
        assert!(record[1] > 0.0);
        assert_eq!(&record[2..], &[0.0, 5.0]);
    }

    #[test]
    fn store_guard_supports_lazy_iteration() {
        let buf = buffer(BufferConfig::default());
        buf.data(0.0, &[3.0]).unwrap();
        buf.data(0.03, &[4.0]).unwrap();
        let store = buf.read_store().unwrap();
        let view = store.forward_iterator(Field::Payload(0), 0, 10, 1).unwrap();
        let sum: f64 = view.iter().map(|(_, v)| v).sum();
        assert_eq!(sum, 3.0 + 4.0 * 3.0);
    }

    #[test]
    fn tick_reports_nothing_before_stabilization() {
        let buf = buffer(BufferConfig::default());
        buf.data(0.5, &[1.0]).unwrap();
        assert!(buf.tick().enqueued.is_empty());
        assert_eq!(buf.stats().unwrap().dirty_chunks, 1);
    }
}
