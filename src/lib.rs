//! framestream: chunked capture buffer for continuous timestamped sample streams.
//! Producers write one record per frame; dirty chunks are shipped in the
//! background through a binary wire codec without blocking the producer.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use buffer::CaptureBuffer;
pub use config::{BufferConfig, HttpTransportConfig};
pub use error::{BufferError, Result};
pub use scheduler::{ErrorCallback, TickReport};
pub use store::{Field, FrameRead, LogRecord, WriteOutcome};
pub use transport::{ChunkTransport, HttpTransport, MemoryTransport};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `framestream=info`).
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("framestream=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();
}
