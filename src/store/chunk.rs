//! Chunk bookkeeping: Clean → Dirty → Queued → (delivered → Clean | failed → Dirty).
//! Chunks are index/offset records into the shared arena, never owners of samples.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Irregular event attached to the chunk whose time range contains it.
/// Serializes as `[counter, mediatime, payload]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord(pub u32, pub f64, pub serde_json::Value);

impl LogRecord {
    pub fn counter(&self) -> u32 {
        self.0
    }

    pub fn mediatime(&self) -> f64 {
        self.1
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.2
    }
}

/// Delivery state of a chunk, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChunkState {
    Clean,
    Dirty,
    Queued,
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkState::Clean => write!(f, "Clean"),
            ChunkState::Dirty => write!(f, "Dirty"),
            ChunkState::Queued => write!(f, "Queued"),
        }
    }
}

impl ChunkState {
    /// Returns whether moving from `self` to `next` is a valid lifecycle step.
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        matches!(
            (self, next),
            (ChunkState::Clean, ChunkState::Dirty)
                | (ChunkState::Dirty, ChunkState::Dirty) // rewritten
                | (ChunkState::Dirty, ChunkState::Queued)
                | (ChunkState::Queued, ChunkState::Queued) // rewritten or failed, stays queued
                | (ChunkState::Queued, ChunkState::Clean) // delivered
                | (ChunkState::Queued, ChunkState::Dirty) // delivered but rewritten in flight
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChunkMeta {
    pub index: usize,
    /// Frames covered by this chunk. Every chunk spans `chunk_length` frames;
    /// frames past the buffer length in the last chunk are never written.
    pub frames: Range<usize>,
    pub logs: Vec<LogRecord>,
    pub dirty: bool,
    pub in_queue: bool,
    pub last_write_time: Option<Instant>,
    /// Bumped on every mutation; compared against the value captured at pack time.
    pub write_seq: u64,
}

impl ChunkMeta {
    pub fn new(index: usize, frames: Range<usize>) -> Self {
        Self {
            index,
            frames,
            logs: Vec::new(),
            dirty: false,
            in_queue: false,
            last_write_time: None,
            write_seq: 0,
        }
    }

    pub fn state(&self) -> ChunkState {
        if self.in_queue {
            ChunkState::Queued
        } else if self.dirty {
            ChunkState::Dirty
        } else {
            ChunkState::Clean
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.dirty = true;
        self.last_write_time = Some(now);
        self.write_seq += 1;
    }

    /// Dirty, not queued, and untouched for at least `threshold`.
    pub fn is_stable(&self, now: Instant, threshold: std::time::Duration) -> bool {
        if !self.dirty || self.in_queue {
            return false;
        }
        match self.last_write_time {
            Some(t) => now.saturating_duration_since(t) >= threshold,
            None => true,
        }
    }

    /// Logs whose mediatime maps to `frame`.
    pub fn logs_at(&self, frame: usize, fps: f64) -> Vec<LogRecord> {
        self.logs
            .iter()
            .filter(|l| (l.mediatime() * fps).round() as i64 == frame as i64)
            .cloned()
            .collect()
    }
}
