//! Sample store + chunk manager.
//! One arena holds every frame of the session; chunks are index ranges into it
//! carrying dirty/queued/last-write bookkeeping and the outbound queue order.

pub mod arena;
pub mod chunk;
pub mod iter;

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{self, UnpackedChunk};
use crate::config::BufferConfig;
use crate::error::{BufferError, Result};

pub use arena::{RecordLayout, SampleArena};
pub use chunk::{ChunkMeta, ChunkState, LogRecord};
pub use iter::{Direction, Field, FieldIter, FieldView};

/// Result of a `write` that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Frames `first..=last` now hold the record.
    Written { first: usize, last: usize },
    /// Fill-mode write behind `head`; nothing changed.
    Rejected { frame: usize, head: usize },
    /// The buffer is disabled and drops every write.
    Discarded,
}

/// A frame read back from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRead {
    pub frame: usize,
    /// `[mediatime, timestamp?, payload...]`, `None` if never written.
    pub record: Option<Vec<f64>>,
    pub logs: Vec<LogRecord>,
}

/// A chunk serialized for delivery, tagged with the write sequence it captured.
#[derive(Debug, Clone)]
pub struct PackedChunk {
    pub index: usize,
    pub chunk_length: usize,
    pub write_seq: u64,
    pub body: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub length: usize,
    pub num_chunks: usize,
    pub head: Option<usize>,
    pub global_counter: u32,
    pub dirty_chunks: usize,
    pub queued_chunks: usize,
}

pub struct SampleStore {
    layout: RecordLayout,
    fps: f64,
    length: usize,
    chunk_length: usize,
    fill: bool,
    arena: SampleArena,
    chunks: Vec<ChunkMeta>,
    outbound: VecDeque<usize>,
    head: Option<usize>,
    /// Last counter handed out; 0 means nothing written yet.
    global_counter: u32,
}

impl SampleStore {
    /// Allocate storage for `length` frames sampled at `fps`, split into
    /// `ceil(length / chunkLength)` chunks.
    pub fn make(config: &BufferConfig, length: usize, fps: f64) -> Result<Self> {
        config.validate()?;
        if length == 0 {
            return Err(BufferError::InvalidConfig("length must be > 0".into()));
        }
        if !(fps.is_finite() && fps > 0.0) {
            return Err(BufferError::InvalidConfig(format!("fps must be > 0, got {fps}")));
        }

        let layout = RecordLayout {
            record_data_size: config.record_data_size,
            write_timestamp: config.write_timestamp,
        };
        let chunk_length = config.chunk_length;
        let num_chunks = length.div_ceil(chunk_length);
        let arena = SampleArena::new(num_chunks * chunk_length, layout.record_size());
        let chunks = (0..num_chunks)
            .map(|i| ChunkMeta::new(i, i * chunk_length..(i + 1) * chunk_length))
            .collect();

        debug!(length, fps, chunk_length, num_chunks, record_size = layout.record_size(), "store_allocated");

        Ok(Self {
            layout,
            fps,
            length,
            chunk_length,
            fill: config.fill,
            arena,
            chunks,
            outbound: VecDeque::new(),
            head: None,
            global_counter: 0,
        })
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn global_counter(&self) -> u32 {
        self.global_counter
    }

    pub fn chunk(&self, index: usize) -> Option<&ChunkMeta> {
        self.chunks.get(index)
    }

    pub fn chunks(&self) -> &[ChunkMeta] {
        &self.chunks
    }

    /// `round(mediatime * fps)`, checked against the store length.
    pub fn frame_of(&self, mediatime: f64) -> Result<usize> {
        let frame = (mediatime * self.fps).round();
        if !frame.is_finite() || frame < 0.0 || frame >= self.length as f64 {
            return Err(BufferError::FrameOutOfRange {
                frame: if frame.is_finite() { frame as i64 } else { i64::MIN },
                length: self.length,
            });
        }
        Ok(frame as usize)
    }

    fn check_frame(&self, frame: usize) -> Result<()> {
        if frame >= self.length {
            return Err(BufferError::FrameOutOfRange {
                frame: frame as i64,
                length: self.length,
            });
        }
        Ok(())
    }

    #[inline]
    fn chunk_index(&self, frame: usize) -> usize {
        frame / self.chunk_length
    }

    fn next_counter(&mut self) -> u32 {
        self.global_counter += 1;
        self.global_counter
    }

    /// Write a record at `mediatime`. Validation happens before any mutation.
    pub fn write(&mut self, mediatime: f64, payload: &[f64], now: Instant) -> Result<WriteOutcome> {
        if payload.len() != self.layout.record_data_size {
            return Err(BufferError::RecordSizeMismatch {
                expected: self.layout.record_data_size,
                actual: payload.len(),
            });
        }
        let frame = self.frame_of(mediatime)?;

        let frames: RangeInclusive<usize> = if self.fill {
            match self.head {
                Some(head) if frame < head => {
                    warn!(frame, head, "non-sequential write ignored");
                    return Ok(WriteOutcome::Rejected { frame, head });
                }
                Some(head) if frame == head => frame..=frame,
                Some(head) => head + 1..=frame,
                None => 0..=frame,
            }
        } else {
            frame..=frame
        };

        let mut record = Vec::with_capacity(self.layout.record_size());
        record.push(mediatime);
        if self.layout.write_timestamp {
            record.push(chrono::Utc::now().timestamp_millis() as f64);
        }
        record.extend_from_slice(payload);

        let (first, last) = (*frames.start(), *frames.end());
        let mut touched: Option<usize> = None;
        for f in frames {
            let counter = self.next_counter();
            self.arena.put(f, counter, &record);
            let ci = self.chunk_index(f);
            if touched != Some(ci) {
                self.chunks[ci].touch(now);
                touched = Some(ci);
            }
        }

        self.head = Some(match self.head {
            Some(head) if !self.fill => head.max(last),
            _ => last,
        });
        Ok(WriteOutcome::Written { first, last })
    }

    /// Attach an irregular event to the chunk covering `mediatime`.
    pub fn log(&mut self, mediatime: f64, payload: serde_json::Value, now: Instant) -> Result<u32> {
        let frame = self.frame_of(mediatime)?;
        let counter = self.next_counter();
        let ci = self.chunk_index(frame);
        let chunk = &mut self.chunks[ci];
        chunk.logs.push(LogRecord(counter, mediatime, payload));
        chunk.touch(now);
        Ok(counter)
    }

    pub fn read_frame(&self, frame: usize) -> Result<FrameRead> {
        self.check_frame(frame)?;
        let chunk = &self.chunks[self.chunk_index(frame)];
        Ok(FrameRead {
            frame,
            record: self.arena.get(frame).map(<[f64]>::to_vec),
            logs: chunk.logs_at(frame, self.fps),
        })
    }

    pub fn read(&self, mediatime: f64) -> Result<FrameRead> {
        self.read_frame(self.frame_of(mediatime)?)
    }

    /// `None` until something has been written or seeked to.
    pub fn read_head(&self) -> Option<FrameRead> {
        self.head.and_then(|h| self.read_frame(h).ok())
    }

    /// Move `head` without writing. Replay cueing only.
    pub fn seek(&mut self, mediatime: f64) -> Result<usize> {
        let frame = self.frame_of(mediatime)?;
        self.head = Some(frame);
        Ok(frame)
    }

    /// Forward view over `field` for frames `from..=to`.
    pub fn forward_iterator(&self, field: Field, from: usize, to: usize, step: usize) -> Result<FieldView<'_>> {
        self.field_view(field, from, to, step, Direction::Forward)
    }

    /// Reverse view over `field`, visiting `from` down to `to`.
    pub fn reverse_iterator(&self, from: usize, to: usize, field: Field, step: usize) -> Result<FieldView<'_>> {
        self.field_view(field, to, from, step, Direction::Reverse)
    }

    fn field_view(&self, field: Field, low: usize, high: usize, step: usize, direction: Direction) -> Result<FieldView<'_>> {
        let column = field.column(&self.layout).ok_or_else(|| {
            BufferError::InvalidConfig(format!("field {field:?} not present in record layout"))
        })?;
        let high = high.min(self.length - 1);
        Ok(FieldView::new(&self.arena, column, low, high, step, direction))
    }

    // --- chunk manager ---

    /// Indexes of chunks that are dirty, not queued and untouched for `threshold`.
    pub fn stable_chunks(&self, now: Instant, threshold: std::time::Duration) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.is_stable(now, threshold))
            .map(|c| c.index)
            .collect()
    }

    /// Dirty chunks not yet queued, regardless of how recently they were written.
    pub fn dirty_unqueued(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.dirty && !c.in_queue)
            .map(|c| c.index)
            .collect()
    }

    pub fn enqueue(&mut self, index: usize) {
        let chunk = &mut self.chunks[index];
        if chunk.in_queue {
            return;
        }
        debug_assert!(chunk.state().can_transition_to(ChunkState::Queued));
        chunk.in_queue = true;
        self.outbound.push_back(index);
    }

    pub fn queue_depth(&self) -> usize {
        self.outbound.len()
    }

    pub fn queue_front(&self) -> Option<usize> {
        self.outbound.front().copied()
    }

    /// Serialize a chunk with the wire codec.
    pub fn pack(&self, index: usize) -> Result<PackedChunk> {
        let chunk = self
            .chunks
            .get(index)
            .ok_or_else(|| BufferError::Codec(format!("no chunk {index}")))?;
        let body = codec::pack_chunk(
            self.arena.sample_slice(chunk.frames.clone()),
            self.arena.presence_slice(chunk.frames.clone()),
            &chunk.logs,
            self.chunk_length,
            self.layout.record_size(),
        )?;
        Ok(PackedChunk {
            index,
            chunk_length: self.chunk_length,
            write_seq: chunk.write_seq,
            body,
        })
    }

    /// Drop a delivered chunk from the queue. It stays dirty if it was rewritten
    /// after `packed` was taken.
    pub fn complete_delivery(&mut self, packed: &PackedChunk) {
        if let Some(pos) = self.outbound.iter().position(|&i| i == packed.index) {
            self.outbound.remove(pos);
        }
        let chunk = &mut self.chunks[packed.index];
        let before = chunk.state();
        chunk.in_queue = false;
        chunk.dirty = chunk.write_seq != packed.write_seq;
        debug_assert!(before.can_transition_to(chunk.state()));
    }

    /// Replace store content with a loaded bundle. Chunks past the bundle are cleared.
    pub fn restore(&mut self, bundle: Vec<UnpackedChunk>) -> Result<()> {
        if bundle.len() > self.chunks.len() {
            return Err(BufferError::Load(format!(
                "bundle has {} chunks, buffer holds {}",
                bundle.len(),
                self.chunks.len()
            )));
        }
        let record_size = self.layout.record_size();
        if let Some(bad) = bundle
            .iter()
            .position(|c| c.chunk_length != self.chunk_length || c.record_size != record_size)
        {
            return Err(BufferError::Load(format!(
                "chunk {bad} is {}x{}, buffer is {}x{}",
                bundle[bad].chunk_length, bundle[bad].record_size, self.chunk_length, record_size
            )));
        }

        self.arena.reset();
        self.outbound.clear();
        let mut max_counter = 0u32;
        for chunk in &mut self.chunks {
            chunk.logs.clear();
            chunk.dirty = false;
            chunk.in_queue = false;
            chunk.last_write_time = None;
        }
        for (i, loaded) in bundle.into_iter().enumerate() {
            let frames = self.chunks[i].frames.clone();
            self.arena.restore(frames, &loaded.presence, &loaded.samples);
            max_counter = loaded
                .logs
                .iter()
                .map(LogRecord::counter)
                .fold(max_counter, u32::max);
            self.chunks[i].logs = loaded.logs;
        }

        let newest = self.arena.newest();
        self.head = newest.map(|(frame, _)| frame);
        self.global_counter = newest.map_or(0, |(_, c)| c).max(max_counter);
        Ok(())
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            length: self.length,
            num_chunks: self.chunks.len(),
            head: self.head,
            global_counter: self.global_counter,
            dirty_chunks: self.chunks.iter().filter(|c| c.dirty).count(),
            queued_chunks: self.outbound.len(),
        }
    }
}
