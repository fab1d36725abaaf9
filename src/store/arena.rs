//! Sample arena: one pre-allocated flat allocation for every record of a session
//! plus the parallel presence column. Never grows after construction.

use std::ops::Range;

/// Column layout of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub record_data_size: usize,
    pub write_timestamp: bool,
}

impl RecordLayout {
    /// Values per record: mediatime, optional timestamp, payload.
    #[inline]
    pub fn record_size(&self) -> usize {
        1 + usize::from(self.write_timestamp) + self.record_data_size
    }

    /// Column of the first payload value.
    #[inline]
    pub fn payload_offset(&self) -> usize {
        1 + usize::from(self.write_timestamp)
    }
}

/// Flat storage for `frames` records. Presence value 0 marks an empty slot.
pub struct SampleArena {
    samples: Box<[f64]>,
    presence: Box<[u32]>,
    record_size: usize,
}

impl SampleArena {
    pub fn new(frames: usize, record_size: usize) -> Self {
        Self {
            samples: vec![0.0f64; frames * record_size].into_boxed_slice(),
            presence: vec![0u32; frames].into_boxed_slice(),
            record_size,
        }
    }

    /// Store `values` at `frame` and stamp the slot with `counter`.
    /// `values.len()` must equal the record size.
    #[inline]
    pub fn put(&mut self, frame: usize, counter: u32, values: &[f64]) {
        let start = frame * self.record_size;
        self.samples[start..start + self.record_size].copy_from_slice(values);
        self.presence[frame] = counter;
    }

    /// Record at `frame`, or `None` if the slot was never written.
    #[inline]
    pub fn get(&self, frame: usize) -> Option<&[f64]> {
        if self.presence[frame] == 0 {
            return None;
        }
        let start = frame * self.record_size;
        Some(&self.samples[start..start + self.record_size])
    }

    #[inline]
    pub fn presence_at(&self, frame: usize) -> u32 {
        self.presence[frame]
    }

    /// Single column value at `frame`, ignoring presence.
    #[inline]
    pub fn value(&self, frame: usize, column: usize) -> f64 {
        self.samples[frame * self.record_size + column]
    }

    /// Presence view over a frame range. No copy.
    pub fn presence_slice(&self, frames: Range<usize>) -> &[u32] {
        &self.presence[frames]
    }

    /// Sample view over a frame range. No copy.
    pub fn sample_slice(&self, frames: Range<usize>) -> &[f64] {
        &self.samples[frames.start * self.record_size..frames.end * self.record_size]
    }

    /// Overwrite a frame range with externally supplied columns (bundle load).
    pub fn restore(&mut self, frames: Range<usize>, presence: &[u32], samples: &[f64]) {
        let sample_range = frames.start * self.record_size..frames.end * self.record_size;
        self.presence[frames].copy_from_slice(presence);
        self.samples[sample_range].copy_from_slice(samples);
    }

    /// Largest presence counter currently stored and the frame holding it.
    pub fn newest(&self) -> Option<(usize, u32)> {
        self.presence
            .iter()
            .enumerate()
            .filter(|(_, &c)| c != 0)
            .max_by_key(|(_, &c)| c)
            .map(|(frame, &c)| (frame, c))
    }

    /// Clear every slot.
    pub fn reset(&mut self) {
        self.samples.fill(0.0);
        self.presence.fill(0);
    }
}
