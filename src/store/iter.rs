//! Lazy, restartable read-only views over one column of the sample store.

use super::arena::{RecordLayout, SampleArena};

/// Column selector for iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    MediaTime,
    /// Only present when the buffer writes timestamps.
    Timestamp,
    /// Zero-based index into the payload.
    Payload(usize),
}

impl Field {
    /// Resolve to a record column, or `None` if the layout lacks it.
    pub fn column(self, layout: &RecordLayout) -> Option<usize> {
        match self {
            Field::MediaTime => Some(0),
            Field::Timestamp => layout.write_timestamp.then_some(1),
            Field::Payload(i) if i < layout.record_data_size => Some(layout.payload_offset() + i),
            Field::Payload(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// A frame range over one column. Calling [`FieldView::iter`] again restarts it.
#[derive(Clone, Copy)]
pub struct FieldView<'a> {
    arena: &'a SampleArena,
    column: usize,
    /// Inclusive bounds, `low <= high`; empty when `low > high`.
    low: usize,
    high: usize,
    step: usize,
    direction: Direction,
}

impl<'a> FieldView<'a> {
    pub(crate) fn new(
        arena: &'a SampleArena,
        column: usize,
        low: usize,
        high: usize,
        step: usize,
        direction: Direction,
    ) -> Self {
        Self {
            arena,
            column,
            low,
            high,
            step: step.max(1),
            direction,
        }
    }

    pub fn iter(&self) -> FieldIter<'a> {
        let next = match self.direction {
            Direction::Forward => Some(self.low),
            Direction::Reverse => Some(self.high),
        }
        .filter(|_| self.low <= self.high);
        FieldIter { view: *self, next }
    }
}

impl<'a> IntoIterator for &FieldView<'a> {
    type Item = (usize, f64);
    type IntoIter = FieldIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Yields `(frame, value)` for written frames only.
pub struct FieldIter<'a> {
    view: FieldView<'a>,
    next: Option<usize>,
}

impl<'a> FieldIter<'a> {
    fn advance(&mut self, frame: usize) {
        let v = &self.view;
        self.next = match v.direction {
            Direction::Forward => frame.checked_add(v.step).filter(|&f| f <= v.high),
            Direction::Reverse => frame.checked_sub(v.step).filter(|&f| f >= v.low),
        };
    }
}

impl<'a> Iterator for FieldIter<'a> {
    type Item = (usize, f64);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(frame) = self.next {
            self.advance(frame);
            if self.view.arena.presence_at(frame) != 0 {
                return Some((frame, self.view.arena.value(frame, self.view.column)));
            }
        }
        None
    }
}
