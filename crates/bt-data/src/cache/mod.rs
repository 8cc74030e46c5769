//! Per-topic message buffer owned by a topic loader

use bt_core::{TimeRange, Timestamp};

use crate::sources::LoadedMessage;

/// Messages loaded around the playhead for one topic.
///
/// `window` is the span over which [`TopicBuffer::latest_at`] is exact: for
/// any stamp inside it the buffer holds the latest message at or before
/// that stamp, when one exists.
pub struct TopicBuffer {
    capacity: usize,
    generation: u64,
    window: Option<TimeRange>,
    /// Sorted by stamp
    messages: Vec<LoadedMessage>,
}

impl TopicBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            generation: 0,
            window: None,
            messages: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drop everything and tag the buffer with a new generation
    pub fn reset(&mut self, generation: u64) {
        self.generation = generation;
        self.window = None;
        self.messages.clear();
    }

    pub fn covers(&self, stamp: Timestamp) -> bool {
        self.window.is_some_and(|window| window.contains(stamp))
    }

    pub fn window(&self) -> Option<TimeRange> {
        self.window
    }

    /// Replace the contents with a freshly loaded window
    pub fn fill(&mut self, window: TimeRange, mut messages: Vec<LoadedMessage>) {
        messages.truncate(self.capacity);
        self.window = Some(window);
        self.messages = messages;
    }

    /// Latest buffered message with `stamp <= at`
    pub fn latest_at(&self, at: Timestamp) -> Option<&LoadedMessage> {
        let idx = self.messages.partition_point(|message| message.stamp <= at);
        idx.checked_sub(1).map(|idx| &self.messages[idx])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
