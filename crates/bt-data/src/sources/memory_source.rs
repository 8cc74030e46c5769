//! In-memory log source, used for tests and for synthesised timelines

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bt_core::{TimeRange, Timestamp};

use crate::index::{SourceIndex, SourceIndexBuilder};
use crate::sources::{Entry, EntryIter, LogSource, Position, TopicFilter};
use crate::DataError;

/// A log held entirely in memory; positions index the payload table
pub struct MemorySource {
    path: PathBuf,
    index: Arc<SourceIndex>,
    payloads: Vec<Vec<u8>>,
}

pub struct MemorySourceBuilder {
    path: PathBuf,
    index: SourceIndexBuilder,
    payloads: Vec<Vec<u8>>,
}

impl MemorySource {
    pub fn builder(name: impl Into<PathBuf>) -> MemorySourceBuilder {
        MemorySourceBuilder {
            path: name.into(),
            index: SourceIndexBuilder::new(),
            payloads: Vec::new(),
        }
    }
}

impl MemorySourceBuilder {
    /// Declare a topic with its datatype
    pub fn topic(mut self, name: &str, datatype: &str) -> Self {
        self.index.add_topic(name, Some(datatype));
        self
    }

    /// Append a message; undeclared topics are registered without a datatype
    pub fn message(mut self, topic: &str, stamp: impl Into<Timestamp>, payload: impl Into<Vec<u8>>) -> Self {
        let id = self.index.add_topic(topic, None);
        let position = Position(self.payloads.len() as u64);
        self.payloads.push(payload.into());
        self.index.push(id, stamp.into(), position);
        self
    }

    pub fn build(self) -> MemorySource {
        MemorySource {
            path: self.path,
            index: Arc::new(self.index.build()),
            payloads: self.payloads,
        }
    }
}

impl LogSource for MemorySource {
    fn path(&self) -> &Path {
        &self.path
    }

    fn topics(&self) -> Vec<String> {
        self.index.topics()
    }

    fn datatype(&self, topic: &str) -> Option<String> {
        self.index.datatype(topic).map(str::to_string)
    }

    fn time_range(&self) -> Option<TimeRange> {
        self.index.time_range()
    }

    fn message_count(&self) -> usize {
        self.index.len()
    }

    fn entries_in_range(&self, topics: TopicFilter, start: Timestamp, end: Option<Timestamp>) -> EntryIter {
        self.index.range(topics, start, end)
    }

    fn read_payload(&self, position: Position) -> Result<Vec<u8>, DataError> {
        self.payloads
            .get(position.0 as usize)
            .cloned()
            .ok_or_else(|| DataError::read(position, "no record at this position"))
    }

    fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<Entry> {
        self.index.entry_at(stamp, topic)
    }

    fn entry_after(&self, stamp: Timestamp) -> Option<Entry> {
        self.index.entry_after(stamp)
    }
}
