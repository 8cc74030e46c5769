//! In-memory time index shared by the file-backed sources

use std::sync::Arc;

use ahash::AHashMap;
use bt_core::{TimeRange, Timestamp};
use rayon::prelude::*;
use tracing::warn;

use crate::sources::{Entry, EntryIter, Position, TopicFilter};

#[derive(Debug, Clone, Copy)]
struct IndexRecord {
    stamp: Timestamp,
    topic: u32,
    position: Position,
}

/// Sorted index of every record in one source.
///
/// Records are kept in timestamp order; records with equal timestamps keep
/// the order they were pushed in.
#[derive(Debug, Default)]
pub struct SourceIndex {
    topics: Vec<Arc<str>>,
    datatypes: Vec<Option<String>>,
    topic_ids: AHashMap<String, u32>,
    /// All records, ordered by timestamp
    records: Vec<IndexRecord>,
    /// Per topic, offsets into `records`
    by_topic: Vec<Vec<usize>>,
}

/// Accumulates records before sorting them into a [`SourceIndex`]
#[derive(Debug, Default)]
pub struct SourceIndexBuilder {
    topics: Vec<Arc<str>>,
    datatypes: Vec<Option<String>>,
    topic_ids: AHashMap<String, u32>,
    records: Vec<IndexRecord>,
}

impl SourceIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a topic, returning its id. A topic keeps the first datatype
    /// it was registered with.
    pub fn add_topic(&mut self, name: &str, datatype: Option<&str>) -> u32 {
        if let Some(&id) = self.topic_ids.get(name) {
            match (self.datatypes[id as usize].clone(), datatype) {
                (None, Some(datatype)) => self.datatypes[id as usize] = Some(datatype.to_string()),
                (Some(known), Some(datatype)) if known != datatype => {
                    warn!(topic = name, %known, ignored = datatype, "topic datatype changes within a source");
                }
                _ => {}
            }
            return id;
        }

        let id = self.topics.len() as u32;
        self.topics.push(Arc::from(name));
        self.datatypes.push(datatype.map(str::to_string));
        self.topic_ids.insert(name.to_string(), id);
        id
    }

    pub fn push(&mut self, topic: u32, stamp: Timestamp, position: Position) {
        self.records.push(IndexRecord { stamp, topic, position });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build(self) -> SourceIndex {
        let mut records = self.records;
        // Stable sort, equal stamps stay in insertion order
        records.par_sort_by_key(|record| record.stamp);

        let mut by_topic = vec![Vec::new(); self.topics.len()];
        for (offset, record) in records.iter().enumerate() {
            by_topic[record.topic as usize].push(offset);
        }

        SourceIndex {
            topics: self.topics,
            datatypes: self.datatypes,
            topic_ids: self.topic_ids,
            records,
            by_topic,
        }
    }
}

impl SourceIndex {
    /// Sorted topic names
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|topic| topic.to_string()).collect();
        topics.sort();
        topics
    }

    pub fn datatype(&self, topic: &str) -> Option<&str> {
        let id = *self.topic_ids.get(topic)?;
        self.datatypes[id as usize].as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        let first = self.records.first()?;
        let last = self.records.last()?;
        Some(TimeRange::new(first.stamp, last.stamp))
    }

    fn entry(&self, record: &IndexRecord) -> Entry {
        Entry {
            topic: self.topics[record.topic as usize].clone(),
            stamp: record.stamp,
            position: record.position,
        }
    }

    /// Latest record on `topic` with `stamp <= at`; the last pushed wins ties
    pub fn entry_at(&self, at: Timestamp, topic: &str) -> Option<Entry> {
        let id = *self.topic_ids.get(topic)?;
        let offsets = &self.by_topic[id as usize];
        let idx = offsets.partition_point(|&offset| self.records[offset].stamp <= at);
        if idx > 0 {
            Some(self.entry(&self.records[offsets[idx - 1]]))
        } else {
            None
        }
    }

    /// First record on any topic with `stamp > after`
    pub fn entry_after(&self, after: Timestamp) -> Option<Entry> {
        let idx = self.records.partition_point(|record| record.stamp <= after);
        self.records.get(idx).map(|record| self.entry(record))
    }

    /// Owned iterator over `[start, end]`, suitable for boxing as [`EntryIter`]
    pub fn range(self: &Arc<Self>, topics: TopicFilter, start: Timestamp, end: Option<Timestamp>) -> EntryIter {
        let lo = self.records.partition_point(|record| record.stamp < start);
        let hi = match end {
            Some(end) => self.records.partition_point(|record| record.stamp <= end),
            None => self.records.len(),
        };

        Box::new(IndexRange {
            index: Arc::clone(self),
            topics,
            next: lo,
            end: hi.max(lo),
        })
    }
}

struct IndexRange {
    index: Arc<SourceIndex>,
    topics: TopicFilter,
    next: usize,
    end: usize,
}

impl Iterator for IndexRange {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while self.next < self.end {
            let record = &self.index.records[self.next];
            self.next += 1;
            let topic = &self.index.topics[record.topic as usize];
            if self.topics.matches(topic) {
                return Some(self.index.entry(record));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Arc<SourceIndex> {
        let mut builder = SourceIndexBuilder::new();
        let a = builder.add_topic("/a", Some("std/String"));
        let b = builder.add_topic("/b", None);
        builder.push(a, Timestamp::from_nanos(30), Position(0));
        builder.push(b, Timestamp::from_nanos(10), Position(1));
        builder.push(a, Timestamp::from_nanos(10), Position(2));
        builder.push(b, Timestamp::from_nanos(20), Position(3));
        Arc::new(builder.build())
    }

    fn positions(iter: EntryIter) -> Vec<u64> {
        iter.map(|entry| entry.position.0).collect()
    }

    #[test]
    fn test_records_sorted_stably() {
        let index = sample();
        assert_eq!(positions(index.range(TopicFilter::All, Timestamp::MIN, None)), vec![1, 2, 3, 0]);
        assert_eq!(
            index.time_range(),
            Some(TimeRange::new(Timestamp::from_nanos(10), Timestamp::from_nanos(30)))
        );
        assert_eq!(index.topics(), vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(index.datatype("/a"), Some("std/String"));
        assert_eq!(index.datatype("/b"), None);
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let index = sample();
        let range = index.range(TopicFilter::All, Timestamp::from_nanos(10), Some(Timestamp::from_nanos(20)));
        assert_eq!(positions(range), vec![1, 2, 3]);

        let only_a = index.range(TopicFilter::only(["/a"]), Timestamp::from_nanos(11), None);
        assert_eq!(positions(only_a), vec![0]);

        let empty = index.range(TopicFilter::All, Timestamp::from_nanos(21), Some(Timestamp::from_nanos(29)));
        assert!(positions(empty).is_empty());
    }

    #[test]
    fn test_entry_at_and_after() {
        let index = sample();
        assert_eq!(index.entry_at(Timestamp::from_nanos(9), "/a"), None);
        assert_eq!(index.entry_at(Timestamp::from_nanos(29), "/a").unwrap().position, Position(2));
        assert_eq!(index.entry_at(Timestamp::from_nanos(30), "/a").unwrap().position, Position(0));
        assert_eq!(index.entry_at(Timestamp::from_nanos(30), "/missing"), None);

        assert_eq!(index.entry_after(Timestamp::from_nanos(10)).unwrap().position, Position(3));
        assert_eq!(index.entry_after(Timestamp::from_nanos(0)).unwrap().position, Position(1));
        assert_eq!(index.entry_after(Timestamp::from_nanos(30)), None);
    }
}
