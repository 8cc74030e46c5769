//! Timeline catalog: the set of open sources and their aggregate view

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bt_core::{MessageTimeline, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::merge::MergeIterator;
use crate::sources::{LoadedMessage, LogSource, Position, SourceId, SourcedEntry, TopicFilter};
use crate::DataError;

/// A topic recorded with different datatypes by different sources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatatypeConflict {
    pub topic: String,
    pub datatypes: Vec<String>,
}

/// What changed when a source joined the catalog
#[derive(Debug, Clone)]
pub struct CatalogUpdate {
    pub id: SourceId,
    pub name: String,
    /// Whether this was the first source
    pub first: bool,
    pub topics: Vec<String>,
    pub message_count: usize,
    /// Catalog bounds after the addition
    pub bounds: Option<TimeRange>,
    /// Conflicts introduced by this source
    pub conflicts: Vec<DatatypeConflict>,
}

#[derive(Default)]
struct CatalogState {
    /// Registration order; a source's index is its [`SourceId`]
    sources: Vec<Arc<dyn LogSource>>,
    bounds: Option<TimeRange>,
    topics: BTreeSet<String>,
    /// Every datatype each topic was seen with
    datatypes: BTreeMap<String, BTreeSet<String>>,
}

/// The ordered set of open log sources.
///
/// Sources are only ever added. Queries take a snapshot of the source list
/// under the read lock and do their work after releasing it, so a long
/// iteration never blocks [`Catalog::add_source`].
#[derive(Default)]
pub struct Catalog {
    state: RwLock<CatalogState>,
    /// Topics whose derived caches must be rebuilt
    invalidated: Mutex<BTreeSet<String>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source; bounds only ever widen
    pub fn add_source(&self, source: Arc<dyn LogSource>) -> CatalogUpdate {
        // Query the source before taking the write lock
        let name = source.name();
        let topics = source.topics();
        let datatypes: Vec<Option<String>> = topics.iter().map(|topic| source.datatype(topic)).collect();
        let range = source.time_range();
        let message_count = source.message_count();

        let mut conflicts = Vec::new();
        let (id, first, bounds) = {
            let mut state = self.state.write();
            let id = SourceId(state.sources.len());
            let first = state.sources.is_empty();

            state.bounds = match (state.bounds, range) {
                (Some(current), Some(range)) => Some(current.union(&range)),
                (current, range) => current.or(range),
            };

            for (topic, datatype) in topics.iter().zip(datatypes) {
                state.topics.insert(topic.clone());
                let Some(datatype) = datatype else { continue };
                let seen = state.datatypes.entry(topic.clone()).or_default();
                if seen.insert(datatype) && seen.len() > 1 {
                    conflicts.push(DatatypeConflict {
                        topic: topic.clone(),
                        datatypes: seen.iter().cloned().collect(),
                    });
                }
            }

            state.sources.push(source);
            (id, first, state.bounds)
        };

        self.invalidated.lock().extend(topics.iter().cloned());

        for conflict in &conflicts {
            warn!(topic = %conflict.topic, datatypes = ?conflict.datatypes, "topic has conflicting datatypes across sources");
        }
        info!(source = %name, %id, messages = message_count, topics = topics.len(), "source added to catalog");

        CatalogUpdate {
            id,
            name,
            first,
            topics,
            message_count,
            bounds,
            conflicts,
        }
    }

    pub fn source_count(&self) -> usize {
        self.state.read().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().sources.is_empty()
    }

    pub fn source(&self, id: SourceId) -> Option<Arc<dyn LogSource>> {
        self.state.read().sources.get(id.0).cloned()
    }

    /// Snapshot of the sources in registration order
    pub fn sources(&self) -> Vec<Arc<dyn LogSource>> {
        self.state.read().sources.clone()
    }

    /// Union of all topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        self.state.read().topics.iter().cloned().collect()
    }

    /// The datatype every source agrees on for `topic`.
    ///
    /// Returns `Ok(None)` for unknown topics and topics without a datatype.
    pub fn datatype(&self, topic: &str) -> Result<Option<String>, DataError> {
        let state = self.state.read();
        let Some(seen) = state.datatypes.get(topic) else {
            return Ok(None);
        };
        if seen.len() > 1 {
            return Err(DataError::DatatypeConflict {
                topic: topic.to_string(),
                datatypes: seen.iter().cloned().collect(),
            });
        }
        Ok(seen.iter().next().cloned())
    }

    /// Topics grouped by datatype across every source
    pub fn topics_by_datatype(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for source in self.sources() {
            for (datatype, topics) in source.topics_by_datatype() {
                grouped.entry(datatype).or_default().extend(topics);
            }
        }
        grouped
            .into_iter()
            .map(|(datatype, topics)| (datatype, topics.into_iter().collect()))
            .collect()
    }

    pub fn bounds(&self) -> Option<TimeRange> {
        self.state.read().bounds
    }

    pub fn start_stamp(&self) -> Option<Timestamp> {
        self.bounds().map(|bounds| bounds.start)
    }

    pub fn end_stamp(&self) -> Option<Timestamp> {
        self.bounds().map(|bounds| bounds.end)
    }

    pub fn message_count(&self) -> usize {
        self.sources().iter().map(|source| source.message_count()).sum()
    }

    /// Drain the set of topics invalidated by source additions
    pub fn take_invalidated(&self) -> Vec<String> {
        std::mem::take(&mut *self.invalidated.lock()).into_iter().collect()
    }

    /// Entries in `[start, end]` across all sources, merged by timestamp
    pub fn entries(&self, topics: TopicFilter, start: Timestamp, end: Option<Timestamp>) -> MergeIterator {
        let streams = self
            .sources()
            .into_iter()
            .enumerate()
            .filter(|(_, source)| {
                source
                    .time_range()
                    .is_some_and(|range| range.intersects(start, end))
            })
            .map(|(idx, source)| (SourceId(idx), source.entries_in_range(topics.clone(), start, end)))
            .collect();
        MergeIterator::new(streams)
    }

    /// Latest entry on `topic` at or before `stamp`; later sources win ties
    pub fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<SourcedEntry> {
        let mut best: Option<SourcedEntry> = None;
        for (idx, source) in self.sources().iter().enumerate() {
            let Some(entry) = source.entry_at(stamp, topic) else { continue };
            if best.as_ref().map_or(true, |best| entry.stamp >= best.entry.stamp) {
                best = Some(SourcedEntry { source: SourceId(idx), entry });
            }
        }
        best
    }

    /// Earliest entry strictly after `stamp`; earlier sources win ties
    pub fn entry_after(&self, stamp: Timestamp) -> Option<SourcedEntry> {
        let mut best: Option<SourcedEntry> = None;
        for (idx, source) in self.sources().iter().enumerate() {
            let Some(entry) = source.entry_after(stamp) else { continue };
            if best.as_ref().map_or(true, |best| entry.stamp < best.entry.stamp) {
                best = Some(SourcedEntry { source: SourceId(idx), entry });
            }
        }
        best
    }

    pub fn read_payload(&self, source: SourceId, position: Position) -> Result<Vec<u8>, DataError> {
        self.source(source)
            .ok_or(DataError::UnknownSource(source))?
            .read_payload(position)
    }

    /// Read the payload behind an entry
    pub fn read_message(&self, item: &SourcedEntry) -> Result<LoadedMessage, DataError> {
        let source = self.source(item.source).ok_or(DataError::UnknownSource(item.source))?;
        let payload = source.read_payload(item.entry.position)?;
        Ok(LoadedMessage {
            source: item.source,
            topic: item.entry.topic.clone(),
            datatype: source.datatype(&item.entry.topic),
            stamp: item.entry.stamp,
            position: item.entry.position,
            payload: payload.into(),
        })
    }
}

impl MessageTimeline for Catalog {
    fn bounds(&self) -> Option<TimeRange> {
        Catalog::bounds(self)
    }

    fn message_time_after(&self, stamp: Timestamp) -> Option<Timestamp> {
        self.entry_after(stamp).map(|item| item.stamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemorySource;

    fn secs(value: i64) -> Timestamp {
        Timestamp::from_nanos(value * 1_000_000_000)
    }

    fn source(name: &str, messages: &[(&str, i64)]) -> Arc<dyn LogSource> {
        let mut builder = MemorySource::builder(name);
        for (idx, (topic, stamp)) in messages.iter().enumerate() {
            builder = builder.message(topic, secs(*stamp), format!("{}-{}", name, idx));
        }
        Arc::new(builder.build())
    }

    #[test]
    fn test_bounds_widen_as_sources_arrive() {
        let catalog = Catalog::new();
        assert_eq!(catalog.bounds(), None);

        let update = catalog.add_source(source("a", &[("/x", 5), ("/x", 10)]));
        assert!(update.first);
        assert_eq!(update.id, SourceId(0));
        assert_eq!(catalog.start_stamp(), Some(secs(5)));

        let update = catalog.add_source(source("b", &[("/y", 2), ("/y", 7)]));
        assert!(!update.first);
        assert_eq!(catalog.start_stamp(), Some(secs(2)));
        assert_eq!(catalog.end_stamp(), Some(secs(10)));
        assert_eq!(catalog.topics(), vec!["/x".to_string(), "/y".to_string()]);
        assert_eq!(catalog.message_count(), 4);

        // Empty sources leave the bounds alone
        catalog.add_source(source("empty", &[]));
        assert_eq!(catalog.bounds(), Some(TimeRange::new(secs(2), secs(10))));
    }

    #[test]
    fn test_entries_merge_across_sources_with_filter() {
        let catalog = Catalog::new();
        catalog.add_source(source("a", &[("/x", 1), ("/y", 3), ("/x", 5)]));
        catalog.add_source(source("b", &[("/x", 2), ("/x", 3), ("/y", 4)]));

        let all: Vec<(i64, usize)> = catalog
            .entries(TopicFilter::All, Timestamp::MIN, None)
            .map(|item| (item.stamp().as_nanos() / 1_000_000_000, item.source.0))
            .collect();
        assert_eq!(all, vec![(1, 0), (2, 1), (3, 0), (3, 1), (4, 1), (5, 0)]);

        let only_x: Vec<i64> = catalog
            .entries(TopicFilter::only(["/x"]), secs(2), Some(secs(4)))
            .map(|item| item.stamp().as_nanos() / 1_000_000_000)
            .collect();
        assert_eq!(only_x, vec![2, 3]);
    }

    #[test]
    fn test_entry_lookup_tie_breaks() {
        let catalog = Catalog::new();
        catalog.add_source(source("a", &[("/x", 3), ("/x", 6)]));
        catalog.add_source(source("b", &[("/x", 3), ("/x", 6)]));

        let at = catalog.entry_at(secs(4), "/x").unwrap();
        assert_eq!((at.stamp(), at.source), (secs(3), SourceId(1)));
        assert!(catalog.entry_at(secs(2), "/x").is_none());

        let after = catalog.entry_after(secs(3)).unwrap();
        assert_eq!((after.stamp(), after.source), (secs(6), SourceId(0)));
        assert!(catalog.entry_after(secs(6)).is_none());

        assert_eq!(catalog.message_time_after(secs(0)), Some(secs(3)));
    }

    #[test]
    fn test_datatype_conflict_is_reported() {
        let catalog = Catalog::new();
        let a = MemorySource::builder("a").topic("/pose", "geo/Pose").message("/pose", 1i64, "p").build();
        let b = MemorySource::builder("b").topic("/pose", "geo/Pose2").message("/pose", 2i64, "q").build();

        assert!(catalog.add_source(Arc::new(a)).conflicts.is_empty());
        assert_eq!(catalog.datatype("/pose").unwrap().as_deref(), Some("geo/Pose"));

        let update = catalog.add_source(Arc::new(b));
        assert_eq!(
            update.conflicts,
            vec![DatatypeConflict {
                topic: "/pose".to_string(),
                datatypes: vec!["geo/Pose".to_string(), "geo/Pose2".to_string()],
            }]
        );
        assert!(matches!(catalog.datatype("/pose"), Err(DataError::DatatypeConflict { .. })));
        assert_eq!(catalog.datatype("/unknown").unwrap(), None);
        assert_eq!(catalog.topics(), vec!["/pose".to_string()]);
        assert_eq!(catalog.topics_by_datatype().len(), 2);
    }

    #[test]
    fn test_additions_invalidate_topics_and_reads_resolve() {
        let catalog = Catalog::new();
        catalog.add_source(source("a", &[("/x", 1)]));
        assert_eq!(catalog.take_invalidated(), vec!["/x".to_string()]);
        assert!(catalog.take_invalidated().is_empty());

        let item = catalog.entry_at(secs(1), "/x").unwrap();
        let message = catalog.read_message(&item).unwrap();
        assert_eq!(&*message.payload, b"a-0");
        assert!(matches!(
            catalog.read_payload(SourceId(7), Position(0)),
            Err(DataError::UnknownSource(SourceId(7)))
        ));
    }
}
