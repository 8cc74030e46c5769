//! Log source adapters
//!
//! A [`LogSource`] exposes one recorded log file through a uniform,
//! read-only interface: its topics and datatypes, its time range, ordered
//! iteration of index entries and payload reads at a stored position.

pub mod csv_source;
pub mod memory_source;
pub mod sqlite_source;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use ahash::AHashSet;
use bt_core::{TimeRange, Timestamp};

use crate::DataError;

pub use csv_source::CsvSource;
pub use memory_source::{MemorySource, MemorySourceBuilder};
pub use sqlite_source::SqliteSource;

/// Registration-order handle of a source inside the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub usize);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque locator of a record inside its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub u64);

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "position {}", self.0)
    }
}

/// One index entry: which topic, when, and where to read it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub topic: Arc<str>,
    pub stamp: Timestamp,
    pub position: Position,
}

/// An entry tagged with the source it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcedEntry {
    pub source: SourceId,
    pub entry: Entry,
}

impl SourcedEntry {
    pub fn stamp(&self) -> Timestamp {
        self.entry.stamp
    }

    pub fn topic(&self) -> &str {
        &self.entry.topic
    }
}

/// A fully read message, ready for listeners
#[derive(Debug, Clone)]
pub struct LoadedMessage {
    pub source: SourceId,
    pub topic: Arc<str>,
    pub datatype: Option<String>,
    pub stamp: Timestamp,
    pub position: Position,
    pub payload: Arc<[u8]>,
}

/// Owned iterator over index entries in timestamp order
pub type EntryIter = Box<dyn Iterator<Item = Entry> + Send>;

/// Which topics an iteration covers
#[derive(Debug, Clone, Default)]
pub enum TopicFilter {
    #[default]
    All,
    Only(Arc<AHashSet<String>>),
}

impl TopicFilter {
    pub fn only<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TopicFilter::Only(Arc::new(topics.into_iter().map(Into::into).collect()))
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Only(topics) => topics.contains(topic),
        }
    }
}

/// Uniform read-only view of a single recorded log file
pub trait LogSource: Send + Sync {
    fn path(&self) -> &Path;

    /// Display name, the file name when there is one
    fn name(&self) -> String {
        self.path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path().display().to_string())
    }

    /// Topic names, sorted
    fn topics(&self) -> Vec<String>;

    fn datatype(&self, topic: &str) -> Option<String>;

    /// Inclusive span from the first to the last message, `None` when empty
    fn time_range(&self) -> Option<TimeRange>;

    fn message_count(&self) -> usize;

    /// Entries with `start <= stamp <= end` in timestamp order
    fn entries_in_range(&self, topics: TopicFilter, start: Timestamp, end: Option<Timestamp>) -> EntryIter;

    fn read_payload(&self, position: Position) -> Result<Vec<u8>, DataError>;

    /// Latest entry on `topic` at or before `stamp`
    fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<Entry> {
        self.entries_in_range(TopicFilter::only([topic]), Timestamp::MIN, Some(stamp))
            .last()
    }

    /// First entry on any topic strictly after `stamp`
    fn entry_after(&self, stamp: Timestamp) -> Option<Entry> {
        self.entries_in_range(TopicFilter::All, stamp, None)
            .find(|entry| entry.stamp > stamp)
    }

    /// Topics grouped by datatype; topics without one are left out
    fn topics_by_datatype(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for topic in self.topics() {
            if let Some(datatype) = self.datatype(&topic) {
                grouped.entry(datatype).or_default().push(topic);
            }
        }
        grouped
    }
}

/// Open a log file, picking the adapter from its extension
pub fn open_source(path: &Path) -> Result<Arc<dyn LogSource>, DataError> {
    if !path.exists() {
        return Err(DataError::source_open(path, "file does not exist"));
    }

    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "csv" => Ok(Arc::new(CsvSource::open(path)?)),
        "db3" | "sqlite" | "db" => Ok(Arc::new(SqliteSource::open(path)?)),
        other => Err(DataError::source_open(
            path,
            format!("unsupported file type {:?}", other),
        )),
    }
}
