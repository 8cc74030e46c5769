//! CSV log source
//!
//! Expects a header row naming `timestamp`, `topic`, `payload` and
//! optionally `datatype`. Timestamps are integer nanoseconds; rows may come
//! in any order. A record's position is its byte offset in the file.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bt_core::{TimeRange, Timestamp};
use csv::{ByteRecord, ReaderBuilder};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::index::{SourceIndex, SourceIndexBuilder};
use crate::sources::{Entry, EntryIter, LogSource, Position, TopicFilter};
use crate::DataError;

/// Column layout located from the header row
#[derive(Debug, Clone, Copy)]
struct CsvColumns {
    timestamp: usize,
    topic: usize,
    datatype: Option<usize>,
    payload: usize,
}

impl CsvColumns {
    fn locate(headers: &ByteRecord) -> Result<Self, String> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|header| std::str::from_utf8(header).map(str::trim) == Ok(name))
        };
        let require = |name: &str| find(name).ok_or_else(|| format!("missing column {:?}", name));

        Ok(Self {
            timestamp: require("timestamp")?,
            topic: require("topic")?,
            datatype: find("datatype"),
            payload: require("payload")?,
        })
    }
}

/// CSV data source; payloads are read back by seeking to the record
pub struct CsvSource {
    path: PathBuf,
    index: Arc<SourceIndex>,
    columns: CsvColumns,
    /// Reader used for payload reads, seeks are serialised
    reader: Mutex<csv::Reader<File>>,
}

impl CsvSource {
    pub fn open(path: &Path) -> Result<Self, DataError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .map_err(|e| DataError::source_open(path, e))?;

        let headers = reader
            .byte_headers()
            .map_err(|e| DataError::source_open(path, e))?
            .clone();
        let columns = CsvColumns::locate(&headers).map_err(|reason| DataError::source_open(path, reason))?;

        let mut builder = SourceIndexBuilder::new();
        let mut record = ByteRecord::new();
        while reader
            .read_byte_record(&mut record)
            .map_err(|e| DataError::source_open(path, e))?
        {
            let (line, offset) = match record.position() {
                Some(pos) => (pos.line(), pos.byte()),
                None => return Err(DataError::source_open(path, "record without a position")),
            };
            let invalid = |what: &str| DataError::source_open(path, format!("line {}: invalid {}", line, what));

            let stamp = record
                .get(columns.timestamp)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|raw| raw.trim().parse::<i64>().ok())
                .ok_or_else(|| invalid("timestamp"))?;
            let topic = record
                .get(columns.topic)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .filter(|topic| !topic.is_empty())
                .ok_or_else(|| invalid("topic"))?;
            let datatype = columns
                .datatype
                .and_then(|column| record.get(column))
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .filter(|datatype| !datatype.is_empty());

            let id = builder.add_topic(topic, datatype);
            builder.push(id, Timestamp::from_nanos(stamp), Position(offset));
        }

        let index = builder.build();
        info!(path = %path.display(), messages = index.len(), topics = index.topics().len(), "indexed CSV log");

        Ok(Self {
            path: path.to_path_buf(),
            index: Arc::new(index),
            columns,
            reader: Mutex::new(reader),
        })
    }
}

impl LogSource for CsvSource {
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
        let mut reader = self.reader.lock();

        let mut seek_to = csv::Position::new();
        seek_to.set_byte(position.0);
        reader.seek(seek_to).map_err(|e| DataError::read(position, e))?;

        let mut record = ByteRecord::new();
        let found = reader
            .read_byte_record(&mut record)
            .map_err(|e| DataError::read(position, e))?;
        if !found {
            return Err(DataError::read(position, "past the end of the file"));
        }

        debug!(path = %self.path.display(), offset = position.0, "read CSV record");
        record
            .get(self.columns.payload)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DataError::read(position, "record has no payload column"))
    }

    fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<Entry> {
        self.index.entry_at(stamp, topic)
    }

    fn entry_after(&self, stamp: Timestamp) -> Option<Entry> {
        self.index.entry_after(stamp)
    }
}
