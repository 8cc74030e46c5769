//! SQLite bag source
//!
//! Reads databases with a `topics(id, name, type)` table and a
//! `messages(id, topic_id, timestamp, data)` table. A record's position is
//! its message row id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use bt_core::{TimeRange, Timestamp};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::index::{SourceIndex, SourceIndexBuilder};
use crate::sources::{Entry, EntryIter, LogSource, Position, TopicFilter};
use crate::DataError;

/// Tables shared by the SQLite source and the SQLite export sink
pub const BAG_SCHEMA: &str = "
    CREATE TABLE topics (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        type TEXT NOT NULL
    );
    CREATE TABLE messages (
        id INTEGER PRIMARY KEY,
        topic_id INTEGER NOT NULL REFERENCES topics(id),
        timestamp INTEGER NOT NULL,
        data BLOB NOT NULL
    );
    CREATE INDEX messages_timestamp ON messages (timestamp);
";

/// SQLite data source implementation
pub struct SqliteSource {
    path: PathBuf,
    index: Arc<SourceIndex>,
    conn: Mutex<Connection>,
}

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self, DataError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| DataError::source_open(path, e))?;
        let index = Self::build_index(&conn).map_err(|e| DataError::source_open(path, e))?;

        info!(path = %path.display(), messages = index.len(), topics = index.topics().len(), "indexed SQLite bag");

        Ok(Self {
            path: path.to_path_buf(),
            index: Arc::new(index),
            conn: Mutex::new(conn),
        })
    }

    fn build_index(conn: &Connection) -> Result<SourceIndex, rusqlite::Error> {
        let mut builder = SourceIndexBuilder::new();

        let mut topic_ids = AHashMap::new();
        let mut stmt = conn.prepare("SELECT id, name, type FROM topics")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (db_id, name, datatype) = row?;
            topic_ids.insert(db_id, builder.add_topic(&name, Some(&datatype)));
        }

        let mut stmt = conn.prepare("SELECT id, topic_id, timestamp FROM messages ORDER BY timestamp, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (id, topic_id, stamp) = row?;
            // Messages referencing a missing topic row are skipped
            if let Some(&topic) = topic_ids.get(&topic_id) {
                builder.push(topic, Timestamp::from_nanos(stamp), Position(id as u64));
            }
        }

        Ok(builder.build())
    }
}

impl LogSource for SqliteSource {
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
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT data FROM messages WHERE id = ?1",
            [position.0 as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| DataError::read(position, e))?
        .ok_or_else(|| DataError::read(position, "no message with this id"))
    }

    fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<Entry> {
        self.index.entry_at(stamp, topic)
    }

    fn entry_after(&self, stamp: Timestamp) -> Option<Entry> {
        self.index.entry_after(stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_bag(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(BAG_SCHEMA).unwrap();
        conn.execute("INSERT INTO topics (id, name, type) VALUES (1, '/imu', 'sensor/Imu')", [])
            .unwrap();
        conn.execute("INSERT INTO topics (id, name, type) VALUES (2, '/gps', 'sensor/Fix')", [])
            .unwrap();
        for (topic, stamp, data) in [(1, 200, "b"), (2, 100, "a"), (1, 300, "c")] {
            conn.execute(
                "INSERT INTO messages (topic_id, timestamp, data) VALUES (?1, ?2, ?3)",
                rusqlite::params![topic, stamp, data.as_bytes()],
            )
            .unwrap();
        }
    }

    #[test]
    fn test_reads_topics_and_messages_in_time_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drive.db3");
        create_bag(&path);

        let source = SqliteSource::open(&path).unwrap();
        assert_eq!(source.name(), "drive.db3");
        assert_eq!(source.message_count(), 3);
        assert_eq!(source.datatype("/gps").as_deref(), Some("sensor/Fix"));

        let payloads: Vec<Vec<u8>> = source
            .entries_in_range(TopicFilter::All, Timestamp::MIN, None)
            .map(|entry| source.read_payload(entry.position).unwrap())
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        assert!(source.read_payload(Position(42)).unwrap_err().is_read());
    }

    #[test]
    fn test_non_bag_database_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE things (id INTEGER)")
            .unwrap();

        assert!(matches!(SqliteSource::open(&path), Err(DataError::SourceOpen { .. })));
    }
}
