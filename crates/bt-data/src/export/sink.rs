//! Destinations for exported messages

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use bt_core::Timestamp;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::sources::sqlite_source::BAG_SCHEMA;
use crate::DataError;

/// One message handed to a sink
#[derive(Debug, Clone, Copy)]
pub struct ExportMessage<'a> {
    pub topic: &'a str,
    pub datatype: Option<&'a str>,
    pub stamp: Timestamp,
    pub payload: &'a [u8],
}

/// Writable output log
pub trait MessageSink: Send {
    fn write(&mut self, message: &ExportMessage<'_>) -> Result<(), DataError>;

    /// Flush and finalise the output; called exactly once
    fn close(&mut self) -> Result<(), DataError>;
}

/// Opens the sink for an export destination
pub type SinkOpener = Arc<dyn Fn(&Path) -> Result<Box<dyn MessageSink>, DataError> + Send + Sync>;

/// Pick a sink from the destination's extension; unknown extensions get CSV
pub fn open_sink(path: &Path) -> Result<Box<dyn MessageSink>, DataError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "db3" | "sqlite" | "db" => Ok(Box::new(SqliteSink::create(path)?)),
        _ => Ok(Box::new(CsvSink::create(path)?)),
    }
}

/// The default [`SinkOpener`]
pub fn default_opener() -> SinkOpener {
    Arc::new(open_sink)
}

/// Writes the CSV layout read back by [`crate::CsvSource`]
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvSink {
    pub fn create(path: &Path) -> Result<Self, DataError> {
        let mut writer = csv::Writer::from_path(path).map_err(DataError::write)?;
        writer
            .write_record(["timestamp", "topic", "datatype", "payload"])
            .map_err(DataError::write)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(writer),
        })
    }
}

impl MessageSink for CsvSink {
    fn write(&mut self, message: &ExportMessage<'_>) -> Result<(), DataError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DataError::write("sink already closed"))?;
        let stamp = message.stamp.as_nanos().to_string();
        writer
            .write_record([
                stamp.as_bytes(),
                message.topic.as_bytes(),
                message.datatype.unwrap_or("").as_bytes(),
                message.payload,
            ])
            .map_err(DataError::write)
    }

    fn close(&mut self) -> Result<(), DataError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(DataError::write)?;
            debug!(path = %self.path.display(), "CSV sink closed");
        }
        Ok(())
    }
}

/// Writes a SQLite bag inside a single transaction
pub struct SqliteSink {
    path: PathBuf,
    conn: Option<Connection>,
    topic_ids: AHashMap<String, i64>,
}

impl SqliteSink {
    /// Create the bag, replacing any existing file
    pub fn create(path: &Path) -> Result<Self, DataError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(DataError::write)?;
        }
        let conn = Connection::open(path).map_err(DataError::write)?;
        conn.execute_batch(BAG_SCHEMA).map_err(DataError::write)?;
        conn.execute_batch("BEGIN").map_err(DataError::write)?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Some(conn),
            topic_ids: AHashMap::new(),
        })
    }
}

impl MessageSink for SqliteSink {
    fn write(&mut self, message: &ExportMessage<'_>) -> Result<(), DataError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| DataError::write("sink already closed"))?;

        let topic_id = match self.topic_ids.get(message.topic) {
            Some(&id) => id,
            None => {
                conn.execute(
                    "INSERT INTO topics (name, type) VALUES (?1, ?2)",
                    params![message.topic, message.datatype.unwrap_or("")],
                )
                .map_err(DataError::write)?;
                let id = conn.last_insert_rowid();
                self.topic_ids.insert(message.topic.to_string(), id);
                id
            }
        };

        conn.execute(
            "INSERT INTO messages (topic_id, timestamp, data) VALUES (?1, ?2, ?3)",
            params![topic_id, message.stamp.as_nanos(), message.payload],
        )
        .map_err(DataError::write)?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DataError> {
        if let Some(conn) = self.conn.take() {
            conn.execute_batch("COMMIT").map_err(DataError::write)?;
            conn.close().map_err(|(_, e)| DataError::write(e))?;
            debug!(path = %self.path.display(), "SQLite sink closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{open_source, TopicFilter};

    fn write_sample(path: &Path) {
        let mut sink = open_sink(path).unwrap();
        for (topic, stamp, payload) in [("/a", 10, "x,y"), ("/b", 20, "z"), ("/a", 30, "w")] {
            sink.write(&ExportMessage {
                topic,
                datatype: Some("test/Msg"),
                stamp: Timestamp::from_nanos(stamp),
                payload: payload.as_bytes(),
            })
            .unwrap();
        }
        sink.close().unwrap();
        // Closing twice is harmless
        sink.close().unwrap();
    }

    fn read_back(path: &Path) -> Vec<(String, i64, Vec<u8>)> {
        let source = open_source(path).unwrap();
        source
            .entries_in_range(TopicFilter::All, Timestamp::MIN, None)
            .map(|entry| {
                let payload = source.read_payload(entry.position).unwrap();
                (entry.topic.to_string(), entry.stamp.as_nanos(), payload)
            })
            .collect()
    }

    #[test]
    fn test_csv_sink_output_opens_as_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_sample(&path);

        let rows = read_back(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], ("/a".to_string(), 10, b"x,y".to_vec()));
    }

    #[test]
    fn test_sqlite_sink_output_opens_as_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.db3");
        std::fs::write(&path, b"stale").unwrap();
        write_sample(&path);

        let rows = read_back(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2], ("/a".to_string(), 30, b"w".to_vec()));
        assert_eq!(open_source(&path).unwrap().datatype("/b").as_deref(), Some("test/Msg"));
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(&dir.path().join("out.csv")).unwrap();
        sink.close().unwrap();
        let message = ExportMessage {
            topic: "/a",
            datatype: None,
            stamp: Timestamp::ZERO,
            payload: b"",
        };
        assert!(sink.write(&message).unwrap_err().is_write());
    }
}
