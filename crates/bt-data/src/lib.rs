//! Log sources, the timeline catalog and the background workers built on it

pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod export;
pub mod index;
pub mod loader;
pub mod merge;
pub mod sources;

use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

// Re-exports
pub use catalog::{Catalog, CatalogUpdate, DatatypeConflict};
pub use config::{EngineConfig, LoaderConfig};
pub use engine::TimelineEngine;
pub use export::{ExportHandle, ExportPipeline, ExportReport, ExportRequest, TaskSlot};
pub use export::sink::{open_sink, CsvSink, MessageSink, SinkOpener, SqliteSink};
pub use index::SourceIndex;
pub use loader::{ChannelListener, ListenerId, LoaderPool, MessageListener};
pub use merge::MergeIterator;
pub use sources::{
    open_source, CsvSource, Entry, LoadedMessage, LogSource, MemorySource, Position, SourceId,
    SourcedEntry, SqliteSource, TopicFilter,
};

/// Errors that can occur in data operations
#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to open {path}: {reason}")]
    SourceOpen { path: PathBuf, reason: String },

    #[error("topic {topic} has conflicting datatypes: {}", .datatypes.join(", "))]
    DatatypeConflict { topic: String, datatypes: Vec<String> },

    #[error("error reading message at {position}: {reason}")]
    Read { position: Position, reason: String },

    #[error("error writing message: {0}")]
    Write(String),

    #[error("background operation already running: {running}")]
    TaskBusy { running: String },

    #[error("no messages found")]
    EmptySelection,

    #[error("background operation cancelled")]
    Cancelled,

    #[error("unknown source {0}")]
    UnknownSource(SourceId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Join error: {0}")]
    Join(#[from] JoinError),
}

impl DataError {
    pub fn read(position: Position, reason: impl ToString) -> Self {
        DataError::Read {
            position,
            reason: reason.to_string(),
        }
    }

    pub fn write(reason: impl ToString) -> Self {
        DataError::Write(reason.to_string())
    }

    pub fn source_open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        DataError::SourceOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Failure reading a record from a log source
    pub fn is_read(&self) -> bool {
        matches!(self, DataError::Read { .. })
    }

    /// Failure writing to an export destination
    pub fn is_write(&self) -> bool {
        matches!(self, DataError::Write(_))
    }
}

impl From<csv::Error> for DataError {
    fn from(error: csv::Error) -> Self {
        match error.kind() {
            csv::ErrorKind::Io(io_err) => DataError::Io(std::io::Error::new(io_err.kind(), error.to_string())),
            _ => DataError::Csv(error.to_string()),
        }
    }
}
