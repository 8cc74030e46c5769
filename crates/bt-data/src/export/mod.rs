//! Background export of a time range into a new log

pub mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use bt_core::events::events::{TaskFinished, TaskOutcome, TaskProgress, TaskStarted};
use bt_core::{EventBus, TimeRange};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::sources::{SourcedEntry, TopicFilter};
use crate::DataError;

use self::sink::{default_opener, ExportMessage, MessageSink, SinkOpener};

struct RunningTask {
    label: String,
    cancel: CancellationToken,
}

/// Single-flight slot: at most one background operation at a time
#[derive(Default)]
pub struct TaskSlot {
    current: Mutex<Option<RunningTask>>,
}

/// Proof of holding the [`TaskSlot`]; releases it when dropped
pub struct TaskGuard {
    slot: Arc<TaskSlot>,
    cancel: CancellationToken,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the slot, or fail with the label of the operation holding it
    pub fn try_acquire(self: &Arc<Self>, label: &str) -> Result<TaskGuard, DataError> {
        let mut current = self.current.lock();
        if let Some(running) = current.as_ref() {
            return Err(DataError::TaskBusy {
                running: running.label.clone(),
            });
        }

        let cancel = CancellationToken::new();
        *current = Some(RunningTask {
            label: label.to_string(),
            cancel: cancel.clone(),
        });
        Ok(TaskGuard {
            slot: self.clone(),
            cancel,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn running_label(&self) -> Option<String> {
        self.current.lock().as_ref().map(|running| running.label.clone())
    }

    /// Request cancellation of the running operation, if any
    pub fn cancel(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(running) => {
                info!(task = %running.label, "cancelling background operation");
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

impl TaskGuard {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.slot.current.lock().take();
    }
}

/// What to export
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub destination: PathBuf,
    pub topics: TopicFilter,
    pub range: TimeRange,
}

/// Final account of an export
#[derive(Debug)]
pub struct ExportReport {
    pub label: String,
    pub total: usize,
    pub written: usize,
    pub outcome: TaskOutcome,
    /// The read, write or close error that aborted the export
    pub error: Option<DataError>,
}

/// A running export
pub struct ExportHandle {
    label: String,
    total: usize,
    cancel: CancellationToken,
    task: JoinHandle<ExportReport>,
}

impl ExportHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Number of messages selected for export
    pub fn total(&self) -> usize {
        self.total
    }

    /// Ask the export to stop before its next message
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the export to end
    pub async fn wait(self) -> Result<ExportReport, DataError> {
        Ok(self.task.await?)
    }
}

/// Copies merged catalog entries into a sink on a blocking worker
pub struct ExportPipeline {
    catalog: Arc<Catalog>,
    slot: Arc<TaskSlot>,
    events: Arc<EventBus>,
    runtime: Handle,
    opener: SinkOpener,
}

impl ExportPipeline {
    pub fn new(catalog: Arc<Catalog>, slot: Arc<TaskSlot>, events: Arc<EventBus>, runtime: Handle) -> Self {
        Self {
            catalog,
            slot,
            events,
            runtime,
            opener: default_opener(),
        }
    }

    /// Replace how destinations are opened
    pub fn with_opener(mut self, opener: SinkOpener) -> Self {
        self.opener = opener;
        self
    }

    pub fn slot(&self) -> &Arc<TaskSlot> {
        &self.slot
    }

    /// Start copying the selected messages into `request.destination`.
    ///
    /// Fails without creating the destination when another background
    /// operation runs or nothing matches the selection. Once started, the
    /// slot is released however the export ends.
    pub fn start_export(&self, request: ExportRequest) -> Result<ExportHandle, DataError> {
        let label = format!("Copying messages to \"{}\"", request.destination.display());
        let guard = self.slot.try_acquire(&label)?;

        let entries: Vec<SourcedEntry> = self
            .catalog
            .entries(request.topics.clone(), request.range.start, Some(request.range.end))
            .collect();
        if guard.is_cancelled() {
            return Err(DataError::Cancelled);
        }
        if entries.is_empty() {
            return Err(DataError::EmptySelection);
        }

        let sink = (self.opener)(&request.destination)?;
        let total = entries.len();
        info!(task = %label, total, "export started");
        self.events.publish(TaskStarted {
            label: label.clone(),
            total,
        });

        let cancel = guard.token();
        let job = ExportJob {
            label: label.clone(),
            catalog: self.catalog.clone(),
            events: self.events.clone(),
            entries,
            guard,
        };
        let task = self.runtime.spawn_blocking(move || job.run(sink));

        Ok(ExportHandle {
            label,
            total,
            cancel,
            task,
        })
    }
}

struct ExportJob {
    label: String,
    catalog: Arc<Catalog>,
    events: Arc<EventBus>,
    entries: Vec<SourcedEntry>,
    guard: TaskGuard,
}

impl ExportJob {
    fn run(self, mut sink: Box<dyn MessageSink>) -> ExportReport {
        let total = self.entries.len();
        let update_step = (total / 100).max(1);
        let mut percent = 0u8;
        let mut written = 0usize;
        let mut failure: Option<DataError> = None;

        for (idx, item) in self.entries.iter().enumerate() {
            if self.guard.is_cancelled() {
                break;
            }
            if let Err(e) = self.copy(sink.as_mut(), item) {
                warn!(task = %self.label, error = %e, "export aborted");
                failure = Some(e);
                break;
            }
            written += 1;

            let done = idx + 1;
            if done % update_step == 0 || done == total {
                let now = (100 * done / total) as u8;
                if now != percent {
                    percent = now;
                    self.events.publish(TaskProgress {
                        label: self.label.clone(),
                        percent,
                    });
                }
            }
        }

        if let Err(e) = sink.close() {
            warn!(task = %self.label, error = %e, "closing export output failed");
            failure.get_or_insert(e);
        }

        let outcome = match &failure {
            Some(e) => TaskOutcome::Failed {
                written,
                error: e.to_string(),
            },
            None if written < total => TaskOutcome::Cancelled { written },
            None => TaskOutcome::Completed { written },
        };
        info!(task = %self.label, ?outcome, "export finished");

        let ExportJob {
            label, events, guard, ..
        } = self;
        // Free the slot before observers hear about it
        drop(guard);
        events.publish(TaskFinished {
            label: label.clone(),
            outcome: outcome.clone(),
        });

        ExportReport {
            label,
            total,
            written,
            outcome,
            error: failure,
        }
    }

    fn copy(&self, sink: &mut dyn MessageSink, item: &SourcedEntry) -> Result<(), DataError> {
        let source = self
            .catalog
            .source(item.source)
            .ok_or(DataError::UnknownSource(item.source))?;
        let payload = source.read_payload(item.entry.position)?;
        let datatype = source.datatype(&item.entry.topic);

        sink.write(&ExportMessage {
            topic: &item.entry.topic,
            datatype: datatype.as_deref(),
            stamp: item.entry.stamp,
            payload: &payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{Entry, EntryIter, LogSource, MemorySource, Position};
    use bt_core::events::{downcast, handler_from_fn};
    use bt_core::Timestamp;
    use std::path::Path;
    use std::sync::mpsc as std_mpsc;

    fn secs(value: i64) -> Timestamp {
        Timestamp::from_nanos(value * 1_000_000_000)
    }

    fn catalog_with(count: i64) -> Arc<Catalog> {
        let mut builder = MemorySource::builder("src").topic("/a", "test/Msg");
        for idx in 0..count {
            builder = builder.message("/a", secs(idx), format!("m{}", idx));
        }
        let catalog = Arc::new(Catalog::new());
        catalog.add_source(Arc::new(builder.build()));
        catalog
    }

    fn pipeline(catalog: Arc<Catalog>) -> (ExportPipeline, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        let pipeline = ExportPipeline::new(catalog, Arc::new(TaskSlot::new()), events.clone(), Handle::current());
        (pipeline, events)
    }

    fn request(destination: &Path, start: i64, end: i64) -> ExportRequest {
        ExportRequest {
            destination: destination.to_path_buf(),
            topics: TopicFilter::All,
            range: TimeRange::new(secs(start), secs(end)),
        }
    }

    /// Sink that records writes and blocks until each one is permitted
    struct GatedSink {
        permits: std_mpsc::Receiver<()>,
        written: Arc<Mutex<Vec<Timestamp>>>,
        fail_at: Option<usize>,
    }

    impl MessageSink for GatedSink {
        fn write(&mut self, message: &ExportMessage<'_>) -> Result<(), DataError> {
            self.permits.recv().map_err(DataError::write)?;
            let mut written = self.written.lock();
            if self.fail_at == Some(written.len()) {
                return Err(DataError::write("disk full"));
            }
            written.push(message.stamp);
            Ok(())
        }

        fn close(&mut self) -> Result<(), DataError> {
            Ok(())
        }
    }

    fn gated_opener(
        fail_at: Option<usize>,
    ) -> (SinkOpener, std_mpsc::Sender<()>, Arc<Mutex<Vec<Timestamp>>>) {
        let (permit_tx, permit_rx) = std_mpsc::channel();
        let written = Arc::new(Mutex::new(Vec::new()));
        let permits = Arc::new(Mutex::new(Some(permit_rx)));
        let log = written.clone();
        let opener: SinkOpener = Arc::new(move |_path: &Path| -> Result<Box<dyn MessageSink>, DataError> {
            let permits = permits
                .lock()
                .take()
                .ok_or_else(|| DataError::write("sink opened twice"))?;
            Ok(Box::new(GatedSink {
                permits,
                written: log.clone(),
                fail_at,
            }))
        });
        (opener, permit_tx, written)
    }

    #[tokio::test]
    async fn test_export_copies_range_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("copy.csv");
        let (pipeline, events) = pipeline(catalog_with(10));

        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = progress.clone();
        events.subscribe::<TaskProgress>(handler_from_fn(move |event| {
            if let Some(event) = downcast::<TaskProgress>(event) {
                seen.lock().push(event.percent);
            }
        }));

        let handle = pipeline.start_export(request(&destination, 2, 5)).unwrap();
        assert_eq!(handle.total(), 4);
        let report = handle.wait().await.unwrap();

        assert_eq!(report.outcome, TaskOutcome::Completed { written: 4 });
        assert_eq!(*progress.lock(), vec![25, 50, 75, 100]);
        assert!(!pipeline.slot().is_busy());

        let copied = crate::sources::open_source(&destination).unwrap();
        assert_eq!(copied.message_count(), 4);
        assert_eq!(copied.time_range(), Some(TimeRange::new(secs(2), secs(5))));
    }

    #[tokio::test]
    async fn test_second_export_rejected_while_busy() {
        let dir = tempfile::tempdir().unwrap();
        let (opener, permits, _written) = gated_opener(None);
        let (pipeline, _events) = pipeline(catalog_with(3));
        let pipeline = pipeline.with_opener(opener);

        let first = pipeline.start_export(request(&dir.path().join("a.csv"), 0, 2)).unwrap();

        let second_path = dir.path().join("b.csv");
        let err = pipeline.start_export(request(&second_path, 0, 2)).err().unwrap();
        match err {
            DataError::TaskBusy { running } => assert!(running.contains("a.csv")),
            other => panic!("unexpected error {other}"),
        }
        assert!(!second_path.exists());

        // A pipeline sharing the slot with the real sinks leaves an existing file alone
        let existing = dir.path().join("existing.csv");
        std::fs::write(&existing, b"keep me\n").unwrap();
        let other = ExportPipeline::new(
            catalog_with(3),
            pipeline.slot().clone(),
            Arc::new(EventBus::new()),
            Handle::current(),
        );
        assert!(matches!(
            other.start_export(request(&existing, 0, 2)),
            Err(DataError::TaskBusy { .. })
        ));
        assert_eq!(std::fs::read(&existing).unwrap(), b"keep me\n");

        for _ in 0..3 {
            permits.send(()).unwrap();
        }
        let report = first.wait().await.unwrap();
        assert_eq!(report.outcome, TaskOutcome::Completed { written: 3 });

        assert!(!pipeline.slot().is_busy());
    }

    #[tokio::test]
    async fn test_cancel_leaves_a_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let (opener, permits, written) = gated_opener(None);
        let (pipeline, _events) = pipeline(catalog_with(10));
        let pipeline = pipeline.with_opener(opener);

        let handle = pipeline.start_export(request(&dir.path().join("a.csv"), 0, 9)).unwrap();
        permits.send(()).unwrap();
        permits.send(()).unwrap();
        while written.lock().len() < 2 {
            tokio::task::yield_now().await;
        }

        assert!(pipeline.slot().cancel());
        // Let a blocked third write through so the worker sees the cancel
        let _ = permits.send(());
        drop(permits);

        let report = handle.wait().await.unwrap();
        let count = written.lock().len();
        assert!(count == 2 || count == 3, "wrote {count}");
        assert_eq!(report.outcome, TaskOutcome::Cancelled { written: count });
        assert_eq!(*written.lock(), (0..count as i64).map(secs).collect::<Vec<_>>());
        assert!(!pipeline.slot().is_busy());
    }

    #[tokio::test]
    async fn test_write_error_aborts_and_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (opener, permits, written) = gated_opener(Some(1));
        let (pipeline, _events) = pipeline(catalog_with(5));
        let pipeline = pipeline.with_opener(opener);

        let handle = pipeline.start_export(request(&dir.path().join("a.csv"), 0, 4)).unwrap();
        for _ in 0..5 {
            permits.send(()).unwrap();
        }
        let report = handle.wait().await.unwrap();

        assert!(matches!(report.outcome, TaskOutcome::Failed { written: 1, .. }));
        assert!(report.error.as_ref().is_some_and(DataError::is_write));
        assert_eq!(written.lock().len(), 1);
        assert!(!pipeline.slot().is_busy());
    }

    /// Source whose payload reads always fail
    struct Unreadable {
        inner: MemorySource,
    }

    impl LogSource for Unreadable {
        fn path(&self) -> &Path {
            self.inner.path()
        }
        fn topics(&self) -> Vec<String> {
            self.inner.topics()
        }
        fn datatype(&self, topic: &str) -> Option<String> {
            self.inner.datatype(topic)
        }
        fn time_range(&self) -> Option<TimeRange> {
            self.inner.time_range()
        }
        fn message_count(&self) -> usize {
            self.inner.message_count()
        }
        fn entries_in_range(&self, topics: TopicFilter, start: Timestamp, end: Option<Timestamp>) -> EntryIter {
            self.inner.entries_in_range(topics, start, end)
        }
        fn read_payload(&self, position: Position) -> Result<Vec<u8>, DataError> {
            Err(DataError::read(position, "truncated chunk"))
        }
        fn entry_at(&self, stamp: Timestamp, topic: &str) -> Option<Entry> {
            self.inner.entry_at(stamp, topic)
        }
    }

    #[tokio::test]
    async fn test_read_error_aborts_export() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::new());
        catalog.add_source(Arc::new(Unreadable {
            inner: MemorySource::builder("bad").message("/a", secs(1), "x").build(),
        }));
        let (pipeline, _events) = pipeline(catalog);

        let report = pipeline
            .start_export(request(&dir.path().join("a.csv"), 0, 5))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(matches!(report.outcome, TaskOutcome::Failed { written: 0, .. }));
        assert!(report.error.as_ref().is_some_and(DataError::is_read));
    }

    #[tokio::test]
    async fn test_empty_selection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("a.csv");
        let (pipeline, _events) = pipeline(catalog_with(3));

        let err = pipeline.start_export(request(&destination, 50, 60)).err().unwrap();
        assert!(matches!(err, DataError::EmptySelection));
        assert!(!destination.exists());
        assert!(!pipeline.slot().is_busy());
    }
}
