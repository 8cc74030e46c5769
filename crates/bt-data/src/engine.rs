//! The timeline engine: catalog, playhead, loaders and exports wired together

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bt_core::events::events::{DatatypeConflictDetected, SourceAdded};
use bt_core::{EventBus, MessageTimeline, PlaybackEngine, Scheduler};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::catalog::{Catalog, CatalogUpdate};
use crate::config::EngineConfig;
use crate::export::sink::SinkOpener;
use crate::export::{ExportHandle, ExportPipeline, ExportRequest, TaskSlot};
use crate::loader::{ListenerId, LoaderPool, MessageListener};
use crate::sources::{open_source, LoadedMessage, LogSource, SourcedEntry, TopicFilter};
use crate::DataError;

/// Owns every component of an open timeline.
///
/// The playback engine notifies the loader pool on every playhead move;
/// source additions widen the playback bounds and reset the loaders of the
/// affected topics.
pub struct TimelineEngine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    playback: Arc<PlaybackEngine>,
    loaders: Arc<LoaderPool>,
    exports: ExportPipeline,
    events: Arc<EventBus>,
    runtime: Handle,
    scheduler: Mutex<Option<Scheduler>>,
}

impl TimelineEngine {
    /// Create an empty engine whose tasks run on `runtime`
    pub fn new(config: EngineConfig, runtime: Handle) -> Result<Self, DataError> {
        config.validate()?;

        let catalog = Arc::new(Catalog::new());
        let playback = Arc::new(PlaybackEngine::new(config.playback_settings()));
        let events = Arc::new(EventBus::new());

        let loaders = Arc::new(LoaderPool::new(
            catalog.clone(),
            playback.clone(),
            config.loader.clone(),
            runtime.clone(),
        ));
        playback.add_subscriber(loaders.clone());

        let exports = ExportPipeline::new(catalog.clone(), Arc::new(TaskSlot::new()), events.clone(), runtime.clone());

        Ok(Self {
            config,
            catalog,
            playback,
            loaders,
            exports,
            events,
            runtime,
            scheduler: Mutex::new(None),
        })
    }

    /// Replace how export destinations are opened
    pub fn with_sink_opener(mut self, opener: SinkOpener) -> Self {
        self.exports = self.exports.with_opener(opener);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn playback(&self) -> &Arc<PlaybackEngine> {
        &self.playback
    }

    pub fn loaders(&self) -> &Arc<LoaderPool> {
        &self.loaders
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Open a log file off the async threads and add it
    pub async fn open_source(&self, path: impl AsRef<Path>) -> Result<CatalogUpdate, DataError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let source = tokio::task::spawn_blocking(move || open_source(&path)).await??;
        Ok(self.add_source(source))
    }

    /// Add an already opened source
    pub fn add_source(&self, source: Arc<dyn LogSource>) -> CatalogUpdate {
        let update = self.catalog.add_source(source);

        // The first source resets the timeline, later ones only widen it
        self.playback.set_bounds(self.catalog.bounds());
        self.loaders.invalidate(&self.catalog.take_invalidated());

        self.events.publish(SourceAdded {
            source_name: update.name.clone(),
            topic_count: update.topics.len(),
            message_count: update.message_count,
        });
        for conflict in &update.conflicts {
            self.events.publish(DatatypeConflictDetected {
                topic: conflict.topic.clone(),
                datatypes: conflict.datatypes.clone(),
            });
        }
        update
    }

    /// Start ticking the playhead; returns `false` when already running
    pub fn start_scheduler(&self) -> bool {
        let mut scheduler = self.scheduler.lock();
        if scheduler.as_ref().is_some_and(Scheduler::is_running) {
            return false;
        }
        let timeline: Arc<dyn MessageTimeline> = self.catalog.clone();
        *scheduler = Some(Scheduler::spawn(
            self.playback.clone(),
            timeline,
            self.config.tick_interval(),
            &self.runtime,
        ));
        true
    }

    pub fn stop_scheduler(&self) {
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
    }

    pub fn add_listener(&self, topic: &str, listener: Arc<dyn MessageListener>) -> ListenerId {
        self.loaders.add_listener(topic, listener)
    }

    pub fn remove_listener(&self, topic: &str, id: ListenerId) -> bool {
        self.loaders.remove_listener(topic, id)
    }

    pub fn start_export(&self, request: ExportRequest) -> Result<ExportHandle, DataError> {
        self.exports.start_export(request)
    }

    /// Export every topic over the current play region; `None` when nothing is loaded
    pub fn copy_region_to_bag(&self, destination: impl Into<PathBuf>) -> Result<Option<ExportHandle>, DataError> {
        let Some(range) = self.playback.play_region() else {
            return Ok(None);
        };
        self.start_export(ExportRequest {
            destination: destination.into(),
            topics: TopicFilter::All,
            range,
        })
        .map(Some)
    }

    /// Label of the running background operation
    pub fn background_task(&self) -> Option<String> {
        self.exports.slot().running_label()
    }

    pub fn cancel_background_task(&self) -> bool {
        self.exports.slot().cancel()
    }

    pub fn read_message(&self, item: &SourcedEntry) -> Result<LoadedMessage, DataError> {
        self.catalog.read_message(item)
    }

    /// Stop the scheduler and loaders and cancel any background operation
    pub fn close(&self) {
        self.stop_scheduler();
        if self.cancel_background_task() {
            debug!("background operation cancelled on close");
        }
        self.loaders.shutdown();
        info!(sources = self.catalog.source_count(), "timeline engine closed");
    }
}
