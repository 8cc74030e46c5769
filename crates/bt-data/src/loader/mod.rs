//! Per-topic loaders that keep listeners supplied with the message at the playhead
//!
//! Each topic with at least one listener gets a worker task. Playhead moves
//! and source additions send the worker a wake-up; the worker checks the
//! current playhead against its buffered window, loads a new window off the
//! async threads when needed, and publishes the message in effect whenever
//! it changes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bt_core::{PlaybackContext, PlaybackEngine, PlayheadSubscriber, TimeRange, Timestamp};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cache::TopicBuffer;
use crate::catalog::Catalog;
use crate::config::LoaderConfig;
use crate::sources::{LoadedMessage, Position, SourceId, SourcedEntry, TopicFilter};

/// Receives the message in effect at the playhead for a topic.
///
/// Called from the loader task; implementations should hand the message
/// off rather than do heavy work inline.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &LoadedMessage);
}

/// Handle for removing a listener again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

/// Listener that forwards messages into an unbounded channel
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<LoadedMessage>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoadedMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Self { sender }), receiver)
    }
}

impl MessageListener for ChannelListener {
    fn on_message(&self, message: &LoadedMessage) {
        // A dropped receiver just means nobody is reading any more
        let _ = self.sender.send(message.clone());
    }
}

type ListenerList = Arc<RwLock<Vec<(ListenerId, Arc<dyn MessageListener>)>>>;

#[derive(Debug)]
enum LoaderSignal {
    /// Re-check the playhead; carries the generation current at send time
    Wake { generation: u64 },
    Shutdown,
}

struct TopicLoader {
    listeners: ListenerList,
    sender: mpsc::UnboundedSender<LoaderSignal>,
    generation: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl TopicLoader {
    fn wake(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.sender.send(LoaderSignal::Wake { generation });
    }

    /// Discard buffered state and republish to every listener
    fn reset(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.sender.send(LoaderSignal::Wake { generation });
    }

    fn shutdown(self) {
        if self.sender.send(LoaderSignal::Shutdown).is_err() {
            self.task.abort();
        }
    }
}

/// Messages read for one buffer window
struct LoadedWindow {
    range: TimeRange,
    messages: Vec<LoadedMessage>,
}

/// Choose and read the window of `topic` around `playhead`.
///
/// At most half the capacity goes to messages at or before the playhead.
/// The returned range is exact for `latest_at`: it starts at the oldest
/// kept message when older ones were dropped and ends just before the
/// first message that did not fit.
fn load_window(catalog: &Catalog, topic: &str, playhead: Timestamp, config: &LoaderConfig) -> LoadedWindow {
    let capacity = config.buffer_capacity.max(1);
    let behind_capacity = (capacity / 2).max(1);
    let lookbehind = i64::try_from(config.lookbehind().as_nanos()).unwrap_or(i64::MAX);

    let mut start = playhead.saturating_offset(-lookbehind);
    let mut end = playhead.saturating_add(config.lookahead());

    // The message still in effect when the window opens
    let anchor = catalog
        .entry_at(start, topic)
        .filter(|anchor| anchor.stamp() < start);

    let mut behind: VecDeque<SourcedEntry> = VecDeque::new();
    let mut ahead: Vec<SourcedEntry> = Vec::new();
    let mut trimmed = false;

    for item in catalog.entries(TopicFilter::only([topic]), start, Some(end)) {
        if item.stamp() <= playhead {
            behind.push_back(item);
            if behind.len() > behind_capacity {
                behind.pop_front();
                trimmed = true;
            }
            continue;
        }
        // Later messages all sort after `behind`, so its final size is known here
        let reserved = usize::from(anchor.is_some() && !trimmed);
        if behind.len() + ahead.len() + reserved < capacity {
            ahead.push(item);
        } else {
            end = item.stamp().saturating_offset(-1);
            break;
        }
    }

    let had_anchor = anchor.is_some();
    match anchor {
        Some(anchor) if !trimmed && behind.len() + ahead.len() < capacity => behind.push_front(anchor),
        _ if trimmed || had_anchor => {
            if let Some(front) = behind.front() {
                start = front.stamp();
            }
        }
        _ => {}
    }

    let mut messages = Vec::with_capacity(behind.len() + ahead.len());
    for item in behind.iter().chain(ahead.iter()) {
        match catalog.read_message(item) {
            Ok(message) => messages.push(message),
            Err(e) => warn!(topic, source = %item.source, error = %e, "skipping unreadable message"),
        }
    }

    LoadedWindow {
        range: TimeRange::new(start, end),
        messages,
    }
}

struct LoaderWorker {
    topic: String,
    catalog: Arc<Catalog>,
    playback: Arc<PlaybackEngine>,
    listeners: ListenerList,
    generation: Arc<AtomicU64>,
    config: LoaderConfig,
}

impl LoaderWorker {
    async fn run(self, mut signals: mpsc::UnboundedReceiver<LoaderSignal>) {
        let mut buffer = TopicBuffer::new(self.config.buffer_capacity);
        let mut published: Option<(SourceId, Position)> = None;
        debug!(topic = %self.topic, "topic loader started");

        while let Some(signal) = signals.recv().await {
            // Coalesce queued wake-ups into one pass
            let mut shutdown = matches!(signal, LoaderSignal::Shutdown);
            while !shutdown {
                match signals.try_recv() {
                    Ok(LoaderSignal::Shutdown) => shutdown = true,
                    Ok(LoaderSignal::Wake { .. }) => {}
                    Err(_) => break,
                }
            }
            if shutdown {
                break;
            }

            let generation = self.generation.load(Ordering::SeqCst);
            if let LoaderSignal::Wake { generation: sent } = signal {
                if sent != generation {
                    trace!(topic = %self.topic, sent, generation, "stale wake-up");
                }
            }
            if buffer.generation() != generation {
                buffer.reset(generation);
                published = None;
            }

            let Some(playhead) = self.playback.playhead() else {
                continue;
            };

            if !buffer.covers(playhead) {
                let catalog = self.catalog.clone();
                let topic = self.topic.clone();
                let config = self.config.clone();
                let loaded =
                    tokio::task::spawn_blocking(move || load_window(&catalog, &topic, playhead, &config)).await;

                match loaded {
                    Ok(window) => {
                        if self.generation.load(Ordering::SeqCst) != generation {
                            // Superseded while loading; the reset queued another wake-up
                            continue;
                        }
                        trace!(topic = %self.topic, messages = window.messages.len(), "buffer window loaded");
                        buffer.fill(window.range, window.messages);
                    }
                    Err(e) => {
                        error!(topic = %self.topic, error = %e, "buffer window load failed");
                        continue;
                    }
                }
            }

            let current = buffer.latest_at(playhead);
            let key = current.map(|message| (message.source, message.position));
            if key != published {
                published = key;
                if let Some(message) = current {
                    for (_, listener) in self.listeners.read().iter() {
                        listener.on_message(message);
                    }
                }
            }
        }

        debug!(topic = %self.topic, "topic loader stopped");
    }
}

/// Registry of topic listeners and the loader tasks serving them
pub struct LoaderPool {
    catalog: Arc<Catalog>,
    playback: Arc<PlaybackEngine>,
    config: LoaderConfig,
    runtime: Handle,
    loaders: Mutex<AHashMap<String, TopicLoader>>,
}

impl LoaderPool {
    pub fn new(catalog: Arc<Catalog>, playback: Arc<PlaybackEngine>, config: LoaderConfig, runtime: Handle) -> Self {
        Self {
            catalog,
            playback,
            config,
            runtime,
            loaders: Mutex::new(AHashMap::new()),
        }
    }

    fn spawn_loader(&self, topic: &str) -> TopicLoader {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listeners: ListenerList = Arc::new(RwLock::new(Vec::new()));
        let generation = Arc::new(AtomicU64::new(0));

        let worker = LoaderWorker {
            topic: topic.to_string(),
            catalog: self.catalog.clone(),
            playback: self.playback.clone(),
            listeners: listeners.clone(),
            generation: generation.clone(),
            config: self.config.clone(),
        };
        let task = self.runtime.spawn(worker.run(receiver));

        TopicLoader {
            listeners,
            sender,
            generation,
            task,
        }
    }

    /// Register `listener` for `topic`, starting a loader if none runs.
    ///
    /// The topic's loader is reset so every listener, including the new one,
    /// receives the current message.
    pub fn add_listener(&self, topic: &str, listener: Arc<dyn MessageListener>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        let mut loaders = self.loaders.lock();
        let loader = loaders
            .entry(topic.to_string())
            .or_insert_with(|| self.spawn_loader(topic));

        loader.listeners.write().push((id, listener));
        loader.reset();
        info!(topic, listeners = loader.listeners.read().len(), "listener added");
        id
    }

    /// Unregister a listener; the loader stops with its last listener
    pub fn remove_listener(&self, topic: &str, id: ListenerId) -> bool {
        let mut loaders = self.loaders.lock();
        let Some(loader) = loaders.get(topic) else {
            return false;
        };

        let (removed, empty) = {
            let mut listeners = loader.listeners.write();
            let before = listeners.len();
            listeners.retain(|(listener_id, _)| *listener_id != id);
            (listeners.len() != before, listeners.is_empty())
        };

        if empty {
            if let Some(loader) = loaders.remove(topic) {
                loader.shutdown();
                info!(topic, "last listener removed, loader stopped");
            }
        }
        removed
    }

    pub fn has_listeners(&self, topic: &str) -> bool {
        self.listener_count(topic) > 0
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.loaders
            .lock()
            .get(topic)
            .map_or(0, |loader| loader.listeners.read().len())
    }

    /// Topics with a running loader, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.loaders.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Reset the loaders of the given topics
    pub fn invalidate(&self, topics: &[String]) {
        let loaders = self.loaders.lock();
        for topic in topics {
            if let Some(loader) = loaders.get(topic) {
                loader.reset();
            }
        }
    }

    pub fn wake_all(&self) {
        for loader in self.loaders.lock().values() {
            loader.wake();
        }
    }

    /// Stop every loader
    pub fn shutdown(&self) {
        let loaders: Vec<(String, TopicLoader)> = self.loaders.lock().drain().collect();
        for (topic, loader) in loaders {
            debug!(%topic, "stopping loader");
            loader.shutdown();
        }
    }
}

impl PlayheadSubscriber for LoaderPool {
    fn on_playhead_moved(&self, _context: &PlaybackContext) {
        self.wake_all();
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MemorySource;
    use std::time::Duration;

    fn secs(value: f64) -> Timestamp {
        Timestamp::from_secs_f64(value)
    }

    struct Fixture {
        playback: Arc<PlaybackEngine>,
        pool: Arc<LoaderPool>,
    }

    fn fixture(stamps: &[f64], config: LoaderConfig) -> Fixture {
        let mut builder = MemorySource::builder("fixture").topic("/a", "test/Msg");
        for stamp in stamps {
            builder = builder.message("/a", secs(*stamp), format!("{}", stamp));
        }
        let catalog = Arc::new(Catalog::new());
        catalog.add_source(Arc::new(builder.build()));

        let playback = Arc::new(PlaybackEngine::default());
        playback.set_bounds(catalog.bounds());

        let pool = Arc::new(LoaderPool::new(catalog, playback.clone(), config, Handle::current()));
        playback.add_subscriber(pool.clone());
        Fixture { playback, pool }
    }

    async fn next_stamp(receiver: &mut mpsc::UnboundedReceiver<LoadedMessage>) -> Timestamp {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("listener channel closed")
            .stamp
    }

    #[tokio::test]
    async fn test_listener_follows_playhead() {
        let fixture = fixture(&[1.0, 2.0, 3.0], LoaderConfig::default());
        let (listener, mut receiver) = ChannelListener::new();
        fixture.pool.add_listener("/a", listener);

        assert_eq!(next_stamp(&mut receiver).await, secs(1.0));

        fixture.playback.seek(secs(2.5)).unwrap();
        assert_eq!(next_stamp(&mut receiver).await, secs(2.0));

        fixture.playback.seek(secs(3.0)).unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.stamp, secs(3.0));
        assert_eq!(&*message.payload, b"3");
        assert_eq!(message.datatype.as_deref(), Some("test/Msg"));
    }

    #[tokio::test]
    async fn test_small_buffer_reloads_far_from_window() {
        let stamps: Vec<f64> = (1..=20).map(f64::from).collect();
        let config = LoaderConfig {
            lookbehind_ms: 30_000,
            lookahead_ms: 30_000,
            buffer_capacity: 2,
        };
        let fixture = fixture(&stamps, config);
        let (listener, mut receiver) = ChannelListener::new();
        fixture.pool.add_listener("/a", listener);
        assert_eq!(next_stamp(&mut receiver).await, secs(1.0));

        fixture.playback.seek(secs(17.5)).unwrap();
        assert_eq!(next_stamp(&mut receiver).await, secs(17.0));

        fixture.playback.seek(secs(4.2)).unwrap();
        assert_eq!(next_stamp(&mut receiver).await, secs(4.0));
    }

    #[tokio::test]
    async fn test_new_listener_gets_current_message() {
        let fixture = fixture(&[1.0, 2.0], LoaderConfig::default());
        let (first, mut first_rx) = ChannelListener::new();
        fixture.pool.add_listener("/a", first);
        assert_eq!(next_stamp(&mut first_rx).await, secs(1.0));

        let (second, mut second_rx) = ChannelListener::new();
        fixture.pool.add_listener("/a", second);
        assert_eq!(next_stamp(&mut second_rx).await, secs(1.0));
        assert_eq!(fixture.pool.listener_count("/a"), 2);
    }

    #[tokio::test]
    async fn test_last_listener_removal_stops_loader() {
        let fixture = fixture(&[1.0], LoaderConfig::default());
        let (listener, _receiver) = ChannelListener::new();
        let id = fixture.pool.add_listener("/a", listener);
        assert!(fixture.pool.has_listeners("/a"));
        assert_eq!(fixture.pool.topics(), vec!["/a".to_string()]);

        assert!(!fixture.pool.remove_listener("/b", id));
        assert!(fixture.pool.remove_listener("/a", id));
        assert!(!fixture.pool.has_listeners("/a"));
        assert!(fixture.pool.topics().is_empty());
        assert!(!fixture.pool.remove_listener("/a", id));
    }

    #[test]
    fn test_window_keeps_message_in_effect_at_start() {
        let catalog = Catalog::new();
        catalog.add_source(Arc::new(
            MemorySource::builder("sparse")
                .message("/a", secs(1.0), "old")
                .message("/a", secs(10.0), "new")
                .build(),
        ));
        let config = LoaderConfig {
            lookbehind_ms: 1_000,
            lookahead_ms: 1_000,
            buffer_capacity: 8,
        };

        let window = load_window(&catalog, "/a", secs(5.0), &config);
        assert_eq!(window.range, TimeRange::new(secs(4.0), secs(6.0)));
        let stamps: Vec<Timestamp> = window.messages.iter().map(|message| message.stamp).collect();
        assert_eq!(stamps, vec![secs(1.0)]);
    }

    #[test]
    fn test_window_ends_before_first_message_that_did_not_fit() {
        let catalog = Catalog::new();
        let mut builder = MemorySource::builder("tight");
        for stamp in [1.0, 5.0, 6.0, 7.0] {
            builder = builder.message("/a", secs(stamp), format!("{}", stamp));
        }
        catalog.add_source(Arc::new(builder.build()));
        let config = LoaderConfig {
            lookbehind_ms: 1_000,
            lookahead_ms: 1_000,
            buffer_capacity: 2,
        };

        let window = load_window(&catalog, "/a", secs(5.5), &config);
        assert!(window.messages.len() <= 2);
        assert!(!window.range.contains(secs(6.0)));

        let mut buffer = TopicBuffer::new(config.buffer_capacity);
        buffer.fill(window.range, window.messages);
        for at in [4.5, 5.0, 5.9] {
            let expected = catalog.entry_at(secs(at), "/a").map(|entry| entry.stamp());
            assert!(buffer.covers(secs(at)));
            assert_eq!(buffer.latest_at(secs(at)).map(|message| message.stamp), expected);
        }
        assert!(!buffer.covers(secs(6.2)));
    }

    #[tokio::test]
    async fn test_listener_gets_message_past_a_full_window() {
        let config = LoaderConfig {
            lookbehind_ms: 1_000,
            lookahead_ms: 1_000,
            buffer_capacity: 2,
        };
        let fixture = fixture(&[1.0, 5.0, 6.0, 7.0], config);
        let (listener, mut receiver) = ChannelListener::new();
        fixture.pool.add_listener("/a", listener);
        assert_eq!(next_stamp(&mut receiver).await, secs(1.0));

        fixture.playback.seek(secs(5.5)).unwrap();
        assert_eq!(next_stamp(&mut receiver).await, secs(5.0));

        fixture.playback.seek(secs(6.2)).unwrap();
        assert_eq!(next_stamp(&mut receiver).await, secs(6.0));
    }
}
