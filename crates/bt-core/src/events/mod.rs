use std::sync::Arc;
use parking_lot::Mutex;
use ahash::AHashMap;

/// Engine-wide event bus for observers such as a status bar.
///
/// Handlers run synchronously on the publishing thread and must not publish
/// from inside `handle`.
pub struct EventBus {
    handlers: Arc<Mutex<AHashMap<std::any::TypeId, Vec<Box<dyn EventHandler>>>>>,
}

/// Event trait that all events must implement
pub trait Event: Send + Sync + 'static {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Handler trait for event handlers
pub trait EventHandler: Send + Sync {
    fn handle(&mut self, event: &dyn Event);
}

/// Downcast a received event to its concrete type
pub fn downcast<E: Event>(event: &dyn Event) -> Option<&E> {
    event.as_any().downcast_ref::<E>()
}

/// Events published by the engine
pub mod events {
    use super::Event;

    /// How a background task ended
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum TaskOutcome {
        /// Every message was written
        Completed { written: usize },
        /// Stopped by request; the first `written` messages are in the output
        Cancelled { written: usize },
        /// Aborted on the first read or write error
        Failed { written: usize, error: String },
    }

    /// A background task took the single-flight slot
    #[derive(Debug, Clone)]
    pub struct TaskStarted {
        pub label: String,
        pub total: usize,
    }

    /// Whole-percent progress of the running background task
    #[derive(Debug, Clone)]
    pub struct TaskProgress {
        pub label: String,
        pub percent: u8,
    }

    /// The background task released the slot
    #[derive(Debug, Clone)]
    pub struct TaskFinished {
        pub label: String,
        pub outcome: TaskOutcome,
    }

    /// A log source joined the catalog
    #[derive(Debug, Clone)]
    pub struct SourceAdded {
        pub source_name: String,
        pub topic_count: usize,
        pub message_count: usize,
    }

    /// Two sources disagree on the datatype of a topic
    #[derive(Debug, Clone)]
    pub struct DatatypeConflictDetected {
        pub topic: String,
        pub datatypes: Vec<String>,
    }

    // Implement Event trait for all event types
    macro_rules! impl_event {
        ($($t:ty),*) => {
            $(
                impl Event for $t {
                    fn as_any(&self) -> &dyn std::any::Any {
                        self
                    }
                }
            )*
        }
    }

    impl_event!(
        TaskStarted,
        TaskProgress,
        TaskFinished,
        SourceAdded,
        DatatypeConflictDetected
    );
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<E: Event>(&self, handler: Box<dyn EventHandler>) {
        let type_id = std::any::TypeId::of::<E>();
        let mut handlers = self.handlers.lock();
        handlers.entry(type_id).or_insert_with(Vec::new).push(handler);
    }

    /// Publish an event
    pub fn publish<E: Event>(&self, event: E) {
        let type_id = std::any::TypeId::of::<E>();
        let mut handlers = self.handlers.lock();

        if let Some(event_handlers) = handlers.get_mut(&type_id) {
            for handler in event_handlers.iter_mut() {
                handler.handle(&event);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper struct for creating event handlers from closures
pub struct ClosureEventHandler<F> {
    handler: F,
}

impl<F> EventHandler for ClosureEventHandler<F>
where
    F: FnMut(&dyn Event) + Send + Sync,
{
    fn handle(&mut self, event: &dyn Event) {
        (self.handler)(event);
    }
}

/// Create an event handler from a closure
pub fn handler_from_fn<F>(f: F) -> Box<dyn EventHandler>
where
    F: FnMut(&dyn Event) + Send + Sync + 'static,
{
    Box::new(ClosureEventHandler { handler: f })
}
