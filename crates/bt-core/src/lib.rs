//! Core timeline abstractions for bag playback
//!
//! This crate provides the timestamp types, the playback state machine with
//! its tick scheduler, and the event bus used to observe background tasks.

pub mod events;
pub mod playback;

use thiserror::Error;

// Re-export commonly used types
pub use events::EventBus;
pub use playback::{
    MessageTimeline, PlaybackContext, PlaybackEngine, PlaybackMode, PlaybackSettings,
    PlayheadSubscriber, Scheduler, TimeRange, Timestamp, MAX_PLAY_SPEED, MIN_PLAY_SPEED,
};

/// Errors raised by playhead operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no sources loaded, the timeline is empty")]
    EmptyTimeline,

    #[error("selection {start}..{end} lies outside the timeline")]
    SelectionOutsideTimeline { start: Timestamp, end: Timestamp },
}
