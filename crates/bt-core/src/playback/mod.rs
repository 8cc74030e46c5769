use std::time::Duration;

use serde::{Deserialize, Serialize};

mod engine;
mod position;
mod scheduler;
mod subscriber;

pub use engine::PlaybackEngine;
pub use position::{TimeRange, Timestamp};
pub use scheduler::Scheduler;
pub use subscriber::PlayheadSubscriber;

/// Fastest supported play speed (1024x)
pub const MAX_PLAY_SPEED: f64 = 1024.0;
/// Slowest non-zero play speed (1/1024x)
pub const MIN_PLAY_SPEED: f64 = 1.0 / 1024.0;
/// Largest wall-clock step the locked mode applies per tick
pub const LOCKED_STEP_CAP: Duration = Duration::from_millis(100);

/// Playback modes supported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaybackMode {
    /// Advance by `elapsed * speed`, bounded by the play region
    FixedRate,
    /// Snap to each recorded message in turn, paced by wall-clock time
    LockedToNextMessage,
}

/// Read access to the merged message timeline, implemented by the catalog
pub trait MessageTimeline: Send + Sync {
    /// Start and end of the merged timeline, `None` while nothing is loaded
    fn bounds(&self) -> Option<TimeRange>;

    /// Timestamp of the earliest message strictly after `stamp`, over every topic
    fn message_time_after(&self, stamp: Timestamp) -> Option<Timestamp>;

    /// Where locked playback goes next: the following message, or the
    /// timeline start once the last message has been passed
    fn next_message_time(&self, playhead: Timestamp) -> Option<Timestamp> {
        self.message_time_after(playhead)
            .or_else(|| self.bounds().map(|bounds| bounds.start))
    }
}

/// Tunables for the playback state machine
#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub min_speed: f64,
    pub max_speed: f64,
    pub wrap: bool,
    pub locked_step_cap: Duration,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            min_speed: MIN_PLAY_SPEED,
            max_speed: MAX_PLAY_SPEED,
            wrap: true,
            locked_step_cap: LOCKED_STEP_CAP,
        }
    }
}

/// Snapshot handed to subscribers and callers
#[derive(Debug, Clone)]
pub struct PlaybackContext {
    pub playhead: Option<Timestamp>,
    pub speed: f64,
    pub mode: PlaybackMode,
    pub bounds: Option<TimeRange>,
    pub selection: Option<TimeRange>,
    pub play_region: Option<TimeRange>,
    pub wrap: bool,
    pub stick_to_end: bool,
}

impl PlaybackContext {
    pub fn is_paused(&self) -> bool {
        self.speed == 0.0
    }
}
