//! Playhead subscriber trait

use super::PlaybackContext;

/// Trait for components that need to respond to playhead movement
pub trait PlayheadSubscriber: Send + Sync {
    /// Called after the playhead moved, was reset, or the play region changed
    fn on_playhead_moved(&self, context: &PlaybackContext);
}
