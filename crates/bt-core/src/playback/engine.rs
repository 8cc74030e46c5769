//! Playback engine implementation

use super::{
    MessageTimeline, PlaybackContext, PlaybackMode, PlaybackSettings, PlayheadSubscriber,
    TimeRange, Timestamp,
};
use crate::PlaybackError;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

/// Playhead and speed, guarded together so a seek never tears a tick
#[derive(Debug, Clone)]
struct PlaybackState {
    bounds: Option<TimeRange>,
    selection: Option<TimeRange>,
    playhead: Option<Timestamp>,
    speed: f64,
    play_all: bool,
    wrap: bool,
    stick_to_end: bool,
    min_speed: f64,
    max_speed: f64,
    locked_step_cap: Duration,

    // Tick memo, cleared on every discontinuity
    last_frame: Option<Instant>,
    last_playhead: Option<Timestamp>,
    desired_playhead: Option<Timestamp>,
}

impl PlaybackState {
    fn new(settings: &PlaybackSettings) -> Self {
        Self {
            bounds: None,
            selection: None,
            playhead: None,
            speed: 0.0,
            play_all: false,
            wrap: settings.wrap,
            stick_to_end: false,
            min_speed: settings.min_speed,
            max_speed: settings.max_speed,
            locked_step_cap: settings.locked_step_cap,
            last_frame: None,
            last_playhead: None,
            desired_playhead: None,
        }
    }

    fn clear_memo(&mut self) {
        self.last_frame = None;
        self.last_playhead = None;
        self.desired_playhead = None;
    }

    /// Range fixed-rate playback is bounded by
    fn play_region(&self) -> Option<TimeRange> {
        self.selection.or(self.bounds)
    }

    /// Range the playhead may be placed in
    fn confinement(&self) -> Option<TimeRange> {
        if self.play_all {
            self.bounds
        } else {
            self.play_region()
        }
    }

    fn mode(&self) -> PlaybackMode {
        if self.play_all {
            PlaybackMode::LockedToNextMessage
        } else {
            PlaybackMode::FixedRate
        }
    }

    fn reset_timeline(&mut self) {
        self.selection = None;
        self.playhead = self.bounds.map(|bounds| bounds.start);
        self.stick_to_end = false;
        self.clear_memo();
    }

    fn set_speed(&mut self, speed: f64) {
        if speed == self.speed {
            return;
        }

        self.speed = if speed > 0.0 {
            speed.clamp(self.min_speed, self.max_speed)
        } else if speed < 0.0 {
            speed.clamp(-self.max_speed, -self.min_speed)
        } else {
            0.0
        };

        if self.speed < 1.0 {
            self.stick_to_end = false;
        }
    }

    fn place_playhead(&mut self, stamp: Timestamp) -> Option<Timestamp> {
        let region = self.confinement()?;
        let placed = region.clamp(stamp);
        self.playhead = Some(placed);
        self.stick_to_end = false;
        self.clear_memo();
        Some(placed)
    }

    fn step(&mut self, now: Instant, timeline: &dyn MessageTimeline) -> bool {
        if self.speed == 0.0 {
            self.clear_memo();
            return false;
        }

        // An external seek or mode switch happened since the last tick
        if self.playhead != self.last_playhead {
            self.clear_memo();
        }

        if self.play_all {
            self.step_next_message(now, timeline)
        } else {
            self.step_fixed(now)
        }
    }

    fn step_fixed(&mut self, now: Instant) -> bool {
        let (Some(playhead), Some(region)) = (self.playhead, self.play_region()) else {
            self.clear_memo();
            return false;
        };

        let mut moved = false;
        if let Some(last_frame) = self.last_frame {
            let new_playhead = if self.stick_to_end {
                region.end
            } else {
                self.advance_fixed(playhead, now.saturating_duration_since(last_frame), region)
            };
            moved = new_playhead != playhead;
            self.playhead = Some(new_playhead);
        }

        self.last_frame = Some(now);
        self.last_playhead = self.playhead;
        moved
    }

    fn advance_fixed(&mut self, playhead: Timestamp, elapsed: Duration, region: TimeRange) -> Timestamp {
        let delta = (elapsed.as_secs_f64() * self.speed * 1e9).round() as i64;
        let candidate = playhead.saturating_offset(delta);

        if candidate > region.end {
            if self.wrap {
                if self.speed > 0.0 {
                    wrap_forward(region, candidate.nanos_since(region.end))
                } else {
                    region.end
                }
            } else {
                if self.speed > 0.0 {
                    self.stick_to_end = true;
                }
                region.end
            }
        } else if candidate < region.start {
            if self.wrap && self.speed < 0.0 {
                wrap_backward(region, region.start.nanos_since(candidate))
            } else {
                region.start
            }
        } else {
            candidate
        }
    }

    /// Locked playback: the playhead only ever takes message times, never the virtual `desired` clock
    fn step_next_message(&mut self, now: Instant, timeline: &dyn MessageTimeline) -> bool {
        let Some(playhead) = self.playhead else {
            self.clear_memo();
            return false;
        };
        if self.speed <= 0.0 {
            self.clear_memo();
            return false;
        }

        let mut moved = false;
        if let Some(last_frame) = self.last_frame {
            let desired = match self.desired_playhead {
                None => playhead,
                Some(desired) => {
                    let delta = now.saturating_duration_since(last_frame).min(self.locked_step_cap);
                    desired.saturating_add(delta)
                }
            };
            self.desired_playhead = Some(desired);

            // The playhead only ever lands on recorded messages; it waits on
            // the current one until the virtual clock reaches the next
            if let Some(next) = timeline.next_message_time(playhead) {
                if next <= desired {
                    if next < playhead {
                        // Wrapped back to the start: restart the virtual clock there
                        self.desired_playhead = Some(next);
                    }
                    moved = next != playhead;
                    self.playhead = Some(next);
                }
            }
        }

        self.last_frame = Some(now);
        self.last_playhead = self.playhead;
        moved
    }

    fn context(&self) -> PlaybackContext {
        PlaybackContext {
            playhead: self.playhead,
            speed: self.speed,
            mode: self.mode(),
            bounds: self.bounds,
            selection: self.selection,
            play_region: self.play_region(),
            wrap: self.wrap,
            stick_to_end: self.stick_to_end,
        }
    }
}

fn wrap_forward(region: TimeRange, overshoot: i64) -> Timestamp {
    let span = region.span_nanos();
    if span <= 0 {
        return region.start;
    }
    region.start.saturating_offset(overshoot % span)
}

fn wrap_backward(region: TimeRange, undershoot: i64) -> Timestamp {
    let span = region.span_nanos();
    if span <= 0 {
        return region.end;
    }
    region.end.saturating_offset(-(undershoot % span))
}

/// The shared playhead, speed and play region, plus the tick state machine
pub struct PlaybackEngine {
    state: Arc<Mutex<PlaybackState>>,
    subscribers: Arc<RwLock<Vec<Weak<dyn PlayheadSubscriber>>>>,
}

impl PlaybackEngine {
    /// Create a new playback engine with nothing loaded
    pub fn new(settings: PlaybackSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlaybackState::new(&settings))),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Update the timeline extent after the source set changed.
    ///
    /// The first non-empty extent resets the timeline: the selection is
    /// cleared and the playhead goes to the start.
    pub fn set_bounds(&self, bounds: Option<TimeRange>) {
        let mut state = self.state.lock();
        let was_empty = state.bounds.is_none();
        state.bounds = bounds;

        match bounds {
            None => {
                state.selection = None;
                state.playhead = None;
                state.clear_memo();
            }
            Some(_) if was_empty || state.playhead.is_none() => state.reset_timeline(),
            Some(bounds) => {
                state.selection = state.selection.and_then(|s| s.intersection(&bounds));
                if let (Some(playhead), Some(region)) = (state.playhead, state.confinement()) {
                    state.playhead = Some(region.clamp(playhead));
                }
            }
        }

        drop(state);
        self.notify_subscribers();
    }

    /// Clear the selection and move the playhead to the timeline start
    pub fn reset_timeline(&self) {
        self.state.lock().reset_timeline();
        self.notify_subscribers();
    }

    /// Advance the playhead by one scheduler tick; returns whether it moved
    pub fn tick(&self, now: Instant, timeline: &dyn MessageTimeline) -> bool {
        let moved = self.state.lock().step(now, timeline);
        if moved {
            self.notify_subscribers();
        }
        moved
    }

    /// Move the playhead, clamped into the region it is confined to
    pub fn seek(&self, stamp: Timestamp) -> Result<Timestamp, PlaybackError> {
        let placed = self
            .state
            .lock()
            .place_playhead(stamp)
            .ok_or(PlaybackError::EmptyTimeline)?;
        debug!(playhead = %placed, "seek");
        self.notify_subscribers();
        Ok(placed)
    }

    pub fn playhead(&self) -> Option<Timestamp> {
        self.state.lock().playhead
    }

    /// Restrict playback to a sub-range, or restore the full timeline with `None`
    pub fn set_selection(&self, selection: Option<(Timestamp, Timestamp)>) -> Result<(), PlaybackError> {
        let mut state = self.state.lock();
        let bounds = state.bounds.ok_or(PlaybackError::EmptyTimeline)?;

        state.selection = match selection {
            None => None,
            Some((start, end)) => {
                let requested = TimeRange::new(start, end);
                Some(requested.intersection(&bounds).ok_or(
                    PlaybackError::SelectionOutsideTimeline {
                        start: requested.start,
                        end: requested.end,
                    },
                )?)
            }
        };

        if let (Some(playhead), Some(region)) = (state.playhead, state.confinement()) {
            state.playhead = Some(region.clamp(playhead));
        }
        state.clear_memo();

        drop(state);
        self.notify_subscribers();
        Ok(())
    }

    pub fn play_region(&self) -> Option<TimeRange> {
        self.state.lock().play_region()
    }

    pub fn speed(&self) -> f64 {
        self.state.lock().speed
    }

    /// Set the play speed; returns the value actually stored after clamping
    pub fn set_speed(&self, speed: f64) -> f64 {
        let mut state = self.state.lock();
        state.set_speed(speed);
        state.speed
    }

    pub fn toggle_play(&self) -> f64 {
        let mut state = self.state.lock();
        let speed = if state.speed != 0.0 { 0.0 } else { 1.0 };
        state.set_speed(speed);
        state.speed
    }

    pub fn play(&self) -> f64 {
        self.set_speed(1.0)
    }

    pub fn stop(&self) -> f64 {
        self.set_speed(0.0)
    }

    /// Play backwards faster, or slow down when currently moving forwards
    pub fn rewind(&self) -> f64 {
        let mut state = self.state.lock();
        let speed = if state.speed < 0.0 {
            state.speed * 2.0
        } else if state.speed == 0.0 {
            -1.0
        } else {
            state.speed * 0.5
        };
        state.set_speed(speed);
        state.speed
    }

    /// Play forwards faster, or slow down when currently moving backwards
    pub fn fast_forward(&self) -> f64 {
        let mut state = self.state.lock();
        let speed = if state.speed > 0.0 {
            state.speed * 2.0
        } else if state.speed == 0.0 {
            2.0
        } else {
            state.speed * 0.5
        };
        state.set_speed(speed);
        state.speed
    }

    pub fn jump_to_start(&self) -> Result<Timestamp, PlaybackError> {
        let start = self.play_region().ok_or(PlaybackError::EmptyTimeline)?.start;
        self.seek(start)
    }

    pub fn jump_to_end(&self) -> Result<Timestamp, PlaybackError> {
        let end = self.play_region().ok_or(PlaybackError::EmptyTimeline)?.end;
        self.seek(end)
    }

    pub fn play_all(&self) -> bool {
        self.state.lock().play_all
    }

    /// Switch between fixed-rate (`false`) and locked-to-next-message (`true`) playback
    pub fn set_play_all(&self, play_all: bool) {
        let mut state = self.state.lock();
        if state.play_all == play_all {
            return;
        }
        state.play_all = play_all;
        state.clear_memo();
    }

    pub fn toggle_play_all(&self) {
        let play_all = !self.play_all();
        self.set_play_all(play_all);
    }

    /// Confining the playhead to the selection means fixed-rate playback
    pub fn set_confine_playhead(&self, confine_to_selection: bool) {
        self.set_play_all(!confine_to_selection);
    }

    pub fn wrap(&self) -> bool {
        self.state.lock().wrap
    }

    pub fn set_wrap(&self, wrap: bool) {
        self.state.lock().wrap = wrap;
    }

    pub fn stick_to_end(&self) -> bool {
        self.state.lock().stick_to_end
    }

    /// Get current playback context
    pub fn context(&self) -> PlaybackContext {
        self.state.lock().context()
    }

    /// Add a subscriber; only a weak reference is kept
    pub fn add_subscriber(&self, subscriber: Arc<dyn PlayheadSubscriber>) {
        let mut subscribers = self.subscribers.write();
        subscribers.push(Arc::downgrade(&subscriber));
    }

    /// Notify all subscribers of a playhead change
    fn notify_subscribers(&self) {
        let context = self.context();
        let mut subscribers = self.subscribers.write();

        // Remove any dead weak references
        subscribers.retain(|weak| weak.strong_count() > 0);

        for weak in subscribers.iter() {
            if let Some(subscriber) = weak.upgrade() {
                subscriber.on_playhead_moved(&context);
            }
        }
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new(PlaybackSettings::default())
    }
}
