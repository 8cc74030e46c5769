//! Fixed-period driver for [`PlaybackEngine::tick`]

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{MessageTimeline, PlaybackEngine};

/// Runs playhead ticks on a tokio task until stopped or dropped.
///
/// Ticks are issued sequentially from a single task, so at most one is in
/// flight. A tick only touches the playback lock and the catalog's in-memory
/// index; payload reads happen on the topic loaders.
pub struct Scheduler {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start ticking `engine` every `period` on the given runtime
    pub fn spawn(
        engine: Arc<PlaybackEngine>,
        timeline: Arc<dyn MessageTimeline>,
        period: Duration,
        runtime: &Handle,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = period.max(Duration::from_millis(1));

        let task = runtime.spawn(async move {
            info!(period_ms = period.as_millis() as u64, "playback scheduler started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        engine.tick(Instant::now().into_std(), timeline.as_ref());
                    }
                }
            }
            debug!("playback scheduler stopped");
        });

        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop ticking; the task exits at its next wake-up
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{TimeRange, Timestamp};

    struct Empty {
        bounds: TimeRange,
    }

    impl MessageTimeline for Empty {
        fn bounds(&self) -> Option<TimeRange> {
            Some(self.bounds)
        }

        fn message_time_after(&self, _stamp: Timestamp) -> Option<Timestamp> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_advances_playhead_in_real_time() {
        let timeline = Arc::new(Empty {
            bounds: TimeRange::new(Timestamp::ZERO, Timestamp::from_secs_f64(100.0)),
        });
        let engine = Arc::new(PlaybackEngine::default());
        engine.set_bounds(timeline.bounds());
        engine.play();

        let mut scheduler = Scheduler::spawn(
            engine.clone(),
            timeline,
            Duration::from_millis(10),
            &Handle::current(),
        );
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let playhead = engine.playhead().unwrap().as_secs_f64();
        assert!((1.9..=2.0).contains(&playhead), "playhead at {playhead}");

        scheduler.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped_at = engine.playhead();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.playhead(), stopped_at);
    }
}
