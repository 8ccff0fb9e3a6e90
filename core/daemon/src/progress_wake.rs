//! Recurring progress wake.
//!
//! Recurrence is a chain of one-shot timers: every firing re-arms the next
//! one from the persisted interval, so cancelling the interval ends the chain
//! at the next firing at the latest.

use std::sync::Arc;
use tracing::{debug, info, warn};

use geowake_daemon_protocol::Precision;

use crate::alarms::{arm_with_degrade, AlarmError, AlarmService, TimerSlot};
use crate::notifications::{progress_notification, Notification};
use crate::platform::{Clock, NotificationSurface};
use crate::session_store::SessionStore;

pub const MIN_WAKE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum ProgressWakeError {
    #[error("failed to persist wake interval: {0}")]
    Store(String),
    #[error(transparent)]
    Alarm(#[from] AlarmError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeSchedule {
    pub interval_ms: u64,
    pub trigger_at_ms: i64,
    pub precision: Precision,
}

pub fn clamp_interval(interval_ms: u64) -> u64 {
    interval_ms.max(MIN_WAKE_INTERVAL_MS)
}

pub struct ProgressWakeScheduler {
    store: Arc<SessionStore>,
    alarms: Arc<dyn AlarmService>,
    clock: Arc<dyn Clock>,
}

impl ProgressWakeScheduler {
    pub fn new(
        store: Arc<SessionStore>,
        alarms: Arc<dyn AlarmService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            alarms,
            clock,
        }
    }

    pub fn schedule(&self, interval_ms: u64) -> Result<WakeSchedule, ProgressWakeError> {
        let interval_ms = clamp_interval(interval_ms);
        self.store
            .set_wake_interval_ms(interval_ms)
            .map_err(ProgressWakeError::Store)?;
        self.arm(interval_ms)
    }

    /// Clears the interval and the armed timer. Both are attempted.
    pub fn cancel(&self) -> Result<(), String> {
        let cleared = self.store.clear_wake_interval();
        let cancelled = self
            .alarms
            .cancel(TimerSlot::ProgressWake)
            .map_err(|err| err.to_string());
        if let Ok(true) = cancelled {
            debug!("Progress wake timer cancelled");
        }
        match (cleared, cancelled) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(err), Ok(_)) | (Ok(()), Err(err)) => Err(err),
            (Err(store_err), Err(alarm_err)) => Err(format!("{}; {}", store_err, alarm_err)),
        }
    }

    /// Re-arms from the persisted interval; `None` when no interval is set.
    pub fn reschedule(&self) -> Result<Option<WakeSchedule>, ProgressWakeError> {
        let interval_ms = match self
            .store
            .wake_interval_ms()
            .map_err(ProgressWakeError::Store)?
        {
            Some(interval_ms) => interval_ms,
            None => {
                debug!("No persisted wake interval; progress wake chain ends");
                return Ok(None);
            }
        };
        self.arm(clamp_interval(interval_ms)).map(Some)
    }

    /// Re-surfaces the cached progress notification, then keeps the chain
    /// going. Suppression is checked now, not when the timer was armed.
    pub fn on_fire(&self, notifier: &dyn NotificationSurface) {
        match self.cached_notification() {
            Ok(Some(notification)) => {
                if let Err(err) = notifier.show(&notification) {
                    warn!(error = %err, "Failed to re-surface progress notification");
                }
            }
            Ok(None) => debug!("Progress wake fired with nothing to show"),
            Err(err) => warn!(error = %err, "Failed to read session on progress wake"),
        }

        if let Err(err) = self.reschedule() {
            warn!(error = %err, "Failed to re-arm progress wake");
        }
    }

    fn cached_notification(&self) -> Result<Option<Notification>, String> {
        if self.store.is_suppressed()? {
            return Ok(None);
        }
        Ok(self
            .store
            .progress_payload()?
            .map(|payload| progress_notification(&payload)))
    }

    fn arm(&self, interval_ms: u64) -> Result<WakeSchedule, ProgressWakeError> {
        let trigger_at_ms = self
            .clock
            .now_ms()
            .saturating_add(i64::try_from(interval_ms).unwrap_or(i64::MAX));
        let precision = arm_with_degrade(
            self.alarms.as_ref(),
            TimerSlot::ProgressWake,
            trigger_at_ms,
            None,
        )?;
        info!(
            interval_ms,
            trigger_at_ms,
            precision = precision.as_str(),
            "Progress wake armed"
        );
        Ok(WakeSchedule {
            interval_ms,
            trigger_at_ms,
            precision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FixedClock, Harness, RecordingNotifier};
    use geowake_daemon_protocol::ProgressPayload;

    #[test]
    fn short_interval_is_clamped_to_floor() {
        let harness = Harness::new();
        let schedule = harness.progress_wake.schedule(1_000).expect("schedule");
        assert_eq!(schedule.interval_ms, 60_000);
        assert_eq!(
            harness.store.wake_interval_ms().expect("interval"),
            Some(60_000)
        );
        let armed = harness
            .alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .expect("timer present");
        assert_eq!(armed.trigger_at_ms, FixedClock::START_MS + 60_000);
    }

    #[test]
    fn cancel_is_idempotent() {
        let harness = Harness::new();
        harness.progress_wake.cancel().expect("cancel unarmed");
        harness.progress_wake.schedule(120_000).expect("schedule");
        harness.progress_wake.cancel().expect("cancel");
        harness.progress_wake.cancel().expect("cancel again");

        assert_eq!(harness.store.wake_interval_ms().expect("interval"), None);
        assert!(harness
            .alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .is_none());
    }

    #[test]
    fn rescheduling_twice_keeps_a_single_timer() {
        let harness = Harness::new();
        harness.progress_wake.schedule(90_000).expect("schedule");
        harness.clock.advance_ms(5_000);
        harness.progress_wake.reschedule().expect("reschedule");

        let timers = harness.alarms.due(i64::MAX).expect("due");
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].trigger_at_ms, FixedClock::START_MS + 95_000);
    }

    #[test]
    fn reschedule_without_interval_arms_nothing() {
        let harness = Harness::new();
        assert_eq!(harness.progress_wake.reschedule().expect("reschedule"), None);
        assert!(harness.alarms.due(i64::MAX).expect("due").is_empty());
    }

    #[test]
    fn fire_shows_cached_payload_and_rearms() {
        let harness = Harness::new();
        harness.progress_wake.schedule(60_000).expect("schedule");
        harness
            .store
            .set_progress_payload(&ProgressPayload::new("To Central Station", "2 km", 0.8))
            .expect("payload");

        let notifier = RecordingNotifier::default();
        harness.clock.advance_ms(60_000);
        harness.progress_wake.on_fire(&notifier);

        let shown = notifier.shown();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].title, "To Central Station");
        let armed = harness
            .alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .expect("timer present");
        assert_eq!(armed.trigger_at_ms, FixedClock::START_MS + 120_000);
    }

    #[test]
    fn fire_while_suppressed_shows_nothing_but_keeps_cadence() {
        let harness = Harness::new();
        harness.progress_wake.schedule(60_000).expect("schedule");
        harness
            .store
            .set_progress_payload(&ProgressPayload::new("t", "s", 0.1))
            .expect("payload");
        harness.store.set_suppressed(true).expect("suppress");

        let notifier = RecordingNotifier::default();
        harness.progress_wake.on_fire(&notifier);

        assert!(notifier.shown().is_empty());
        assert!(harness
            .alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .is_some());
    }
}
