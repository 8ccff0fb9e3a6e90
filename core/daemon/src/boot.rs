//! Restores timer infrastructure after a device or daemon restart.
//!
//! Recovery only looks at the persisted session. It never recomputes progress
//! and never raises the alarm UI; the live process reconciles the cached
//! payload and the resume flag when it next starts.

use serde::Serialize;
use tracing::{debug, info, warn};

use geowake_daemon_protocol::{BootReason, DEFAULT_WAKE_INTERVAL_MS};

use crate::progress_wake::ProgressWakeScheduler;
use crate::session_store::SessionStore;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub tracking_active: bool,
    pub progress_wake_rearmed: bool,
    pub cached_payload_present: bool,
    pub errors: Vec<String>,
}

pub fn recover(
    reason: BootReason,
    store: &SessionStore,
    progress_wake: &ProgressWakeScheduler,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    report.tracking_active = match store.is_active() {
        Ok(active) => active,
        Err(err) => {
            warn!(?reason, error = %err, "Boot recovery could not read tracking state");
            report.errors.push(err);
            return report;
        }
    };
    if !report.tracking_active {
        debug!(?reason, "No active tracking session; nothing to recover");
        return report;
    }

    match progress_wake.schedule(DEFAULT_WAKE_INTERVAL_MS) {
        Ok(schedule) => {
            report.progress_wake_rearmed = true;
            info!(
                ?reason,
                trigger_at_ms = schedule.trigger_at_ms,
                "Progress wake re-armed after restart"
            );
        }
        Err(err) => {
            warn!(?reason, error = %err, "Failed to re-arm progress wake after restart");
            report.errors.push(err.to_string());
        }
    }

    match store.progress_payload() {
        Ok(payload) => report.cached_payload_present = payload.is_some(),
        Err(err) => {
            warn!(?reason, error = %err, "Failed to inspect cached progress payload");
            report.errors.push(err);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::TimerSlot;
    use crate::test_support::{FixedClock, Harness};
    use geowake_daemon_protocol::ProgressPayload;

    #[test]
    fn active_session_rearms_progress_wake_at_default_interval() {
        let harness = Harness::new();
        harness.store.set_active(true).expect("active");

        let report = recover(BootReason::Boot, &harness.store, &harness.progress_wake);

        assert!(report.progress_wake_rearmed);
        assert!(report.errors.is_empty());
        assert_eq!(
            harness.store.wake_interval_ms().expect("interval"),
            Some(DEFAULT_WAKE_INTERVAL_MS)
        );
        let armed = harness
            .alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .expect("timer present");
        assert_eq!(
            armed.trigger_at_ms,
            FixedClock::START_MS + DEFAULT_WAKE_INTERVAL_MS as i64
        );
    }

    #[test]
    fn inactive_session_arms_nothing() {
        let harness = Harness::new();

        let report = recover(BootReason::Quickboot, &harness.store, &harness.progress_wake);

        assert_eq!(report, RecoveryReport::default());
        assert!(harness.alarms.due(i64::MAX).expect("due").is_empty());
    }

    #[test]
    fn rearm_failure_does_not_stop_recovery() {
        let harness = Harness::with_failing_alarms();
        harness.store.set_active(true).expect("active");
        harness
            .store
            .set_progress_payload(&ProgressPayload::new("t", "s", 0.3))
            .expect("payload");

        let report = recover(
            BootReason::PackageReplaced,
            &harness.store,
            &harness.progress_wake,
        );

        assert!(!report.progress_wake_rearmed);
        assert_eq!(report.errors.len(), 1);
        assert!(report.cached_payload_present);
    }

    #[test]
    fn recovery_never_shows_notifications() {
        let harness = Harness::new();
        harness.store.set_active(true).expect("active");
        harness
            .store
            .set_progress_payload(&ProgressPayload::new("t", "s", 0.3))
            .expect("payload");

        recover(BootReason::Boot, &harness.store, &harness.progress_wake);

        assert!(harness.notifier.shown().is_empty());
        assert!(harness.launcher.launches().is_empty());
    }
}
