//! "End" and "Ignore", the two notification actions.
//!
//! Both handlers are idempotent and best-effort: each step is attempted even
//! when an earlier one failed, and failures are logged rather than returned.
//! The returned report lists the steps that did not complete.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use geowake_daemon_protocol::{HostEvent, SOURCE_NOTIFICATION_ACTION};

use crate::fallback::FallbackAlarmScheduler;
use crate::handshake::AckHandshake;
use crate::host::HostSession;
use crate::notifications::NotificationId;
use crate::platform::{AlarmFeedback, NotificationSurface};
use crate::progress_wake::ProgressWakeScheduler;
use crate::session_store::SessionStore;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ActionReport {
    pub host_notified: bool,
    pub failed_steps: Vec<String>,
}

impl ActionReport {
    fn step(&mut self, step: &str, result: Result<(), String>) {
        if let Err(err) = result {
            warn!(step, error = %err, "Notification action step failed");
            self.failed_steps.push(step.to_string());
        }
    }
}

pub struct ActionHandler {
    store: Arc<SessionStore>,
    notifier: Arc<dyn NotificationSurface>,
    feedback: Arc<dyn AlarmFeedback>,
    progress_wake: Arc<ProgressWakeScheduler>,
    fallback: Arc<FallbackAlarmScheduler>,
    handshake: AckHandshake,
}

impl ActionHandler {
    pub fn new(
        store: Arc<SessionStore>,
        notifier: Arc<dyn NotificationSurface>,
        feedback: Arc<dyn AlarmFeedback>,
        progress_wake: Arc<ProgressWakeScheduler>,
        fallback: Arc<FallbackAlarmScheduler>,
        handshake: AckHandshake,
    ) -> Self {
        Self {
            store,
            notifier,
            feedback,
            progress_wake,
            fallback,
            handshake,
        }
    }

    /// Tears the session down and asks the live process to stop, forcing it
    /// after the handshake timeout. `host` is whatever is registered now.
    pub fn handle_end(&self, host: Option<Arc<dyn HostSession>>) -> ActionReport {
        info!(host_pid = host.as_ref().and_then(|host| host.pid()), "Handling end tracking");
        let mut report = ActionReport::default();

        report.step("raise_end_signal", self.store.set_end_signal(true));
        report.step("suppress_progress", self.store.set_suppressed(true));
        report.step("clear_session", self.store.clear_session_fields());
        for id in [
            NotificationId::Progress,
            NotificationId::Alarm,
            NotificationId::FallbackAlarm,
        ] {
            report.step("cancel_notification", self.notifier.cancel(id));
        }
        report.step("stop_feedback", self.feedback.stop());
        report.step("cancel_progress_wake", self.progress_wake.cancel());
        report.step(
            "cancel_fallback_alarm",
            self.fallback.cancel().map(|_| ()).map_err(|err| err.to_string()),
        );
        report.step("clear_end_ack", self.store.clear_end_ack());

        report.host_notified = notify_host(
            host.as_deref(),
            HostEvent::NativeEndTrackingTriggered {
                source: SOURCE_NOTIFICATION_ACTION.to_string(),
            },
        );

        self.handshake.start(host);
        report
    }

    /// Hides progress without ending tracking. The session, the mirrored
    /// files and the fallback alarm are left as they are.
    pub fn handle_ignore(&self, host: Option<Arc<dyn HostSession>>) -> ActionReport {
        info!("Handling ignore tracking");
        let mut report = ActionReport::default();

        report.step("suppress_progress", self.store.set_suppressed(true));
        report.step("clear_progress_payload", self.store.clear_progress_payload());
        report.step(
            "cancel_notification",
            self.notifier.cancel(NotificationId::Progress),
        );
        report.step("cancel_progress_wake", self.progress_wake.cancel());

        report.host_notified = notify_host(
            host.as_deref(),
            HostEvent::NativeIgnoreTrackingTriggered {
                source: SOURCE_NOTIFICATION_ACTION.to_string(),
            },
        );
        report
    }
}

fn notify_host(host: Option<&dyn HostSession>, event: HostEvent) -> bool {
    match host {
        Some(host) => {
            let delivered = host.deliver(event.clone());
            if !delivered {
                warn!(event = event.name(), "Failed to deliver event to live process");
            }
            delivered
        }
        None => {
            warn!(event = event.name(), "Host not ready; event not delivered");
            false
        }
    }
}
