//! The tracking-reliability supervisor.
//!
//! `Supervisor` owns every component and is the single handler behind the
//! command bus: `execute` maps one validated `Command` to one JSON result.
//! Timer delivery enters through `dispatch_due_timers`, which the daemon calls
//! from its dispatcher thread. Both entry points, and recovery, run one at a
//! time under a single lock.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use geowake_daemon_protocol::{
    ArmedTimerInfo, BootReason, Command, ErrorInfo, LaunchAlarmParams, Method, ProgressPayload,
    TrackingSession, PROTOCOL_VERSION,
};

use crate::actions::ActionHandler;
use crate::alarms::{AlarmService, ArmedTimer, TimerSlot};
use crate::boot::{recover, RecoveryReport};
use crate::config::{DaemonConfig, PlatformConfig};
use crate::db::Db;
use crate::fallback::{decode_request, FallbackAlarmScheduler, FallbackTrigger};
use crate::handshake::AckHandshake;
use crate::host::HostRegistry;
use crate::notifications::{alarm_notification, progress_notification, NotificationId};
use crate::platform::{
    AlarmFeedback, AppLauncher, Clock, Deferred, LaunchRequest, NotificationSurface,
};
use crate::progress_wake::ProgressWakeScheduler;
use crate::reliability::check_reliability;
use crate::session_store::SessionStore;

/// The outside world, as the supervisor sees it.
pub struct Platform {
    pub clock: Arc<dyn Clock>,
    pub alarms: Arc<dyn AlarmService>,
    pub notifier: Arc<dyn NotificationSurface>,
    pub feedback: Arc<dyn AlarmFeedback>,
    pub launcher: Arc<dyn AppLauncher>,
    pub deferred: Arc<dyn Deferred>,
}

#[derive(Debug, Serialize)]
struct SessionView {
    session: TrackingSession,
    timers: Vec<ArmedTimerInfo>,
}

pub struct Supervisor {
    store: Arc<SessionStore>,
    clock: Arc<dyn Clock>,
    alarms: Arc<dyn AlarmService>,
    notifier: Arc<dyn NotificationSurface>,
    feedback: Arc<dyn AlarmFeedback>,
    launcher: Arc<dyn AppLauncher>,
    progress_wake: Arc<ProgressWakeScheduler>,
    fallback: Arc<FallbackAlarmScheduler>,
    trigger: FallbackTrigger,
    actions: Arc<ActionHandler>,
    hosts: HostRegistry,
    platform_config: PlatformConfig,
    serial: Mutex<()>,
}

impl Supervisor {
    pub fn new(db: Arc<Db>, config: &DaemonConfig, platform: Platform) -> Self {
        let store = Arc::new(SessionStore::new(db, config.session.mirror_dirs.clone()));
        let progress_wake = Arc::new(ProgressWakeScheduler::new(
            Arc::clone(&store),
            Arc::clone(&platform.alarms),
            Arc::clone(&platform.clock),
        ));
        let fallback = Arc::new(FallbackAlarmScheduler::new(
            Arc::clone(&platform.alarms),
            Arc::clone(&platform.clock),
        ));
        let trigger = FallbackTrigger::new(
            Arc::clone(&platform.notifier),
            Arc::clone(&platform.launcher),
        );
        let actions = Arc::new(ActionHandler::new(
            Arc::clone(&store),
            Arc::clone(&platform.notifier),
            Arc::clone(&platform.feedback),
            Arc::clone(&progress_wake),
            Arc::clone(&fallback),
            AckHandshake::new(Arc::clone(&store), Arc::clone(&platform.deferred)),
        ));

        Self {
            store,
            clock: platform.clock,
            alarms: platform.alarms,
            notifier: platform.notifier,
            feedback: platform.feedback,
            launcher: platform.launcher,
            progress_wake,
            fallback,
            trigger,
            actions,
            hosts: HostRegistry::new(),
            platform_config: config.platform.clone(),
            serial: Mutex::new(()),
        }
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.serial.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn recover(&self, reason: BootReason) -> RecoveryReport {
        let _serial = self.serialize();
        self.run_recovery(reason)
    }

    fn run_recovery(&self, reason: BootReason) -> RecoveryReport {
        info!(?reason, "Running restart recovery");
        recover(reason, &self.store, &self.progress_wake)
    }

    pub fn execute(&self, command: Command) -> Result<Value, ErrorInfo> {
        let _serial = self.serialize();
        self.apply(command)
    }

    fn apply(&self, command: Command) -> Result<Value, ErrorInfo> {
        let method = command.method();
        debug!(method = method.as_str(), "Executing command");

        match command {
            Command::GetHealth => Ok(self.health()),
            Command::ScheduleFallbackAlarm(request) => {
                self.require_active(method)?;
                let outcome = self.fallback.schedule(&request).map_err(|err| {
                    ErrorInfo::for_method(method, "fallback_schedule_failed", err.to_string())
                })?;
                if outcome.degraded() {
                    warn!(
                        route_id = %request.route_id,
                        "Fallback alarm armed with degraded precision"
                    );
                }
                Ok(json!({
                    "armed": true,
                    "trigger_at_ms": outcome.trigger_at_ms,
                    "precision": outcome.precision,
                    "degraded": outcome.degraded(),
                }))
            }
            Command::CancelFallbackAlarm => {
                let cancelled = self
                    .fallback
                    .cancel()
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "cancelled": cancelled }))
            }
            Command::UpdateFallbackAlarm { threshold_seconds } => {
                match self.fallback.update(threshold_seconds).map_err(|err| {
                    ErrorInfo::for_method(method, "fallback_schedule_failed", err.to_string())
                })? {
                    Some(outcome) => Ok(json!({
                        "updated": true,
                        "trigger_at_ms": outcome.trigger_at_ms,
                        "precision": outcome.precision,
                        "degraded": outcome.degraded(),
                    })),
                    None => Ok(json!({ "updated": false })),
                }
            }
            Command::ScheduleProgressWake { interval_ms } => {
                let schedule = self.progress_wake.schedule(interval_ms).map_err(|err| {
                    ErrorInfo::for_method(method, "progress_wake_failed", err.to_string())
                })?;
                Ok(json!({
                    "interval_ms": schedule.interval_ms,
                    "trigger_at_ms": schedule.trigger_at_ms,
                    "precision": schedule.precision,
                }))
            }
            Command::CancelProgressWake => {
                self.progress_wake
                    .cancel()
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "cancelled": true }))
            }
            Command::DecorateProgressNotification(payload) => self.decorate(method, payload),
            Command::CancelProgressNotification => {
                self.notifier
                    .cancel(NotificationId::Progress)
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "cancelled": true }))
            }
            Command::StartTracking { interval_ms } => self.start_tracking(method, interval_ms),
            Command::EndTracking | Command::HandleEndTracking => {
                let report = self.actions.handle_end(self.hosts.current());
                to_value(method, &report)
            }
            Command::HandleIgnoreTracking => {
                let report = self.actions.handle_ignore(self.hosts.current());
                to_value(method, &report)
            }
            Command::AcknowledgeNativeEndTracking => {
                self.store
                    .mark_end_ack()
                    .map_err(|err| store_error(method, err))?;
                info!("Live process acknowledged end tracking");
                Ok(json!({ "acknowledged": true }))
            }
            Command::AcknowledgeNativeIgnoreTracking => {
                info!("Live process acknowledged ignore tracking");
                Ok(json!({ "acknowledged": true }))
            }
            Command::TakeEndSignal => {
                let raised = self
                    .store
                    .take_end_signal()
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "raised": raised }))
            }
            Command::SetResumePending { value } => {
                self.store
                    .set_resume_pending(value)
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "resume_pending": value }))
            }
            Command::GetSession => {
                let view = self.session_view().map_err(|err| store_error(method, err))?;
                to_value(method, &view)
            }
            Command::LaunchAlarm(params) => Ok(self.launch_alarm(params)),
            Command::StopVibration => {
                self.feedback
                    .stop()
                    .map_err(|err| store_error(method, err))?;
                Ok(json!({ "stopped": true }))
            }
            Command::CheckReliability => {
                let report =
                    check_reliability(&self.platform_config, self.alarms.as_ref(), &self.hosts);
                to_value(method, &report)
            }
            Command::BootCompleted { reason } => {
                let report = self.run_recovery(reason);
                to_value(method, &report)
            }
            Command::RegisterHost { pid } => {
                self.hosts.register(pid);
                info!(pid, "Live process registered");
                Ok(json!({ "registered": true, "pid": pid }))
            }
            Command::UnregisterHost => {
                let pid = self.hosts.unregister();
                info!(pid = ?pid, "Live process unregistered");
                Ok(json!({ "unregistered": pid.is_some(), "pid": pid }))
            }
            Command::PollHostEvents => {
                let events = self.hosts.poll_events();
                Ok(json!({ "events": events }))
            }
        }
    }

    /// Delivers every timer due at the current time. Returns how many fired.
    pub fn dispatch_due_timers(&self) -> Result<usize, String> {
        let _serial = self.serialize();
        let now_ms = self.clock.now_ms();
        let due = self.alarms.due(now_ms).map_err(|err| err.to_string())?;
        for timer in &due {
            self.fire(timer);
            // Retired after firing: a crash in between repeats the wake
            // instead of losing it.
            if let Err(err) = self.alarms.retire(timer) {
                warn!(slot = timer.slot.kind(), error = %err, "Failed to retire fired timer");
            }
        }
        Ok(due.len())
    }

    fn fire(&self, timer: &ArmedTimer) {
        info!(
            slot = timer.slot.kind(),
            trigger_at_ms = timer.trigger_at_ms,
            "Timer fired"
        );
        match timer.slot {
            TimerSlot::ProgressWake => self.progress_wake.on_fire(self.notifier.as_ref()),
            TimerSlot::FallbackAlarm => {
                let request = timer.payload.as_deref().and_then(decode_request);
                self.trigger.on_fire(request.as_ref());
            }
        }
    }

    fn health(&self) -> Value {
        let mut data = json!({
            "status": "ok",
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": PROTOCOL_VERSION,
            "host_registered": self.hosts.current().is_some(),
        });
        match self.store.is_active() {
            Ok(active) => data["tracking_active"] = json!(active),
            Err(err) => warn!(error = %err, "Failed to read tracking state for health"),
        }
        data
    }

    /// Shows nothing and keeps nothing while suppressed, so a payload from an
    /// ignored journey cannot reappear later.
    fn decorate(&self, method: Method, payload: ProgressPayload) -> Result<Value, ErrorInfo> {
        let active = self
            .store
            .is_active()
            .map_err(|err| store_error(method, err))?;
        if !active {
            debug!("No active session; progress decoration dropped");
            return Ok(json!({ "shown": false, "suppressed": false, "active": false }));
        }
        let suppressed = self
            .store
            .is_suppressed()
            .map_err(|err| store_error(method, err))?;
        if suppressed {
            debug!("Progress notification suppressed");
            return Ok(json!({ "shown": false, "suppressed": true, "active": true }));
        }

        self.store
            .set_progress_payload(&payload)
            .map_err(|err| store_error(method, err))?;
        let shown = match self.notifier.show(&progress_notification(&payload)) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to show progress notification");
                false
            }
        };
        Ok(json!({ "shown": shown, "suppressed": false, "active": true }))
    }

    /// An inactive session never holds a fallback alarm.
    fn require_active(&self, method: Method) -> Result<(), ErrorInfo> {
        let active = self
            .store
            .is_active()
            .map_err(|err| store_error(method, err))?;
        if active {
            Ok(())
        } else {
            Err(ErrorInfo::for_method(
                method,
                "tracking_inactive",
                "no tracking session is active",
            ))
        }
    }

    /// A fresh start is the only way out of suppression.
    fn start_tracking(&self, method: Method, interval_ms: Option<u64>) -> Result<Value, ErrorInfo> {
        self.store
            .set_active(true)
            .map_err(|err| store_error(method, err))?;
        self.store
            .set_suppressed(false)
            .map_err(|err| store_error(method, err))?;
        self.store
            .set_end_signal(false)
            .map_err(|err| store_error(method, err))?;
        self.store
            .clear_end_ack()
            .map_err(|err| store_error(method, err))?;

        let wake = match interval_ms {
            Some(interval_ms) => {
                let schedule = self.progress_wake.schedule(interval_ms).map_err(|err| {
                    ErrorInfo::for_method(method, "progress_wake_failed", err.to_string())
                })?;
                Some(json!({
                    "interval_ms": schedule.interval_ms,
                    "trigger_at_ms": schedule.trigger_at_ms,
                    "precision": schedule.precision,
                }))
            }
            None => None,
        };
        info!(interval_ms = ?interval_ms, "Tracking started");
        Ok(json!({ "active": true, "progress_wake": wake }))
    }

    fn launch_alarm(&self, params: LaunchAlarmParams) -> Value {
        let feedback_started = match self.feedback.start() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to start alarm feedback");
                false
            }
        };
        if let Err(err) = self
            .notifier
            .show(&alarm_notification(&params.title, &params.body))
        {
            warn!(error = %err, "Failed to show alarm notification");
        }
        let request = LaunchRequest {
            title: params.title,
            body: params.body,
            destination_name: None,
            fallback: false,
            allow_continue: params.allow_continue,
        };
        let launched = match self.launcher.launch_alarm_surface(&request) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Failed to launch alarm surface");
                false
            }
        };
        json!({ "launched": launched, "feedback_started": feedback_started })
    }

    fn session_view(&self) -> Result<SessionView, String> {
        let session = self.store.snapshot()?;
        let mut timers = Vec::new();
        for slot in [TimerSlot::FallbackAlarm, TimerSlot::ProgressWake] {
            if let Some(timer) = self.alarms.armed(slot).map_err(|err| err.to_string())? {
                timers.push(timer.info());
            }
        }
        Ok(SessionView { session, timers })
    }
}

#[cfg(test)]
impl Supervisor {
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn alarms(&self) -> &Arc<dyn AlarmService> {
        &self.alarms
    }

    pub fn progress_wake(&self) -> &Arc<ProgressWakeScheduler> {
        &self.progress_wake
    }

    pub fn fallback(&self) -> &Arc<FallbackAlarmScheduler> {
        &self.fallback
    }

    pub fn actions(&self) -> &Arc<ActionHandler> {
        &self.actions
    }

    pub fn hosts(&self) -> &HostRegistry {
        &self.hosts
    }
}

fn store_error(method: Method, err: impl std::fmt::Display) -> ErrorInfo {
    ErrorInfo::for_method(method, "store_error", err.to_string())
}

fn to_value<T: Serialize>(method: Method, value: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::for_method(
            method,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}
