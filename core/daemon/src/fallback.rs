//! The killed-app safety net: one durable alarm, and what happens when it fires.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use geowake_daemon_protocol::{FallbackAlarmRequest, Precision, DEFAULT_ALARM_TITLE};

use crate::alarms::{arm_with_degrade, AlarmError, AlarmService, TimerSlot};
use crate::notifications::{display_destination, fallback_alarm_notification};
use crate::platform::{AppLauncher, Clock, LaunchRequest, NotificationSurface};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub trigger_at_ms: i64,
    pub precision: Precision,
}

impl ScheduleOutcome {
    pub fn degraded(&self) -> bool {
        self.precision == Precision::Inexact
    }
}

pub struct FallbackAlarmScheduler {
    alarms: Arc<dyn AlarmService>,
    clock: Arc<dyn Clock>,
}

impl FallbackAlarmScheduler {
    pub fn new(alarms: Arc<dyn AlarmService>, clock: Arc<dyn Clock>) -> Self {
        Self { alarms, clock }
    }

    /// Arms the fallback slot with the request embedded as payload, replacing
    /// any previous fallback. Errors are returned, never swallowed.
    pub fn schedule(&self, request: &FallbackAlarmRequest) -> Result<ScheduleOutcome, AlarmError> {
        let payload = serde_json::to_string(request)
            .map_err(|err| AlarmError::Store(format!("Failed to encode alarm payload: {}", err)))?;
        let precision = arm_with_degrade(
            self.alarms.as_ref(),
            TimerSlot::FallbackAlarm,
            request.trigger_time_epoch_ms,
            Some(payload),
        )?;
        info!(
            route_id = %request.route_id,
            trigger_at_ms = request.trigger_time_epoch_ms,
            trigger_at = ?request.trigger_at(),
            precision = precision.as_str(),
            "Fallback alarm armed"
        );
        Ok(ScheduleOutcome {
            trigger_at_ms: request.trigger_time_epoch_ms,
            precision,
        })
    }

    pub fn cancel(&self) -> Result<bool, AlarmError> {
        let removed = self.alarms.cancel(TimerSlot::FallbackAlarm)?;
        if removed {
            info!("Fallback alarm cancelled");
        } else {
            debug!("No fallback alarm armed; cancel is a no-op");
        }
        Ok(removed)
    }

    /// Moves the armed fallback to `now + threshold_seconds`, keeping its
    /// payload. Returns `None` when nothing is armed.
    pub fn update(&self, threshold_seconds: u64) -> Result<Option<ScheduleOutcome>, AlarmError> {
        let armed = match self.alarms.armed(TimerSlot::FallbackAlarm)? {
            Some(armed) => armed,
            None => {
                debug!("No fallback alarm armed; nothing to update");
                return Ok(None);
            }
        };
        let offset_ms = i64::try_from(threshold_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        let trigger_at_ms = self.clock.now_ms().saturating_add(offset_ms);

        // Keep the embedded request consistent with the new trigger time.
        let payload = match armed.payload.as_deref().map(decode_request) {
            Some(Some(mut request)) => {
                request.trigger_time_epoch_ms = trigger_at_ms;
                serde_json::to_string(&request).ok()
            }
            _ => armed.payload.clone(),
        };

        let precision = arm_with_degrade(
            self.alarms.as_ref(),
            TimerSlot::FallbackAlarm,
            trigger_at_ms,
            payload,
        )?;
        info!(threshold_seconds, trigger_at_ms, "Fallback alarm moved");
        Ok(Some(ScheduleOutcome {
            trigger_at_ms,
            precision,
        }))
    }
}

pub fn decode_request(payload: &str) -> Option<FallbackAlarmRequest> {
    match serde_json::from_str(payload) {
        Ok(request) => Some(request),
        Err(err) => {
            warn!(error = %err, "Fallback alarm payload is unreadable");
            None
        }
    }
}

/// Produces the wake experience from the embedded request alone.
pub struct FallbackTrigger {
    notifier: Arc<dyn NotificationSurface>,
    launcher: Arc<dyn AppLauncher>,
}

impl FallbackTrigger {
    pub fn new(notifier: Arc<dyn NotificationSurface>, launcher: Arc<dyn AppLauncher>) -> Self {
        Self { notifier, launcher }
    }

    /// A missing or unreadable payload still raises a generic alarm.
    pub fn on_fire(&self, request: Option<&FallbackAlarmRequest>) {
        let name = request
            .map(|request| display_destination(&request.destination_name).to_string())
            .unwrap_or_else(|| display_destination("").to_string());
        warn!(destination = %name, "Fallback alarm fired");

        let notification = fallback_alarm_notification(&name);
        if let Err(err) = self.notifier.show(&notification) {
            error!(error = %err, "Failed to show fallback alarm notification");
        }

        let launch = LaunchRequest {
            title: DEFAULT_ALARM_TITLE.to_string(),
            body: notification.body.clone(),
            destination_name: Some(name),
            fallback: true,
            allow_continue: false,
        };
        if let Err(err) = self.launcher.launch_alarm_surface(&launch) {
            error!(error = %err, "Failed to launch alarm surface from fallback alarm");
        }
    }
}
