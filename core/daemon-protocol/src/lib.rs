//! IPC protocol types and validation for geowake-daemon.
//!
//! This crate is shared by the supervisor daemon and its clients (the hook CLI,
//! the live tracking process) so the command surface cannot drift. The daemon
//! remains the authority on validation, but clients can reuse the same types
//! to construct valid requests.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024; // 64KB

/// Cadence used when a progress wake is requested without an interval, and by
/// boot recovery.
pub const DEFAULT_WAKE_INTERVAL_MS: u64 = 10 * 60 * 1000;

pub const DEFAULT_PROGRESS_TITLE: &str = "GeoWake journey";
pub const DEFAULT_ALARM_TITLE: &str = "Wake Up!";
pub const DEFAULT_ALARM_BODY: &str = "Approaching destination";

/// Origin tag attached to host events raised from notification buttons.
pub const SOURCE_NOTIFICATION_ACTION: &str = "notification_action";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    ScheduleFallbackAlarm,
    CancelFallbackAlarm,
    UpdateFallbackAlarm,
    ScheduleProgressWake,
    CancelProgressWake,
    DecorateProgressNotification,
    CancelProgressNotification,
    StartTracking,
    EndTracking,
    HandleEndTracking,
    HandleIgnoreTracking,
    AcknowledgeNativeEndTracking,
    AcknowledgeNativeIgnoreTracking,
    TakeEndSignal,
    SetResumePending,
    GetSession,
    LaunchAlarm,
    StopVibration,
    CheckReliability,
    BootCompleted,
    RegisterHost,
    UnregisterHost,
    PollHostEvents,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetHealth => "get_health",
            Method::ScheduleFallbackAlarm => "schedule_fallback_alarm",
            Method::CancelFallbackAlarm => "cancel_fallback_alarm",
            Method::UpdateFallbackAlarm => "update_fallback_alarm",
            Method::ScheduleProgressWake => "schedule_progress_wake",
            Method::CancelProgressWake => "cancel_progress_wake",
            Method::DecorateProgressNotification => "decorate_progress_notification",
            Method::CancelProgressNotification => "cancel_progress_notification",
            Method::StartTracking => "start_tracking",
            Method::EndTracking => "end_tracking",
            Method::HandleEndTracking => "handle_end_tracking",
            Method::HandleIgnoreTracking => "handle_ignore_tracking",
            Method::AcknowledgeNativeEndTracking => "acknowledge_native_end_tracking",
            Method::AcknowledgeNativeIgnoreTracking => "acknowledge_native_ignore_tracking",
            Method::TakeEndSignal => "take_end_signal",
            Method::SetResumePending => "set_resume_pending",
            Method::GetSession => "get_session",
            Method::LaunchAlarm => "launch_alarm",
            Method::StopVibration => "stop_vibration",
            Method::CheckReliability => "check_reliability",
            Method::BootCompleted => "boot_completed",
            Method::RegisterHost => "register_host",
            Method::UnregisterHost => "unregister_host",
            Method::PollHostEvents => "poll_host_events",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// The command that was rejected, when the failure is tied to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            method: None,
        }
    }

    pub fn for_method(method: Method, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: format!("{}: {}", method.as_str(), message.into()),
            method: Some(method.as_str().to_string()),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared data types
// ─────────────────────────────────────────────────────────────────────────────

/// Last known rendering of journey progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub progress: f64,
}

impl ProgressPayload {
    pub fn new(title: impl Into<String>, subtitle: impl Into<String>, progress: f64) -> Self {
        Self {
            title: title.into(),
            subtitle: subtitle.into(),
            progress: clamp_fraction(progress),
        }
    }

    /// Progress on the 0..=1000 scale used by notification progress bars.
    pub fn progress_permille(&self) -> u32 {
        (clamp_fraction(self.progress) * 1000.0) as u32
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Everything the fallback trigger needs, embedded in the armed timer so that
/// firing never depends on the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAlarmRequest {
    pub route_id: String,
    pub destination_lat: f64,
    pub destination_lng: f64,
    pub destination_name: String,
    pub trigger_time_epoch_ms: i64,
}

impl FallbackAlarmRequest {
    pub fn trigger_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.trigger_time_epoch_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Exact,
    Inexact,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Exact => "exact",
            Precision::Inexact => "inexact",
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "exact" => Ok(Precision::Exact),
            "inexact" => Ok(Precision::Inexact),
            other => Err(format!("unknown precision: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum BootReason {
    Boot,
    Quickboot,
    PackageReplaced,
    DaemonStart,
}

/// Outbound notifications raised toward the live tracking process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    NativeEndTrackingTriggered { source: String },
    NativeIgnoreTrackingTriggered { source: String },
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::NativeEndTrackingTriggered { .. } => "native_end_tracking_triggered",
            HostEvent::NativeIgnoreTrackingTriggered { .. } => "native_ignore_tracking_triggered",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityReport {
    pub battery_optimized: bool,
    pub exact_alarm_permission: bool,
    pub manufacturer: String,
    pub background_restricted: bool,
    pub host_alive: bool,
}

/// Materialized view of the persisted tracking session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSession {
    pub active: bool,
    pub suppressed: bool,
    pub progress_payload: Option<ProgressPayload>,
    pub resume_pending: bool,
    pub wake_interval_ms: Option<u64>,
    pub end_ack_signal_raised: bool,
    pub end_ack_received: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmedTimerInfo {
    pub slot: i64,
    pub kind: String,
    pub trigger_at_ms: i64,
    pub precision: Precision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchAlarmParams {
    pub title: String,
    pub body: String,
    pub allow_continue: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Command bus
// ─────────────────────────────────────────────────────────────────────────────

/// A validated inbound command. Parsing either yields a complete command or
/// rejects it; nothing is ever partially applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetHealth,
    ScheduleFallbackAlarm(FallbackAlarmRequest),
    CancelFallbackAlarm,
    UpdateFallbackAlarm { threshold_seconds: u64 },
    ScheduleProgressWake { interval_ms: u64 },
    CancelProgressWake,
    DecorateProgressNotification(ProgressPayload),
    CancelProgressNotification,
    StartTracking { interval_ms: Option<u64> },
    EndTracking,
    HandleEndTracking,
    HandleIgnoreTracking,
    AcknowledgeNativeEndTracking,
    AcknowledgeNativeIgnoreTracking,
    TakeEndSignal,
    SetResumePending { value: bool },
    GetSession,
    LaunchAlarm(LaunchAlarmParams),
    StopVibration,
    CheckReliability,
    BootCompleted { reason: BootReason },
    RegisterHost { pid: u32 },
    UnregisterHost,
    PollHostEvents,
}

impl Command {
    pub fn from_request(method: Method, params: Option<Value>) -> Result<Self, ErrorInfo> {
        let command = match method {
            Method::GetHealth => Command::GetHealth,
            Method::ScheduleFallbackAlarm => {
                let raw: FallbackAlarmParams = decode_params(method, params)?;
                Command::ScheduleFallbackAlarm(raw.validate(method)?)
            }
            Method::CancelFallbackAlarm => Command::CancelFallbackAlarm,
            Method::UpdateFallbackAlarm => {
                let raw: ThresholdParams = decode_params(method, params)?;
                Command::UpdateFallbackAlarm {
                    threshold_seconds: require(method, raw.threshold_seconds, "threshold_seconds")?,
                }
            }
            Method::ScheduleProgressWake => {
                let raw: IntervalParams = decode_params(method, params)?;
                Command::ScheduleProgressWake {
                    interval_ms: raw.interval_ms.unwrap_or(DEFAULT_WAKE_INTERVAL_MS),
                }
            }
            Method::CancelProgressWake => Command::CancelProgressWake,
            Method::DecorateProgressNotification => {
                let raw: DecorateParams = decode_params(method, params)?;
                Command::DecorateProgressNotification(ProgressPayload::new(
                    raw.title.unwrap_or_else(|| DEFAULT_PROGRESS_TITLE.to_string()),
                    raw.subtitle.unwrap_or_default(),
                    raw.progress.unwrap_or(0.0),
                ))
            }
            Method::CancelProgressNotification => Command::CancelProgressNotification,
            Method::StartTracking => {
                let raw: IntervalParams = decode_params(method, params)?;
                Command::StartTracking {
                    interval_ms: raw.interval_ms,
                }
            }
            Method::EndTracking => Command::EndTracking,
            Method::HandleEndTracking => Command::HandleEndTracking,
            Method::HandleIgnoreTracking => Command::HandleIgnoreTracking,
            Method::AcknowledgeNativeEndTracking => Command::AcknowledgeNativeEndTracking,
            Method::AcknowledgeNativeIgnoreTracking => Command::AcknowledgeNativeIgnoreTracking,
            Method::TakeEndSignal => Command::TakeEndSignal,
            Method::SetResumePending => {
                let raw: ResumePendingParams = decode_params(method, params)?;
                Command::SetResumePending {
                    value: require(method, raw.value, "value")?,
                }
            }
            Method::GetSession => Command::GetSession,
            Method::LaunchAlarm => {
                let raw: LaunchParams = decode_params(method, params)?;
                Command::LaunchAlarm(LaunchAlarmParams {
                    title: raw.title.unwrap_or_else(|| DEFAULT_ALARM_TITLE.to_string()),
                    body: raw.body.unwrap_or_else(|| DEFAULT_ALARM_BODY.to_string()),
                    allow_continue: raw.allow_continue.unwrap_or(true),
                })
            }
            Method::StopVibration => Command::StopVibration,
            Method::CheckReliability => Command::CheckReliability,
            Method::BootCompleted => {
                let raw: BootParams = decode_params(method, params)?;
                Command::BootCompleted {
                    reason: raw.reason.unwrap_or(BootReason::Boot),
                }
            }
            Method::RegisterHost => {
                let raw: HostParams = decode_params(method, params)?;
                Command::RegisterHost {
                    pid: require_pid(method, raw.pid)?,
                }
            }
            Method::UnregisterHost => Command::UnregisterHost,
            Method::PollHostEvents => Command::PollHostEvents,
        };
        Ok(command)
    }

    pub fn method(&self) -> Method {
        match self {
            Command::GetHealth => Method::GetHealth,
            Command::ScheduleFallbackAlarm(_) => Method::ScheduleFallbackAlarm,
            Command::CancelFallbackAlarm => Method::CancelFallbackAlarm,
            Command::UpdateFallbackAlarm { .. } => Method::UpdateFallbackAlarm,
            Command::ScheduleProgressWake { .. } => Method::ScheduleProgressWake,
            Command::CancelProgressWake => Method::CancelProgressWake,
            Command::DecorateProgressNotification(_) => Method::DecorateProgressNotification,
            Command::CancelProgressNotification => Method::CancelProgressNotification,
            Command::StartTracking { .. } => Method::StartTracking,
            Command::EndTracking => Method::EndTracking,
            Command::HandleEndTracking => Method::HandleEndTracking,
            Command::HandleIgnoreTracking => Method::HandleIgnoreTracking,
            Command::AcknowledgeNativeEndTracking => Method::AcknowledgeNativeEndTracking,
            Command::AcknowledgeNativeIgnoreTracking => Method::AcknowledgeNativeIgnoreTracking,
            Command::TakeEndSignal => Method::TakeEndSignal,
            Command::SetResumePending { .. } => Method::SetResumePending,
            Command::GetSession => Method::GetSession,
            Command::LaunchAlarm(_) => Method::LaunchAlarm,
            Command::StopVibration => Method::StopVibration,
            Command::CheckReliability => Method::CheckReliability,
            Command::BootCompleted { .. } => Method::BootCompleted,
            Command::RegisterHost { .. } => Method::RegisterHost,
            Command::UnregisterHost => Method::UnregisterHost,
            Command::PollHostEvents => Method::PollHostEvents,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FallbackAlarmParams {
    #[serde(default)]
    route_id: Option<String>,
    #[serde(default)]
    destination_lat: Option<f64>,
    #[serde(default)]
    destination_lng: Option<f64>,
    #[serde(default)]
    destination_name: Option<String>,
    #[serde(default, alias = "trigger_time_epoch_ms")]
    trigger_time_ms: Option<i64>,
}

impl FallbackAlarmParams {
    fn validate(self, method: Method) -> Result<FallbackAlarmRequest, ErrorInfo> {
        let route_id = require_string(method, self.route_id, "route_id")?;
        let destination_lat = require(method, self.destination_lat, "destination_lat")?;
        let destination_lng = require(method, self.destination_lng, "destination_lng")?;
        let destination_name = require_string(method, self.destination_name, "destination_name")?;
        let trigger_time_epoch_ms = require(method, self.trigger_time_ms, "trigger_time_ms")?;

        if !(-90.0..=90.0).contains(&destination_lat) {
            return Err(ErrorInfo::for_method(
                method,
                "invalid_params",
                "destination_lat must be within [-90, 90]",
            ));
        }
        if !(-180.0..=180.0).contains(&destination_lng) {
            return Err(ErrorInfo::for_method(
                method,
                "invalid_params",
                "destination_lng must be within [-180, 180]",
            ));
        }
        if trigger_time_epoch_ms <= 0 {
            return Err(ErrorInfo::for_method(
                method,
                "invalid_params",
                "trigger_time_ms must be a positive epoch timestamp",
            ));
        }

        Ok(FallbackAlarmRequest {
            route_id,
            destination_lat,
            destination_lng,
            destination_name,
            trigger_time_epoch_ms,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdParams {
    #[serde(default)]
    threshold_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntervalParams {
    #[serde(default)]
    interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DecorateParams {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResumePendingParams {
    #[serde(default)]
    value: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LaunchParams {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    allow_continue: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BootParams {
    #[serde(default)]
    reason: Option<BootReason>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostParams {
    #[serde(default)]
    pid: Option<u32>,
}

fn decode_params<T>(method: Method, params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: DeserializeOwned + Default,
{
    let params = match params {
        None | Some(Value::Null) => return Ok(T::default()),
        Some(params) => params,
    };
    if !params.is_object() {
        return Err(ErrorInfo::for_method(
            method,
            "invalid_params",
            "params must be an object",
        ));
    }
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::for_method(method, "invalid_params", format!("invalid params: {}", err))
    })
}

fn require<T>(method: Method, value: Option<T>, field: &str) -> Result<T, ErrorInfo> {
    value.ok_or_else(|| {
        ErrorInfo::for_method(method, "missing_field", format!("{} is required", field))
    })
}

fn require_string(method: Method, value: Option<String>, field: &str) -> Result<String, ErrorInfo> {
    match value {
        Some(candidate) if !candidate.trim().is_empty() => Ok(candidate),
        _ => Err(ErrorInfo::for_method(
            method,
            "missing_field",
            format!("{} is required", field),
        )),
    }
}

fn require_pid(method: Method, pid: Option<u32>) -> Result<u32, ErrorInfo> {
    match pid {
        Some(0) | None => Err(ErrorInfo::for_method(
            method,
            "invalid_pid",
            "pid is required",
        )),
        Some(pid) if i32::try_from(pid).is_err() => Err(ErrorInfo::for_method(
            method,
            "invalid_pid",
            format!("pid {} is out of range", pid),
        )),
        // Parsing happens inside the daemon; it must never register itself.
        Some(pid) if pid == std::process::id() => Err(ErrorInfo::for_method(
            method,
            "invalid_pid",
            "pid refers to the daemon itself",
        )),
        Some(pid) => Ok(pid),
    }
}
