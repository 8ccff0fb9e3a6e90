//! Notification descriptions rendered by the supervisor.
//!
//! These are plain data; the surface decides how to present them.

use geowake_daemon_protocol::ProgressPayload;

pub const TRACKING_CHANNEL_ID: &str = "geowake_tracking_channel_v2";
pub const FALLBACK_CHANNEL_ID: &str = "geowake_fallback_alarm";

const FALLBACK_VIBRATION_PATTERN: [u64; 6] = [0, 1000, 500, 1000, 500, 1000];
const DEFAULT_DESTINATION_NAME: &str = "your destination";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationId {
    Progress,
    Alarm,
    FallbackAlarm,
}

impl NotificationId {
    pub fn raw(&self) -> i32 {
        match self {
            NotificationId::Progress => 888,
            NotificationId::Alarm => 0,
            NotificationId::FallbackAlarm => 9001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Default,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Service,
    Alarm,
}

/// Buttons attached to the progress notification; pressing one reaches the
/// supervisor out-of-band as `handle_end_tracking` / `handle_ignore_tracking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationAction {
    EndTracking,
    IgnoreTracking,
}

impl NotificationAction {
    pub fn label(&self) -> &'static str {
        match self {
            NotificationAction::EndTracking => "End tracking",
            NotificationAction::IgnoreTracking => "Ignore",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub channel: &'static str,
    pub title: String,
    pub body: String,
    pub big_text: Option<String>,
    pub priority: Priority,
    pub category: Category,
    pub ongoing: bool,
    pub only_alert_once: bool,
    pub auto_cancel: bool,
    pub progress_permille: Option<u32>,
    pub vibration_pattern: Vec<u64>,
    pub alarm_sound: bool,
    pub actions: Vec<NotificationAction>,
}

pub fn progress_notification(payload: &ProgressPayload) -> Notification {
    Notification {
        id: NotificationId::Progress,
        channel: TRACKING_CHANNEL_ID,
        title: payload.title.clone(),
        body: payload.subtitle.clone(),
        big_text: None,
        priority: Priority::Default,
        category: Category::Service,
        ongoing: true,
        only_alert_once: true,
        auto_cancel: false,
        progress_permille: Some(payload.progress_permille()),
        vibration_pattern: Vec::new(),
        alarm_sound: false,
        actions: vec![
            NotificationAction::EndTracking,
            NotificationAction::IgnoreTracking,
        ],
    }
}

/// In-app alarm shown alongside the alarm surface while it is ringing.
pub fn alarm_notification(title: &str, body: &str) -> Notification {
    Notification {
        id: NotificationId::Alarm,
        channel: FALLBACK_CHANNEL_ID,
        title: title.to_string(),
        body: body.to_string(),
        big_text: None,
        priority: Priority::Max,
        category: Category::Alarm,
        ongoing: true,
        only_alert_once: false,
        auto_cancel: false,
        progress_permille: None,
        vibration_pattern: Vec::new(),
        alarm_sound: true,
        actions: vec![NotificationAction::EndTracking],
    }
}

pub fn fallback_alarm_notification(destination_name: &str) -> Notification {
    let name = display_destination(destination_name);
    Notification {
        id: NotificationId::FallbackAlarm,
        channel: FALLBACK_CHANNEL_ID,
        title: format!("Approaching: {}", name),
        body: format!("Wake up! You're approaching {}.", name),
        big_text: Some(format!(
            "You're approaching {}.\n\nThis is a fallback alarm because the app was closed.",
            name
        )),
        priority: Priority::Max,
        category: Category::Alarm,
        ongoing: false,
        only_alert_once: false,
        auto_cancel: true,
        progress_permille: None,
        vibration_pattern: FALLBACK_VIBRATION_PATTERN.to_vec(),
        alarm_sound: true,
        actions: Vec::new(),
    }
}

pub fn display_destination(destination_name: &str) -> &str {
    let trimmed = destination_name.trim();
    if trimmed.is_empty() {
        DEFAULT_DESTINATION_NAME
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_notification_carries_actions_and_scaled_progress() {
        let payload = ProgressPayload::new("To Central Station", "3 stops left", 0.25);
        let notification = progress_notification(&payload);
        assert_eq!(notification.id.raw(), 888);
        assert_eq!(notification.progress_permille, Some(250));
        assert!(notification.ongoing);
        assert_eq!(
            notification.actions,
            vec![
                NotificationAction::EndTracking,
                NotificationAction::IgnoreTracking
            ]
        );
    }

    #[test]
    fn fallback_notification_is_alarm_styled() {
        let notification = fallback_alarm_notification("Central Station");
        assert_eq!(notification.title, "Approaching: Central Station");
        assert_eq!(notification.priority, Priority::Max);
        assert_eq!(notification.category, Category::Alarm);
        assert!(notification.alarm_sound);
        assert!(!notification.vibration_pattern.is_empty());
    }

    #[test]
    fn alarm_notification_uses_alarm_slot() {
        let notification = alarm_notification("Wake Up!", "Approaching destination");
        assert_eq!(notification.id.raw(), 0);
        assert_eq!(notification.actions, vec![NotificationAction::EndTracking]);
    }

    #[test]
    fn blank_destination_uses_generic_name() {
        let notification = fallback_alarm_notification("  ");
        assert_eq!(notification.title, "Approaching: your destination");
    }
}
