//! Platform surfaces the daemon runs with.
//!
//! There is no notification shade or vibrator on a headless host, so the
//! notifier and the feedback surface render through `tracing`. The launcher
//! spawns the configured host application command.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{debug, info, warn};

use crate::notifications::{Notification, NotificationId};
use crate::platform::{AlarmFeedback, AppLauncher, LaunchRequest, NotificationSurface};

const ALARM_VIBRATION_PATTERN: [u64; 9] = [0, 500, 250, 500, 250, 500, 250, 1000, 500];

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl NotificationSurface for TracingNotifier {
    fn show(&self, notification: &Notification) -> Result<(), String> {
        info!(
            id = notification.id.raw(),
            channel = notification.channel,
            title = %notification.title,
            body = %notification.body,
            big_text = ?notification.big_text,
            priority = ?notification.priority,
            category = ?notification.category,
            progress_permille = ?notification.progress_permille,
            ongoing = notification.ongoing,
            only_alert_once = notification.only_alert_once,
            auto_cancel = notification.auto_cancel,
            vibration = ?notification.vibration_pattern,
            alarm_sound = notification.alarm_sound,
            actions = ?notification.actions.iter().map(|action| action.label()).collect::<Vec<_>>(),
            "Notification shown"
        );
        Ok(())
    }

    fn cancel(&self, id: NotificationId) -> Result<(), String> {
        debug!(id = id.raw(), "Notification cancelled");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct TracingFeedback {
    active: AtomicBool,
}

impl AlarmFeedback for TracingFeedback {
    fn start(&self) -> Result<(), String> {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!(pattern = ?ALARM_VIBRATION_PATTERN, "Alarm vibration started");
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), String> {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Alarm vibration stopped");
        }
        Ok(())
    }
}

pub struct CommandLauncher {
    argv: Vec<String>,
}

impl CommandLauncher {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl AppLauncher for CommandLauncher {
    fn launch_alarm_surface(&self, request: &LaunchRequest) -> Result<(), String> {
        let Some((program, base_args)) = self.argv.split_first() else {
            debug!("No launcher command configured; skipping alarm surface launch");
            return Ok(());
        };

        let mut child = Command::new(program)
            .args(base_args)
            .args(launch_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format!("Failed to launch {}: {}", program, err))?;

        info!(
            program = %program,
            pid = child.id(),
            fallback = request.fallback,
            "Alarm surface launched"
        );

        // Reap the child so it does not linger as a zombie.
        thread::spawn(move || {
            if let Err(err) = child.wait() {
                warn!(error = %err, "Failed to wait for alarm surface process");
            }
        });
        Ok(())
    }
}

pub fn launch_args(request: &LaunchRequest) -> Vec<String> {
    let mut args = vec!["--show-alarm".to_string()];
    if request.fallback {
        args.push("--fallback-alarm".to_string());
    }
    if let Some(name) = request.destination_name.as_deref() {
        args.push("--destination-name".to_string());
        args.push(name.to_string());
    }
    args.push("--title".to_string());
    args.push(request.title.clone());
    args.push("--body".to_string());
    args.push(request.body.clone());
    if !request.allow_continue {
        args.push("--no-continue".to_string());
    }
    args
}
