//! Seams to the outside world: wall clock, deferred work, notification
//! surface, alarm feedback and the host application launcher.
//!
//! The supervisor only talks to these traits; `surfaces.rs` holds the
//! implementations the daemon runs with.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::error;

use crate::notifications::{Notification, NotificationId};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

pub type DeferredTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay without blocking the caller.
pub trait Deferred: Send + Sync {
    fn run_after(&self, delay: Duration, task: DeferredTask);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadDeferred;

impl Deferred for ThreadDeferred {
    fn run_after(&self, delay: Duration, task: DeferredTask) {
        let slot = Arc::new(Mutex::new(Some(task)));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("geowake-deferred".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if let Some(task) = worker_slot.lock().ok().and_then(|mut task| task.take()) {
                    task();
                }
            });

        // A deferred check must still happen, even if it costs the caller the wait.
        if let Err(err) = spawned {
            error!(error = %err, "Failed to spawn deferred worker; running inline");
            thread::sleep(delay);
            if let Some(task) = slot.lock().ok().and_then(|mut task| task.take()) {
                task();
            }
        }
    }
}

pub trait NotificationSurface: Send + Sync {
    fn show(&self, notification: &Notification) -> Result<(), String>;
    fn cancel(&self, id: NotificationId) -> Result<(), String>;
}

/// Physical alarm feedback (vibration pattern).
pub trait AlarmFeedback: Send + Sync {
    fn start(&self) -> Result<(), String>;
    fn stop(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub title: String,
    pub body: String,
    pub destination_name: Option<String>,
    pub fallback: bool,
    pub allow_continue: bool,
}

pub trait AppLauncher: Send + Sync {
    fn launch_alarm_surface(&self, request: &LaunchRequest) -> Result<(), String>;
}
