//! Fakes for the platform seams plus a fully wired supervisor over a
//! throwaway database.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use geowake_daemon_protocol::HostEvent;

use crate::actions::ActionHandler;
use crate::alarms::{
    AlarmError, AlarmService, ArmedTimer, SqliteAlarmService, TimerSlot, TimerSpec,
};
use crate::config::DaemonConfig;
use crate::db::Db;
use crate::fallback::FallbackAlarmScheduler;
use crate::host::HostSession;
use crate::notifications::{Notification, NotificationId};
use crate::platform::{
    AlarmFeedback, AppLauncher, Clock, Deferred, DeferredTask, LaunchRequest, NotificationSurface,
};
use crate::progress_wake::ProgressWakeScheduler;
use crate::session_store::SessionStore;
use crate::supervisor::{Platform, Supervisor};

pub struct FixedClock {
    now_ms: AtomicI64,
}

impl FixedClock {
    pub const START_MS: i64 = 1_800_000_000_000;

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self {
            now_ms: AtomicI64::new(Self::START_MS),
        }
    }
}

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Deferred tasks run only when the test advances virtual time.
#[derive(Default)]
pub struct ManualDeferred {
    elapsed: Mutex<Duration>,
    queue: Mutex<Vec<(Duration, DeferredTask)>>,
}

impl ManualDeferred {
    pub fn advance(&self, by: Duration) {
        let now = {
            let mut elapsed = self.elapsed.lock().expect("elapsed lock");
            *elapsed += by;
            *elapsed
        };
        let due: Vec<DeferredTask> = {
            let mut queue = self.queue.lock().expect("queue lock");
            let (due, pending): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|(at, _)| *at <= now);
            *queue = pending;
            due.into_iter().map(|(_, task)| task).collect()
        };
        for task in due {
            task();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("queue lock").len()
    }
}

impl Deferred for ManualDeferred {
    fn run_after(&self, delay: Duration, task: DeferredTask) {
        let at = *self.elapsed.lock().expect("elapsed lock") + delay;
        self.queue.lock().expect("queue lock").push((at, task));
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    shown: Mutex<Vec<Notification>>,
    cancelled: Mutex<Vec<NotificationId>>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().expect("shown lock").clone()
    }

    pub fn cancelled(&self) -> Vec<NotificationId> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }
}

impl NotificationSurface for RecordingNotifier {
    fn show(&self, notification: &Notification) -> Result<(), String> {
        if self.fail {
            return Err("notification surface unavailable".to_string());
        }
        self.shown
            .lock()
            .expect("shown lock")
            .push(notification.clone());
        Ok(())
    }

    fn cancel(&self, id: NotificationId) -> Result<(), String> {
        self.cancelled.lock().expect("cancelled lock").push(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingLauncher {
    fail: bool,
    launches: Mutex<Vec<LaunchRequest>>,
}

impl RecordingLauncher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().expect("launches lock").clone()
    }
}

impl AppLauncher for RecordingLauncher {
    fn launch_alarm_surface(&self, request: &LaunchRequest) -> Result<(), String> {
        if self.fail {
            return Err("launch refused".to_string());
        }
        self.launches
            .lock()
            .expect("launches lock")
            .push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingFeedback {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingFeedback {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl AlarmFeedback for RecordingFeedback {
    fn start(&self) -> Result<(), String> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), String> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeHost {
    pid: u32,
    delivered: Mutex<Vec<HostEvent>>,
    force_stops: AtomicUsize,
    retired: AtomicBool,
}

impl FakeHost {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            delivered: Mutex::new(Vec::new()),
            force_stops: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<HostEvent> {
        self.delivered.lock().expect("delivered lock").clone()
    }

    pub fn force_stops(&self) -> usize {
        self.force_stops.load(Ordering::SeqCst)
    }
}

impl HostSession for FakeHost {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_registered(&self) -> bool {
        !self.retired.load(Ordering::SeqCst)
    }

    fn deliver(&self, event: HostEvent) -> bool {
        self.delivered.lock().expect("delivered lock").push(event);
        true
    }

    fn force_stop(&self) -> bool {
        self.force_stops.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Timer service whose store is always broken.
pub struct FailingAlarms;

impl AlarmService for FailingAlarms {
    fn can_schedule_exact(&self) -> bool {
        true
    }

    fn arm(&self, _spec: &TimerSpec) -> Result<(), AlarmError> {
        Err(AlarmError::Store("disk I/O error".to_string()))
    }

    fn cancel(&self, _slot: TimerSlot) -> Result<bool, AlarmError> {
        Err(AlarmError::Store("disk I/O error".to_string()))
    }

    fn armed(&self, _slot: TimerSlot) -> Result<Option<ArmedTimer>, AlarmError> {
        Err(AlarmError::Store("disk I/O error".to_string()))
    }

    fn due(&self, _now_ms: i64) -> Result<Vec<ArmedTimer>, AlarmError> {
        Err(AlarmError::Store("disk I/O error".to_string()))
    }

    fn retire(&self, _timer: &ArmedTimer) -> Result<(), AlarmError> {
        Err(AlarmError::Store("disk I/O error".to_string()))
    }
}

pub struct Harness {
    pub supervisor: Supervisor,
    pub store: Arc<SessionStore>,
    pub alarms: Arc<dyn AlarmService>,
    pub progress_wake: Arc<ProgressWakeScheduler>,
    pub fallback: Arc<FallbackAlarmScheduler>,
    pub actions: Arc<ActionHandler>,
    pub clock: Arc<FixedClock>,
    pub deferred: Arc<ManualDeferred>,
    pub notifier: Arc<RecordingNotifier>,
    pub feedback: Arc<RecordingFeedback>,
    pub launcher: Arc<RecordingLauncher>,
    _temp_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_exact_permission(true)
    }

    pub fn with_exact_permission(exact_permitted: bool) -> Self {
        Self::with_alarms(|db| {
            Arc::new(SqliteAlarmService::new(db, exact_permitted)) as Arc<dyn AlarmService>
        })
    }

    pub fn with_failing_alarms() -> Self {
        Self::with_alarms(|_| Arc::new(FailingAlarms) as Arc<dyn AlarmService>)
    }

    pub fn with_alarms(alarms: impl FnOnce(Arc<Db>) -> Arc<dyn AlarmService>) -> Self {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("state.db")).expect("db init"));
        let clock = Arc::new(FixedClock::default());
        let deferred = Arc::new(ManualDeferred::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let feedback = Arc::new(RecordingFeedback::default());
        let launcher = Arc::new(RecordingLauncher::default());

        let supervisor = Supervisor::new(
            Arc::clone(&db),
            &DaemonConfig::default(),
            Platform {
                clock: clock.clone(),
                alarms: alarms(db),
                notifier: notifier.clone(),
                feedback: feedback.clone(),
                launcher: launcher.clone(),
                deferred: deferred.clone(),
            },
        );

        Self {
            store: Arc::clone(supervisor.store()),
            alarms: Arc::clone(supervisor.alarms()),
            progress_wake: Arc::clone(supervisor.progress_wake()),
            fallback: Arc::clone(supervisor.fallback()),
            actions: Arc::clone(supervisor.actions()),
            supervisor,
            clock,
            deferred,
            notifier,
            feedback,
            launcher,
            _temp_dir: temp_dir,
        }
    }
}
