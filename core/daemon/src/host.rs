//! The live tracking process, as seen from the supervisor.
//!
//! The process registers its pid over IPC and drains outbound events by
//! polling. When nothing is registered the host is simply absent: events are
//! dropped and a forced stop has nothing to stop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{debug, info, warn};

use geowake_daemon_protocol::HostEvent;

const MAX_PENDING_EVENTS: usize = 64;

pub trait HostSession: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// False once this registration was replaced or withdrawn.
    fn is_registered(&self) -> bool;
    /// Queues an event for the host; false when it could not be delivered.
    fn deliver(&self, event: HostEvent) -> bool;
    /// Stops the host process; false when nothing was stopped.
    fn force_stop(&self) -> bool;
}

pub struct RegisteredHost {
    pid: u32,
    outbox: Mutex<VecDeque<HostEvent>>,
    registered: AtomicBool,
}

impl RegisteredHost {
    fn new(pid: u32) -> Self {
        Self {
            pid,
            outbox: Mutex::new(VecDeque::new()),
            registered: AtomicBool::new(true),
        }
    }

    fn retire(&self) {
        self.registered.store(false, Ordering::SeqCst);
    }

    fn drain(&self) -> Vec<HostEvent> {
        self.outbox
            .lock()
            .map(|mut outbox| outbox.drain(..).collect())
            .unwrap_or_default()
    }
}

impl HostSession for RegisteredHost {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn deliver(&self, event: HostEvent) -> bool {
        let Ok(mut outbox) = self.outbox.lock() else {
            return false;
        };
        if outbox.len() >= MAX_PENDING_EVENTS {
            warn!(pid = self.pid, "Host outbox full; dropping oldest event");
            outbox.pop_front();
        }
        debug!(pid = self.pid, event = event.name(), "Queued host event");
        outbox.push_back(event);
        true
    }

    fn force_stop(&self) -> bool {
        // The pid may have been reused once the registration is gone.
        if !self.is_registered() {
            debug!(pid = self.pid, "Host registration withdrawn; not stopping");
            return false;
        }
        terminate_process(self.pid)
    }
}

#[derive(Default)]
pub struct HostRegistry {
    current: Mutex<Option<Arc<RegisteredHost>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous registration; undelivered events go with it.
    pub fn register(&self, pid: u32) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.as_ref() {
                previous.retire();
                if previous.pid != pid {
                    info!(previous = previous.pid, pid, "Host registration replaced");
                }
            }
            *current = Some(Arc::new(RegisteredHost::new(pid)));
        }
    }

    pub fn unregister(&self) -> Option<u32> {
        self.current
            .lock()
            .ok()
            .and_then(|mut current| current.take())
            .map(|host| {
                host.retire();
                host.pid
            })
    }

    pub fn current(&self) -> Option<Arc<dyn HostSession>> {
        self.registered()
            .map(|host| host as Arc<dyn HostSession>)
    }

    pub fn poll_events(&self) -> Vec<HostEvent> {
        self.registered()
            .map(|host| host.drain())
            .unwrap_or_default()
    }

    pub fn is_alive(&self) -> bool {
        self.registered()
            .map(|host| is_process_alive(host.pid))
            .unwrap_or(false)
    }

    fn registered(&self) -> Option<Arc<RegisteredHost>> {
        self.current.lock().ok().and_then(|current| current.clone())
    }
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}

fn terminate_process(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Values that do not fit a positive pid_t would signal a process
        // group or every process the user owns.
        let target = match libc::pid_t::try_from(pid) {
            Ok(target) if target > 0 => target,
            _ => {
                warn!(pid, "Refusing to signal out-of-range pid");
                return false;
            }
        };
        // SAFETY: kill(2) with SIGTERM on a single positive pid the host
        // registered itself. ESRCH (already gone) is reported as "nothing stopped".
        #[allow(unsafe_code)]
        let result = unsafe { libc::kill(target, libc::SIGTERM) };
        if result == 0 {
            info!(pid, "Sent SIGTERM to host process");
            true
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                warn!(pid, error = %err, "Failed to stop host process");
            }
            false
        }
    }
    #[cfg(not(unix))]
    {
        warn!(pid, "Stopping the host process is unsupported on this platform");
        false
    }
}
