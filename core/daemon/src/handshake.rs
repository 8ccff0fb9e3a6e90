//! Bounded wait for the live process to confirm an "End" before it is stopped.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::host::HostSession;
use crate::platform::Deferred;
use crate::session_store::SessionStore;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);

pub struct AckHandshake {
    store: Arc<SessionStore>,
    deferred: Arc<dyn Deferred>,
    timeout: Duration,
}

impl AckHandshake {
    pub fn new(store: Arc<SessionStore>, deferred: Arc<dyn Deferred>) -> Self {
        Self {
            store,
            deferred,
            timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Returns immediately; the acknowledgment is checked once the timeout
    /// elapses. The check always runs, there is no way to cancel it.
    pub fn start(&self, host: Option<Arc<dyn HostSession>>) {
        let store = Arc::clone(&self.store);
        debug!(
            timeout_ms = self.timeout.as_millis() as u64,
            host_pid = host.as_ref().and_then(|host| host.pid()),
            "End handshake started"
        );
        self.deferred
            .run_after(self.timeout, Box::new(move || check_ack(&store, host)));
    }
}

fn check_ack(store: &SessionStore, host: Option<Arc<dyn HostSession>>) {
    let acknowledged = match store.end_ack_received() {
        Ok(acknowledged) => acknowledged,
        Err(err) => {
            // Unknown counts as unacknowledged.
            warn!(error = %err, "Failed to read end acknowledgment");
            false
        }
    };
    if acknowledged {
        info!("Live process acknowledged end of tracking");
        return;
    }

    match host {
        Some(host) if !host.is_registered() => {
            debug!(
                pid = host.pid(),
                "No end acknowledgment but the host registration is gone; not stopping"
            );
        }
        Some(host) => {
            warn!(pid = host.pid(), "No end acknowledgment; force-stopping live process");
            if !host.force_stop() {
                debug!("Live process was already gone");
            }
        }
        None => debug!("No end acknowledgment and no live process to stop"),
    }
}
