//! Typed view over the persisted tracking session.
//!
//! Each field lives under its own key and is written independently. Callers
//! must assume any sequence of writes can be interrupted between two fields,
//! and that another component may have changed a field since it was read.

use fs_err as fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use geowake_daemon_protocol::{ProgressPayload, TrackingSession};

use crate::db::Db;

const SESSION_FILE_NAME: &str = "tracking_session.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionField {
    TrackingActive,
    Suppressed,
    ProgressPayload,
    ResumePending,
    WakeIntervalMs,
    EndSignalRaised,
    EndAckReceived,
    SessionJson,
}

impl SessionField {
    pub fn key(&self) -> &'static str {
        match self {
            SessionField::TrackingActive => "tracking_active_v1",
            SessionField::Suppressed => "gw_progress_suppressed_v1",
            SessionField::ProgressPayload => "gw_progress_payload_v1",
            SessionField::ResumePending => "tracking_resume_pending_v1",
            SessionField::WakeIntervalMs => "progress_wake_interval_ms",
            SessionField::EndSignalRaised => "native_end_tracking_signal_v1",
            SessionField::EndAckReceived => "native_end_tracking_ack_v1",
            SessionField::SessionJson => "tracking_session_json_v1",
        }
    }
}

pub struct SessionStore {
    db: Arc<Db>,
    mirror_dirs: Vec<PathBuf>,
}

impl SessionStore {
    pub fn new(db: Arc<Db>, mirror_dirs: Vec<PathBuf>) -> Self {
        Self { db, mirror_dirs }
    }

    pub fn get(&self, field: SessionField) -> Result<Option<String>, String> {
        self.db.get_value(field.key())
    }

    pub fn set(&self, field: SessionField, value: &str) -> Result<(), String> {
        self.db.set_value(field.key(), value)
    }

    pub fn remove(&self, field: SessionField) -> Result<(), String> {
        self.db.remove_value(field.key())
    }

    fn get_bool(&self, field: SessionField) -> Result<bool, String> {
        Ok(matches!(self.get(field)?.as_deref(), Some("true")))
    }

    fn set_bool(&self, field: SessionField, value: bool) -> Result<(), String> {
        self.set(field, if value { "true" } else { "false" })
    }

    pub fn is_active(&self) -> Result<bool, String> {
        self.get_bool(SessionField::TrackingActive)
    }

    pub fn set_active(&self, active: bool) -> Result<(), String> {
        self.set_bool(SessionField::TrackingActive, active)
    }

    pub fn is_suppressed(&self) -> Result<bool, String> {
        self.get_bool(SessionField::Suppressed)
    }

    pub fn set_suppressed(&self, suppressed: bool) -> Result<(), String> {
        debug!(suppressed, "Marking progress suppression");
        self.set_bool(SessionField::Suppressed, suppressed)
    }

    pub fn is_resume_pending(&self) -> Result<bool, String> {
        self.get_bool(SessionField::ResumePending)
    }

    pub fn set_resume_pending(&self, pending: bool) -> Result<(), String> {
        self.set_bool(SessionField::ResumePending, pending)
    }

    /// An unreadable payload is treated as absent rather than an error.
    pub fn progress_payload(&self) -> Result<Option<ProgressPayload>, String> {
        let raw = match self.get(SessionField::ProgressPayload)? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str::<ProgressPayload>(&raw) {
            Ok(payload) => Ok(Some(payload)),
            Err(err) => {
                warn!(error = %err, "Ignoring malformed cached progress payload");
                Ok(None)
            }
        }
    }

    pub fn set_progress_payload(&self, payload: &ProgressPayload) -> Result<(), String> {
        let raw = serde_json::to_string(payload)
            .map_err(|err| format!("Failed to serialize progress payload: {}", err))?;
        self.set(SessionField::ProgressPayload, &raw)
    }

    pub fn clear_progress_payload(&self) -> Result<(), String> {
        self.remove(SessionField::ProgressPayload)
    }

    pub fn wake_interval_ms(&self) -> Result<Option<u64>, String> {
        Ok(self
            .get(SessionField::WakeIntervalMs)?
            .and_then(|raw| raw.parse::<u64>().ok())
            .filter(|interval| *interval > 0))
    }

    pub fn set_wake_interval_ms(&self, interval_ms: u64) -> Result<(), String> {
        self.set(SessionField::WakeIntervalMs, &interval_ms.to_string())
    }

    pub fn clear_wake_interval(&self) -> Result<(), String> {
        self.remove(SessionField::WakeIntervalMs)
    }

    pub fn end_signal_raised(&self) -> Result<bool, String> {
        self.get_bool(SessionField::EndSignalRaised)
    }

    pub fn set_end_signal(&self, raised: bool) -> Result<(), String> {
        debug!(raised, "Setting native end-tracking signal");
        self.set_bool(SessionField::EndSignalRaised, raised)
    }

    /// Reads and lowers the one-shot end signal.
    pub fn take_end_signal(&self) -> Result<bool, String> {
        let raised = self.end_signal_raised()?;
        if raised {
            self.set_end_signal(false)?;
        }
        Ok(raised)
    }

    pub fn end_ack_received(&self) -> Result<bool, String> {
        self.get_bool(SessionField::EndAckReceived)
    }

    pub fn mark_end_ack(&self) -> Result<(), String> {
        self.set_bool(SessionField::EndAckReceived, true)
    }

    pub fn clear_end_ack(&self) -> Result<(), String> {
        self.remove(SessionField::EndAckReceived)
    }

    /// Resets the session fields that describe a running journey, plus every
    /// mirrored session file. Suppression and the end handshake flags are left
    /// alone. Every step is attempted; failures are reported together.
    pub fn clear_session_fields(&self) -> Result<(), String> {
        debug!("Clearing tracking session fields and mirrored files");
        let mut errors = Vec::new();

        if let Err(err) = self.set_active(false) {
            errors.push(err);
        }
        if let Err(err) = self.set_resume_pending(false) {
            errors.push(err);
        }
        if let Err(err) = self.clear_progress_payload() {
            errors.push(err);
        }
        if let Err(err) = self.remove(SessionField::SessionJson) {
            errors.push(err);
        }
        for dir in &self.mirror_dirs {
            if let Err(err) = delete_if_exists(dir.join(SESSION_FILE_NAME)) {
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    pub fn snapshot(&self) -> Result<TrackingSession, String> {
        Ok(TrackingSession {
            active: self.is_active()?,
            suppressed: self.is_suppressed()?,
            progress_payload: self.progress_payload()?,
            resume_pending: self.is_resume_pending()?,
            wake_interval_ms: self.wake_interval_ms()?,
            end_ack_signal_raised: self.end_signal_raised()?,
            end_ack_received: self.end_ack_received()?,
        })
    }
}

fn delete_if_exists(path: PathBuf) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_file(&path)
        .map_err(|err| format!("Failed to delete {}: {}", path.display(), err))?;
    debug!(path = %path.display(), "Deleted mirrored session file");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_mirrors(mirrors: Vec<PathBuf>) -> (tempfile::TempDir, SessionStore) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, SessionStore::new(Arc::new(db), mirrors))
    }

    #[test]
    fn fresh_store_has_default_session() {
        let (_temp_dir, store) = store_with_mirrors(Vec::new());
        assert_eq!(store.snapshot().expect("snapshot"), TrackingSession::default());
    }

    #[test]
    fn payload_round_trips_and_clears() {
        let (_temp_dir, store) = store_with_mirrors(Vec::new());
        let payload = ProgressPayload::new("To Central Station", "4.2 km left", 0.4);
        store.set_progress_payload(&payload).expect("set payload");
        assert_eq!(store.progress_payload().expect("payload"), Some(payload));

        store.clear_progress_payload().expect("clear");
        store.clear_progress_payload().expect("clear again");
        assert_eq!(store.progress_payload().expect("payload"), None);
    }

    #[test]
    fn malformed_payload_reads_as_absent() {
        let (_temp_dir, store) = store_with_mirrors(Vec::new());
        store
            .set(SessionField::ProgressPayload, "{not json")
            .expect("set raw");
        assert_eq!(store.progress_payload().expect("payload"), None);
    }

    #[test]
    fn zero_interval_reads_as_absent() {
        let (_temp_dir, store) = store_with_mirrors(Vec::new());
        store.set_wake_interval_ms(0).expect("set interval");
        assert_eq!(store.wake_interval_ms().expect("interval"), None);
    }

    #[test]
    fn take_end_signal_is_one_shot() {
        let (_temp_dir, store) = store_with_mirrors(Vec::new());
        store.set_end_signal(true).expect("raise");
        assert!(store.take_end_signal().expect("take"));
        assert!(!store.take_end_signal().expect("take again"));
    }

    #[test]
    fn clear_session_fields_keeps_suppression_and_removes_mirrors() {
        let mirror = tempfile::tempdir().expect("mirror dir");
        let mirror_file = mirror.path().join(SESSION_FILE_NAME);
        fs::write(&mirror_file, "{}").expect("write mirror");
        let (_temp_dir, store) = store_with_mirrors(vec![
            mirror.path().to_path_buf(),
            mirror.path().join("missing"),
        ]);

        store.set_active(true).expect("active");
        store.set_resume_pending(true).expect("resume");
        store.set_suppressed(true).expect("suppress");
        store
            .set(SessionField::SessionJson, r#"{"route":"r1"}"#)
            .expect("session json");
        store
            .set_progress_payload(&ProgressPayload::new("t", "s", 0.5))
            .expect("payload");

        store.clear_session_fields().expect("clear");

        let session = store.snapshot().expect("snapshot");
        assert!(!session.active);
        assert!(!session.resume_pending);
        assert!(session.suppressed);
        assert_eq!(session.progress_payload, None);
        assert_eq!(store.get(SessionField::SessionJson).expect("json"), None);
        assert!(!mirror_file.exists());
    }
}
