//! Wake timers that outlive the process that armed them.
//!
//! Timers live in the `timers` table under a fixed slot id per kind, so
//! arming a slot again replaces the previous timer instead of adding one.
//! The dispatcher in `supervisor.rs` delivers due timers.

use chrono::{SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use geowake_daemon_protocol::{ArmedTimerInfo, Precision};

use crate::db::{Db, TimerRow};

#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    #[error("exact wake timers are not permitted on this platform")]
    ExactDenied,
    #[error("timer store failure: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    FallbackAlarm,
    ProgressWake,
}

impl TimerSlot {
    pub fn id(&self) -> i64 {
        match self {
            TimerSlot::FallbackAlarm => 9001,
            TimerSlot::ProgressWake => 9002,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TimerSlot::FallbackAlarm => "fallback_alarm",
            TimerSlot::ProgressWake => "progress_wake",
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            9001 => Some(TimerSlot::FallbackAlarm),
            9002 => Some(TimerSlot::ProgressWake),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerSpec {
    pub slot: TimerSlot,
    pub trigger_at_ms: i64,
    pub precision: Precision,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArmedTimer {
    pub slot: TimerSlot,
    pub trigger_at_ms: i64,
    pub precision: Precision,
    pub payload: Option<String>,
    pub armed_at: String,
}

impl ArmedTimer {
    pub fn info(&self) -> ArmedTimerInfo {
        ArmedTimerInfo {
            slot: self.slot.id(),
            kind: self.slot.kind().to_string(),
            trigger_at_ms: self.trigger_at_ms,
            precision: self.precision,
        }
    }
}

pub trait AlarmService: Send + Sync {
    fn can_schedule_exact(&self) -> bool;
    /// Arms `spec.slot`, replacing whatever was armed there.
    fn arm(&self, spec: &TimerSpec) -> Result<(), AlarmError>;
    /// Returns whether a timer was removed; cancelling an empty slot is fine.
    fn cancel(&self, slot: TimerSlot) -> Result<bool, AlarmError>;
    fn armed(&self, slot: TimerSlot) -> Result<Option<ArmedTimer>, AlarmError>;
    fn due(&self, now_ms: i64) -> Result<Vec<ArmedTimer>, AlarmError>;
    /// Drops a delivered timer unless its slot was re-armed in the meantime.
    fn retire(&self, timer: &ArmedTimer) -> Result<(), AlarmError>;
}

/// Arms a wake-capable timer, exact when permitted. A refused exact request is
/// retried inexact; the returned precision tells the caller which one stuck.
pub fn arm_with_degrade(
    alarms: &dyn AlarmService,
    slot: TimerSlot,
    trigger_at_ms: i64,
    payload: Option<String>,
) -> Result<Precision, AlarmError> {
    let requested = if alarms.can_schedule_exact() {
        Precision::Exact
    } else {
        Precision::Inexact
    };
    let mut spec = TimerSpec {
        slot,
        trigger_at_ms,
        precision: requested,
        payload,
    };

    match alarms.arm(&spec) {
        Ok(()) => Ok(requested),
        Err(AlarmError::ExactDenied) => {
            warn!(
                slot = slot.kind(),
                "Exact timer refused; degrading to inexact delivery"
            );
            spec.precision = Precision::Inexact;
            alarms.arm(&spec)?;
            Ok(Precision::Inexact)
        }
        Err(err) => Err(err),
    }
}

pub struct SqliteAlarmService {
    db: Arc<Db>,
    exact_permitted: bool,
    sequence: AtomicU64,
}

impl SqliteAlarmService {
    pub fn new(db: Arc<Db>, exact_permitted: bool) -> Self {
        Self {
            db,
            exact_permitted,
            sequence: AtomicU64::new(0),
        }
    }

    fn next_armed_at(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}#{}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            seq
        )
    }
}

impl AlarmService for SqliteAlarmService {
    fn can_schedule_exact(&self) -> bool {
        self.exact_permitted
    }

    fn arm(&self, spec: &TimerSpec) -> Result<(), AlarmError> {
        if spec.precision == Precision::Exact && !self.exact_permitted {
            return Err(AlarmError::ExactDenied);
        }

        let row = TimerRow {
            slot: spec.slot.id(),
            kind: spec.slot.kind().to_string(),
            trigger_at_ms: spec.trigger_at_ms,
            precision: spec.precision.as_str().to_string(),
            payload: spec.payload.clone(),
            armed_at: self.next_armed_at(),
        };
        self.db.upsert_timer(&row).map_err(AlarmError::Store)?;
        debug!(
            slot = spec.slot.kind(),
            trigger_at_ms = spec.trigger_at_ms,
            precision = spec.precision.as_str(),
            "Timer armed"
        );
        Ok(())
    }

    fn cancel(&self, slot: TimerSlot) -> Result<bool, AlarmError> {
        self.db.delete_timer(slot.id()).map_err(AlarmError::Store)
    }

    fn armed(&self, slot: TimerSlot) -> Result<Option<ArmedTimer>, AlarmError> {
        let row = self.db.get_timer(slot.id()).map_err(AlarmError::Store)?;
        Ok(row.and_then(armed_from_row))
    }

    fn due(&self, now_ms: i64) -> Result<Vec<ArmedTimer>, AlarmError> {
        let rows = self.db.due_timers(now_ms).map_err(AlarmError::Store)?;
        Ok(rows.into_iter().filter_map(armed_from_row).collect())
    }

    fn retire(&self, timer: &ArmedTimer) -> Result<(), AlarmError> {
        let row = TimerRow {
            slot: timer.slot.id(),
            kind: timer.slot.kind().to_string(),
            trigger_at_ms: timer.trigger_at_ms,
            precision: timer.precision.as_str().to_string(),
            payload: timer.payload.clone(),
            armed_at: timer.armed_at.clone(),
        };
        self.db
            .delete_fired_timer(&row)
            .map(|_| ())
            .map_err(AlarmError::Store)
    }
}

fn armed_from_row(row: TimerRow) -> Option<ArmedTimer> {
    let slot = match TimerSlot::from_id(row.slot) {
        Some(slot) => slot,
        None => {
            warn!(slot = row.slot, kind = %row.kind, "Ignoring timer in unknown slot");
            return None;
        }
    };
    let precision = row.precision.parse().unwrap_or(Precision::Inexact);
    Some(ArmedTimer {
        slot,
        trigger_at_ms: row.trigger_at_ms,
        precision,
        payload: row.payload,
        armed_at: row.armed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(exact_permitted: bool) -> (tempfile::TempDir, SqliteAlarmService) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(temp_dir.path().join("state.db")).expect("db init");
        (temp_dir, SqliteAlarmService::new(Arc::new(db), exact_permitted))
    }

    #[test]
    fn arms_exact_when_permitted() {
        let (_temp_dir, alarms) = service(true);
        let precision =
            arm_with_degrade(&alarms, TimerSlot::FallbackAlarm, 5_000, None).expect("arm");
        assert_eq!(precision, Precision::Exact);
        let armed = alarms
            .armed(TimerSlot::FallbackAlarm)
            .expect("armed")
            .expect("timer present");
        assert_eq!(armed.precision, Precision::Exact);
        assert_eq!(armed.trigger_at_ms, 5_000);
    }

    #[test]
    fn degrades_to_inexact_when_exact_refused() {
        let (_temp_dir, alarms) = service(false);
        let precision =
            arm_with_degrade(&alarms, TimerSlot::ProgressWake, 5_000, None).expect("arm");
        assert_eq!(precision, Precision::Inexact);
        assert!(alarms.armed(TimerSlot::ProgressWake).expect("armed").is_some());
    }

    #[test]
    fn raw_exact_arm_is_refused_without_permission() {
        let (_temp_dir, alarms) = service(false);
        let spec = TimerSpec {
            slot: TimerSlot::FallbackAlarm,
            trigger_at_ms: 1_000,
            precision: Precision::Exact,
            payload: None,
        };
        assert!(matches!(alarms.arm(&spec), Err(AlarmError::ExactDenied)));
        assert!(alarms.armed(TimerSlot::FallbackAlarm).expect("armed").is_none());
    }

    #[test]
    fn retire_skips_timer_rearmed_after_delivery() {
        let (_temp_dir, alarms) = service(true);
        arm_with_degrade(&alarms, TimerSlot::ProgressWake, 1_000, None).expect("arm");
        let due = alarms.due(1_000).expect("due");
        assert_eq!(due.len(), 1);

        arm_with_degrade(&alarms, TimerSlot::ProgressWake, 61_000, None).expect("rearm");
        alarms.retire(&due[0]).expect("retire");

        let armed = alarms
            .armed(TimerSlot::ProgressWake)
            .expect("armed")
            .expect("rearmed timer kept");
        assert_eq!(armed.trigger_at_ms, 61_000);
    }

    #[test]
    fn retire_removes_delivered_timer() {
        let (_temp_dir, alarms) = service(true);
        arm_with_degrade(&alarms, TimerSlot::FallbackAlarm, 1_000, None).expect("arm");
        let due = alarms.due(2_000).expect("due");
        alarms.retire(&due[0]).expect("retire");
        assert!(alarms.armed(TimerSlot::FallbackAlarm).expect("armed").is_none());
    }
}
