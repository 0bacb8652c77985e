//! Attendance dedup gate. One counted check-in per student per cooldown window.

use crate::store::{AttendanceLog, StoreError};
use crate::types::AttendanceEvent;
use crate::locks::KeyedLocks;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const DEFAULT_COOLDOWN_MINUTES: i64 = 30;

/// Outcome of [`AttendanceGate::admit`].
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Recorded(AttendanceEvent),
    /// An event inside the cooldown window already exists.
    Suppressed { last: AttendanceEvent },
}

pub struct AttendanceGate {
    log: Arc<dyn AttendanceLog>,
    cooldown: Duration,
    /// Per-student locks for `admit`.
    inflight: KeyedLocks,
}

impl AttendanceGate {
    pub fn new(log: Arc<dyn AttendanceLog>, cooldown: Duration) -> Self {
        Self {
            log,
            cooldown,
            inflight: KeyedLocks::default(),
        }
    }

    pub fn with_default_cooldown(log: Arc<dyn AttendanceLog>) -> Self {
        Self::new(log, Duration::minutes(DEFAULT_COOLDOWN_MINUTES))
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    async fn last_within(&self, student_id: &str, now: DateTime<Utc>) -> Result<Option<AttendanceEvent>, StoreError> {
        self.log.latest_since(student_id, now - self.cooldown).await
    }

    /// `true` unless an event for `student_id` exists at or after `now - cooldown`.
    ///
    /// Not atomic with [`record`](Self::record); use [`admit`](Self::admit)
    /// when two requests for the same student may race.
    pub async fn should_record(&self, student_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.last_within(student_id, now).await?.is_none())
    }

    /// Append a new attendance event.
    pub async fn record(
        &self,
        student_id: &str,
        now: DateTime<Utc>,
        source_ip: Option<&str>,
    ) -> Result<AttendanceEvent, StoreError> {
        let event = AttendanceEvent {
            student_id: student_id.to_string(),
            timestamp: now,
            source_ip: source_ip.map(str::to_string),
        };
        self.log.append_event(&event).await?;
        tracing::info!(student_id, source_ip, timestamp = %now, "attendance recorded");
        Ok(event)
    }

    /// Check and record under a per-student lock, so concurrent check-ins
    /// of one student in this process count at most once per window.
    pub async fn admit(
        &self,
        student_id: &str,
        now: DateTime<Utc>,
        source_ip: Option<&str>,
    ) -> Result<Admission, StoreError> {
        let _held = self.inflight.lock(student_id).await;
        match self.last_within(student_id, now).await? {
            Some(last) => {
                tracing::info!(
                    student_id,
                    last = %last.timestamp,
                    "attendance suppressed inside cooldown"
                );
                Ok(Admission::Suppressed { last })
            }
            None => self.record(student_id, now, source_ip).await.map(Admission::Recorded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{t0, MemoryAttendanceLog};

    fn gate() -> (Arc<MemoryAttendanceLog>, AttendanceGate) {
        let log = Arc::new(MemoryAttendanceLog::default());
        let gate = AttendanceGate::with_default_cooldown(log.clone());
        (log, gate)
    }

    #[tokio::test]
    async fn test_cooldown_boundaries() {
        let (_log, gate) = gate();
        let cooldown = gate.cooldown();
        gate.record("X", t0(), None).await.unwrap();

        let just_inside = t0() + cooldown - Duration::seconds(1);
        let just_outside = t0() + cooldown + Duration::seconds(1);
        assert!(!gate.should_record("X", just_inside).await.unwrap());
        assert!(gate.should_record("X", just_outside).await.unwrap());
        assert!(gate.should_record("Y", just_inside).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_record_creates_nothing() {
        let (log, gate) = gate();
        assert!(gate.should_record("X", t0()).await.unwrap());
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_admit_records_then_suppresses() {
        let (log, gate) = gate();

        let first = gate.admit("X", t0(), Some("10.0.0.7")).await.unwrap();
        let Admission::Recorded(event) = first else {
            panic!("expected first check-in to record");
        };
        assert_eq!(event.source_ip.as_deref(), Some("10.0.0.7"));

        let second = gate.admit("X", t0() + Duration::minutes(5), None).await.unwrap();
        assert_eq!(second, Admission::Suppressed { last: event });

        let later = gate.admit("X", t0() + Duration::minutes(31), None).await.unwrap();
        assert!(matches!(later, Admission::Recorded(_)));
        assert_eq!(log.events().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_admit_records_once() {
        let (log, gate) = gate();
        let (a, b) = tokio::join!(gate.admit("X", t0(), None), gate.admit("X", t0(), None));
        let recorded = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|r| matches!(r, Admission::Recorded(_)))
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(log.events().len(), 1);
        assert_eq!(gate.inflight.len(), 0);
    }

    #[tokio::test]
    async fn test_admit_store_error_releases_student_lock() {
        let (log, gate) = gate();
        log.fail_reads(true);
        assert!(gate.admit("X", t0(), None).await.is_err());
        assert_eq!(gate.inflight.len(), 0);

        log.fail_reads(false);
        let admitted = gate.admit("X", t0(), None).await.unwrap();
        assert!(matches!(admitted, Admission::Recorded(_)));
    }
}
