//! One recognition-and-attendance cycle: probe → match → dedup → record.

use crate::dedup::{Admission, AttendanceGate};
use crate::matcher::{MatcherError, RecognitionMatcher};
use crate::store::StoreError;
use crate::types::{AttendanceEvent, EnrollmentRecord, MatchOutcome};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckInError {
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error("failed to record attendance for {student_id}: {source}")]
    Attendance {
        student_id: String,
        #[source]
        source: StoreError,
    },
}

/// Why a probe did not identify anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotRecognized {
    NoFaceDetected,
    NoRegisteredStudents,
    NoMatch,
}

impl NotRecognized {
    pub fn message(self) -> &'static str {
        match self {
            NotRecognized::NoFaceDetected => "no face detected in the capture",
            NotRecognized::NoRegisteredStudents => "no students are registered for recognition",
            NotRecognized::NoMatch => "no registered student recognized",
        }
    }
}

#[derive(Debug, Clone)]
pub enum CheckInOutcome {
    NotRecognized(NotRecognized),
    Recorded {
        student: EnrollmentRecord,
        distance: f32,
        event: AttendanceEvent,
    },
    AlreadyRecorded {
        student: EnrollmentRecord,
        distance: f32,
        last: AttendanceEvent,
    },
}

pub struct CheckIn {
    matcher: Arc<RecognitionMatcher>,
    gate: Arc<AttendanceGate>,
}

impl CheckIn {
    pub fn new(matcher: Arc<RecognitionMatcher>, gate: Arc<AttendanceGate>) -> Self {
        Self { matcher, gate }
    }

    pub async fn check_in(&self, probe: &[u8], source_ip: Option<&str>) -> Result<CheckInOutcome, CheckInError> {
        let (student, distance) = match self.matcher.recognize(probe).await? {
            MatchOutcome::Matched { record, distance } => (record, distance),
            MatchOutcome::NoFaceDetected => return Ok(CheckInOutcome::NotRecognized(NotRecognized::NoFaceDetected)),
            MatchOutcome::NoRegisteredStudents => {
                return Ok(CheckInOutcome::NotRecognized(NotRecognized::NoRegisteredStudents))
            }
            MatchOutcome::NoMatch => return Ok(CheckInOutcome::NotRecognized(NotRecognized::NoMatch)),
        };

        let admission = self
            .gate
            .admit(&student.student_id, Utc::now(), source_ip)
            .await
            .map_err(|source| CheckInError::Attendance {
                student_id: student.student_id.clone(),
                source,
            })?;

        Ok(match admission {
            Admission::Recorded(event) => CheckInOutcome::Recorded { student, distance, event },
            Admission::Suppressed { last } => CheckInOutcome::AlreadyRecorded { student, distance, last },
        })
    }
}
