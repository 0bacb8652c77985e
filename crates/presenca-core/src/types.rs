use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Face embedding as returned by the provider. Compared only by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "ArcFace").
    pub model: Option<String>,
}

impl Embedding {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One enrolled, matchable student.
///
/// `embedding` and `reference_image` always come from the same upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub student_id: String,
    pub display_name: String,
    pub embedding: Embedding,
    pub reference_image: PathBuf,
    /// School unit the student belongs to, carried for filtering only.
    pub group_ref: Option<i64>,
    pub enrolled_at: DateTime<Utc>,
}

/// Editable, non-biometric student fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub name: String,
    pub class_name: String,
    pub shift: String,
    pub age: u32,
    pub school_unit_id: Option<i64>,
}

/// A student row as kept by the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: String,
    #[serde(flatten)]
    pub profile: StudentProfile,
    pub image_path: PathBuf,
}

/// Append-only attendance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub student_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_ip: Option<String>,
}

/// Provider judgment for a pair of images.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub verified: bool,
    /// Provider-defined distance. Lower = more similar.
    pub distance: f32,
}

/// Result of matching a probe image against the registry.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    NoFaceDetected,
    NoRegisteredStudents,
    NoMatch,
    Matched {
        record: EnrollmentRecord,
        distance: f32,
    },
}

impl MatchOutcome {
    /// Stable machine-readable tag, used in API responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MatchOutcome::NoFaceDetected => "no_face_detected",
            MatchOutcome::NoRegisteredStudents => "no_registered_students",
            MatchOutcome::NoMatch => "no_match",
            MatchOutcome::Matched { .. } => "matched",
        }
    }
}
