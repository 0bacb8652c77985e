//! presenca-core: biometric enrollment and recognition for school attendance.
//!
//! Keeps the student row, the reference photo and the facial embedding
//! consistent, matches live captures against enrolled students through an
//! external embedding provider, and suppresses duplicate check-ins.

pub mod checkin;
pub mod coordinator;
pub mod dedup;
pub mod images;
mod locks;
pub mod matcher;
pub mod provider;
pub mod registry;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use checkin::{CheckIn, CheckInError, CheckInOutcome, NotRecognized};
pub use coordinator::{Coordinator, CoordinatorError, EnrollOutcome, EnrollStage};
pub use dedup::{Admission, AttendanceGate};
pub use images::{ImageError, ImageStore};
pub use matcher::{MatcherError, RecognitionMatcher};
pub use provider::{Detection, EmbeddingProvider, HttpEmbeddingProvider, HttpProviderConfig, ProviderError};
pub use registry::{EmbeddingRegistry, LoadStatus, RegistryError, RegistryView};
pub use store::{AttendanceLog, StoreError, StudentStore};
pub use types::{AttendanceEvent, Embedding, EnrollmentRecord, MatchOutcome, Student, StudentProfile, Verification};
