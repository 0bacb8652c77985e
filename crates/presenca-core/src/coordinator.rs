//! Consistency coordinator: keeps the student row, the reference photo and
//! the registry entry moving together.
//!
//! There is no transaction spanning the three stores. Each operation runs
//! its steps in a fixed order with compensating actions, and the partial
//! states it can leave behind are named by [`EnrollStage`] and reported to
//! the caller instead of being retried automatically.

use crate::images::{ImageError, ImageStore};
use crate::locks::KeyedLocks;
use crate::provider::{Detection, EmbeddingProvider};
use crate::registry::{EmbeddingRegistry, RegistryError};
use crate::store::{StoreError, StudentStore};
use crate::types::{EnrollmentRecord, Student, StudentProfile};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("student {0} already exists")]
    Conflict(String),
    #[error("student {0} not found")]
    NotFound(String),
    /// The profile points at something that does not exist.
    #[error("invalid profile for student {student_id}: {reason}")]
    InvalidProfile { student_id: String, reason: String },
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("{operation} failed for student {student_id}: {source}")]
    Persistence {
        student_id: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Furthest step an enrollment-like operation reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollStage {
    ImageStored,
    Registered,
    Embedded,
    Committed,
}

#[derive(Debug, Clone)]
pub enum EnrollOutcome {
    /// The student is recognizable.
    Committed(EnrollmentRecord),
    /// Student row and photo exist but the student cannot be matched yet.
    /// Needs operator follow-up (new photo or [`Coordinator::reembed`]).
    NotRecognizable {
        student: Student,
        stage: EnrollStage,
        reason: String,
    },
}

impl EnrollOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, EnrollOutcome::Committed(_))
    }

    pub fn stage(&self) -> EnrollStage {
        match self {
            EnrollOutcome::Committed(_) => EnrollStage::Committed,
            EnrollOutcome::NotRecognizable { stage, .. } => *stage,
        }
    }
}

pub struct Coordinator {
    registry: Arc<EmbeddingRegistry>,
    students: Arc<dyn StudentStore>,
    images: ImageStore,
    provider: Arc<dyn EmbeddingProvider>,
    /// Serializes every operation on one student.
    students_busy: KeyedLocks,
}

impl Coordinator {
    pub fn new(
        registry: Arc<EmbeddingRegistry>,
        students: Arc<dyn StudentStore>,
        images: ImageStore,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            registry,
            students,
            images,
            provider,
            students_busy: KeyedLocks::default(),
        }
    }

    pub fn registry(&self) -> &Arc<EmbeddingRegistry> {
        &self.registry
    }

    /// Store the photo, insert the student row, embed, commit to the registry.
    pub async fn enroll(
        &self,
        student_id: &str,
        profile: StudentProfile,
        photo: &[u8],
    ) -> Result<EnrollOutcome, CoordinatorError> {
        let _busy = self.students_busy.lock(student_id).await;
        let image_path = self.images.save(student_id, photo).await?;
        tracing::debug!(student_id, stage = ?EnrollStage::ImageStored, "enroll");

        let student = Student {
            student_id: student_id.to_string(),
            profile,
            image_path,
        };
        if let Err(e) = self.students.insert_student(&student).await {
            self.discard_image(student_id, &student.image_path).await;
            return Err(match e {
                StoreError::Conflict(_) => CoordinatorError::Conflict(student_id.to_string()),
                StoreError::InvalidReference(what) => CoordinatorError::InvalidProfile {
                    student_id: student_id.to_string(),
                    reason: format!("unknown {what}"),
                },
                source => CoordinatorError::Persistence {
                    student_id: student_id.to_string(),
                    operation: "insert student",
                    source,
                },
            });
        }
        tracing::info!(student_id, name = %student.profile.name, "student registered");

        Ok(self.embed_and_commit(student).await)
    }

    /// Swap a student's photo and embedding.
    ///
    /// The old registry entry and photo are removed before the new photo is
    /// written, so the student is unmatchable until the new embedding commits.
    pub async fn replace_photo(&self, student_id: &str, photo: &[u8]) -> Result<EnrollOutcome, CoordinatorError> {
        self.images.check(photo)?;
        let _busy = self.students_busy.lock(student_id).await;
        let student = self.require_student(student_id).await?;

        let previous = self.registry.get(student_id);
        self.registry.remove(student_id).await?;

        self.discard_image(student_id, &student.image_path).await;
        if let Some(prev) = previous.filter(|p| p.reference_image != student.image_path) {
            self.discard_image(student_id, &prev.reference_image).await;
        }

        let image_path = self.images.save(student_id, photo).await?;
        match self.students.set_image_path(student_id, &image_path).await {
            Ok(true) => {}
            Ok(false) => {
                self.discard_image(student_id, &image_path).await;
                return Err(CoordinatorError::NotFound(student_id.to_string()));
            }
            Err(source) => {
                self.discard_image(student_id, &image_path).await;
                return Err(CoordinatorError::Persistence {
                    student_id: student_id.to_string(),
                    operation: "update photo path",
                    source,
                });
            }
        }
        tracing::info!(student_id, path = %image_path.display(), "photo replaced");

        let student = Student { image_path, ..student };
        Ok(self.embed_and_commit(student).await)
    }

    /// Recompute the embedding from the stored photo. Operator remediation
    /// for students left [`EnrollOutcome::NotRecognizable`].
    pub async fn reembed(&self, student_id: &str) -> Result<EnrollOutcome, CoordinatorError> {
        let _busy = self.students_busy.lock(student_id).await;
        let student = self.require_student(student_id).await?;
        Ok(self.embed_and_commit(student).await)
    }

    /// Update non-biometric fields in the student row and the registry.
    pub async fn update_profile(&self, student_id: &str, profile: StudentProfile) -> Result<(), CoordinatorError> {
        let _busy = self.students_busy.lock(student_id).await;
        let updated = self
            .students
            .update_profile(student_id, &profile)
            .await
            .map_err(|source| match source {
                StoreError::InvalidReference(what) => CoordinatorError::InvalidProfile {
                    student_id: student_id.to_string(),
                    reason: format!("unknown {what}"),
                },
                source => CoordinatorError::Persistence {
                    student_id: student_id.to_string(),
                    operation: "update student",
                    source,
                },
            })?;
        if !updated {
            return Err(CoordinatorError::NotFound(student_id.to_string()));
        }
        self.registry
            .update_profile(student_id, &profile.name, profile.school_unit_id)
            .await?;
        Ok(())
    }

    /// Remove a student: registry first, then photo, then the row.
    pub async fn remove(&self, student_id: &str) -> Result<(), CoordinatorError> {
        let _busy = self.students_busy.lock(student_id).await;
        let student = self.students.get_student(student_id).await.map_err(|source| {
            CoordinatorError::Persistence {
                student_id: student_id.to_string(),
                operation: "load student",
                source,
            }
        })?;
        let previous = self.registry.get(student_id);

        let was_enrolled = self.registry.remove(student_id).await?;

        let mut photos: Vec<PathBuf> = Vec::new();
        photos.extend(student.as_ref().map(|s| s.image_path.clone()));
        photos.extend(previous.map(|p| p.reference_image));
        photos.dedup();
        for photo in &photos {
            self.discard_image(student_id, photo).await;
        }

        let deleted = self
            .students
            .delete_student(student_id)
            .await
            .map_err(|source| CoordinatorError::Persistence {
                student_id: student_id.to_string(),
                operation: "delete student",
                source,
            })?;
        if !deleted && !was_enrolled {
            return Err(CoordinatorError::NotFound(student_id.to_string()));
        }
        tracing::info!(student_id, "student removed");
        Ok(())
    }

    /// Students with a row but no registry entry.
    pub async fn unrecognizable(&self) -> Result<Vec<Student>, StoreError> {
        let view = self.registry.all();
        let students = self.students.list_students(None).await?;
        Ok(students
            .into_iter()
            .filter(|s| !view.contains(&s.student_id))
            .collect())
    }

    async fn require_student(&self, student_id: &str) -> Result<Student, CoordinatorError> {
        self.students
            .get_student(student_id)
            .await
            .map_err(|source| CoordinatorError::Persistence {
                student_id: student_id.to_string(),
                operation: "load student",
                source,
            })?
            .ok_or_else(|| CoordinatorError::NotFound(student_id.to_string()))
    }

    async fn embed_and_commit(&self, student: Student) -> EnrollOutcome {
        let student_id = student.student_id.as_str();
        let embedding = match self.provider.embed(&student.image_path, Detection::Strict).await {
            Ok(Some(embedding)) if !embedding.is_empty() => embedding,
            Ok(_) => {
                tracing::warn!(student_id, "no face in reference photo; student not recognizable");
                return not_recognizable(student, EnrollStage::Registered, "no face detected in reference photo".into());
            }
            Err(e) => {
                tracing::warn!(student_id, error = %e, "embedding failed; student not recognizable");
                return not_recognizable(student, EnrollStage::Registered, format!("embedding provider failed: {e}"));
            }
        };

        let record = EnrollmentRecord {
            student_id: student.student_id.clone(),
            display_name: student.profile.name.clone(),
            embedding,
            reference_image: student.image_path.clone(),
            group_ref: student.profile.school_unit_id,
            enrolled_at: Utc::now(),
        };

        match self.commit(record.clone()).await {
            Ok(()) => {
                tracing::info!(student_id, "student recognizable");
                EnrollOutcome::Committed(record)
            }
            Err(e) => {
                tracing::error!(
                    student_id,
                    error = %e,
                    "registry commit failed; student registered but not recognizable"
                );
                not_recognizable(student, EnrollStage::Embedded, e.to_string())
            }
        }
    }

    /// Append, or overwrite a stale entry left under the same id.
    async fn commit(&self, record: EnrollmentRecord) -> Result<(), RegistryError> {
        match self.registry.append(record.clone()).await {
            Err(RegistryError::DuplicateStudent(id)) => {
                tracing::warn!(student_id = %id, "replacing existing registry entry");
                self.registry
                    .update_profile(&id, &record.display_name, record.group_ref)
                    .await?;
                self.registry.replace(&id, record).await
            }
            other => other,
        }
    }

    /// Best-effort photo removal; failures are logged only.
    async fn discard_image(&self, student_id: &str, path: &Path) {
        if let Err(e) = self.images.delete(path).await {
            tracing::warn!(student_id, path = %path.display(), error = %e, "failed to delete photo");
        }
    }
}

fn not_recognizable(student: Student, stage: EnrollStage, reason: String) -> EnrollOutcome {
    EnrollOutcome::NotRecognizable { student, stage, reason }
}
