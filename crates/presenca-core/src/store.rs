//! Relational store interfaces consumed by the core.
//!
//! The SQLite implementation lives in `presenca-store`.

use crate::types::{AttendanceEvent, Student, StudentProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// A unique key already exists.
    #[error("conflict on {0}")]
    Conflict(String),
    /// A referenced row (e.g. a school unit) does not exist.
    #[error("unknown {0}")]
    InvalidReference(String),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Student rows.
#[async_trait]
pub trait StudentStore: Send + Sync {
    /// Insert a new student. Fails with [`StoreError::Conflict`] on a duplicate id.
    async fn insert_student(&self, student: &Student) -> Result<(), StoreError>;

    async fn get_student(&self, student_id: &str) -> Result<Option<Student>, StoreError>;

    async fn list_students(&self, school_unit_id: Option<i64>) -> Result<Vec<Student>, StoreError>;

    /// Returns `false` if no such student.
    async fn update_profile(&self, student_id: &str, profile: &StudentProfile) -> Result<bool, StoreError>;

    /// Returns `false` if no such student.
    async fn set_image_path(&self, student_id: &str, image_path: &Path) -> Result<bool, StoreError>;

    /// Returns `false` if no such student.
    async fn delete_student(&self, student_id: &str) -> Result<bool, StoreError>;
}

/// Attendance history, append-only.
#[async_trait]
pub trait AttendanceLog: Send + Sync {
    /// Most recent event for `student_id` at or after `since`.
    async fn latest_since(
        &self,
        student_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceEvent>, StoreError>;

    async fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError>;
}
