//! Test doubles shared by the unit tests.

use crate::provider::{Detection, EmbeddingProvider, ProviderError};
use crate::store::{AttendanceLog, StoreError, StudentStore};
use crate::types::{AttendanceEvent, Embedding, EnrollmentRecord, Student, StudentProfile, Verification};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 7, 30, 0).unwrap()
}

/// Deterministic registry record.
pub fn record(student_id: &str, seed: u8) -> EnrollmentRecord {
    EnrollmentRecord {
        student_id: student_id.to_string(),
        display_name: format!("Student {student_id}"),
        embedding: Embedding {
            values: vec![seed as f32, 1.0, 0.5],
            model: Some("fake".into()),
        },
        reference_image: PathBuf::from(format!("/images/{student_id}/{student_id}_{seed}.png")),
        group_ref: None,
        enrolled_at: t0(),
    }
}

pub fn profile(name: &str) -> StudentProfile {
    StudentProfile {
        name: name.to_string(),
        class_name: "5A".into(),
        shift: "morning".into(),
        age: 10,
        school_unit_id: Some(1),
    }
}

/// A tiny PNG whose bytes are unique per `seed`.
pub fn png(seed: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(4, 4, image::Rgb([seed, 255 - seed, seed / 2]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Provider that recognizes people by the exact bytes of their photos.
#[derive(Default)]
pub struct FakeProvider {
    faces: Mutex<HashMap<Vec<u8>, String>>,
    pairs: Mutex<HashMap<(String, String), f32>>,
    failing: Mutex<HashSet<String>>,
    embed_fails: AtomicBool,
    embed_gate: Mutex<Option<Arc<EmbedGate>>>,
    verify_calls: AtomicUsize,
    verified: Mutex<Vec<String>>,
}

/// Holds `embed` calls until released.
#[derive(Default)]
pub struct EmbedGate {
    pub started: Notify,
    pub release: Notify,
}

impl FakeProvider {
    /// Photos with these bytes show `person`.
    pub fn face(&self, bytes: &[u8], person: &str) {
        self.faces.lock().unwrap().insert(bytes.to_vec(), person.to_string());
    }

    /// A probe of `probe` verifies against references of `reference`.
    pub fn matches(&self, probe: &str, reference: &str, distance: f32) {
        self.pairs
            .lock()
            .unwrap()
            .insert((probe.to_string(), reference.to_string()), distance);
    }

    pub fn fail_verify_against(&self, person: &str) {
        self.failing.lock().unwrap().insert(person.to_string());
    }

    pub fn fail_embed(&self, fail: bool) {
        self.embed_fails.store(fail, Ordering::SeqCst);
    }

    /// Every following `embed` signals `started` and waits for `release`.
    pub fn pause_embed(&self) -> Arc<EmbedGate> {
        let gate = Arc::new(EmbedGate::default());
        *self.embed_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    /// Reference persons in the order they were compared.
    pub fn compared(&self) -> Vec<String> {
        self.verified.lock().unwrap().clone()
    }

    async fn person(&self, path: &Path) -> Result<Option<String>, ProviderError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.faces.lock().unwrap().get(&bytes).cloned())
    }
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    async fn embed(&self, image: &Path, _detection: Detection) -> Result<Option<Embedding>, ProviderError> {
        let gate = self.embed_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.started.notify_one();
            gate.release.notified().await;
        }
        if self.embed_fails.load(Ordering::SeqCst) {
            return Err(ProviderError::Status {
                status: 500,
                body: "model crashed".into(),
            });
        }
        Ok(self.person(image).await?.map(|p| Embedding {
            values: vec![p.len() as f32, 1.0],
            model: Some("fake".into()),
        }))
    }

    async fn verify(&self, probe: &Path, reference: &Path) -> Result<Verification, ProviderError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let probe_person = self.person(probe).await?;
        let reference_person = self.person(reference).await?;
        self.verified
            .lock()
            .unwrap()
            .push(reference_person.clone().unwrap_or_else(|| "?".into()));

        if let Some(r) = &reference_person {
            if self.failing.lock().unwrap().contains(r) {
                return Err(ProviderError::Status {
                    status: 503,
                    body: "busy".into(),
                });
            }
        }

        let distance = match (probe_person, reference_person) {
            (Some(p), Some(r)) => {
                let explicit = self.pairs.lock().unwrap().get(&(p.clone(), r.clone())).copied();
                explicit.or(if p == r { Some(0.2) } else { None })
            }
            _ => None,
        };
        Ok(match distance {
            Some(distance) => Verification { verified: true, distance },
            None => Verification { verified: false, distance: 0.9 },
        })
    }
}

#[derive(Default)]
pub struct MemoryStudentStore {
    rows: Mutex<Vec<Student>>,
    fail_writes: AtomicBool,
    missing_units: Mutex<HashSet<i64>>,
}

impl MemoryStudentStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<Student> {
        self.rows.lock().unwrap().clone()
    }

    /// Rows pointing at `unit` are rejected like a dangling foreign key.
    pub fn missing_unit(&self, unit: i64) {
        self.missing_units.lock().unwrap().insert(unit);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk I/O error".into()));
        }
        Ok(())
    }

    fn check_unit(&self, profile: &StudentProfile) -> Result<(), StoreError> {
        match profile.school_unit_id {
            Some(unit) if self.missing_units.lock().unwrap().contains(&unit) => {
                Err(StoreError::InvalidReference(format!("school unit {unit}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl StudentStore for MemoryStudentStore {
    async fn insert_student(&self, student: &Student) -> Result<(), StoreError> {
        self.check()?;
        self.check_unit(&student.profile)?;
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|s| s.student_id == student.student_id) {
            return Err(StoreError::Conflict(format!("student_id {}", student.student_id)));
        }
        rows.push(student.clone());
        Ok(())
    }

    async fn get_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        Ok(self.rows.lock().unwrap().iter().find(|s| s.student_id == student_id).cloned())
    }

    async fn list_students(&self, school_unit_id: Option<i64>) -> Result<Vec<Student>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|s| school_unit_id.is_none() || s.profile.school_unit_id == school_unit_id)
            .cloned()
            .collect())
    }

    async fn update_profile(&self, student_id: &str, profile: &StudentProfile) -> Result<bool, StoreError> {
        self.check()?;
        self.check_unit(profile)?;
        let mut rows = self.rows.lock().unwrap();
        Ok(match rows.iter_mut().find(|s| s.student_id == student_id) {
            Some(row) => {
                row.profile = profile.clone();
                true
            }
            None => false,
        })
    }

    async fn set_image_path(&self, student_id: &str, image_path: &Path) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        Ok(match rows.iter_mut().find(|s| s.student_id == student_id) {
            Some(row) => {
                row.image_path = image_path.to_path_buf();
                true
            }
            None => false,
        })
    }

    async fn delete_student(&self, student_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|s| s.student_id != student_id);
        Ok(rows.len() != before)
    }
}

#[derive(Default)]
pub struct MemoryAttendanceLog {
    events: Mutex<Vec<AttendanceEvent>>,
    fail_reads: AtomicBool,
}

impl MemoryAttendanceLog {
    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttendanceLog for MemoryAttendanceLog {
    async fn latest_since(
        &self,
        student_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<AttendanceEvent>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("database is locked".into()));
        }
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.student_id == student_id && e.timestamp >= since)
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    async fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        // Yield so concurrent check-then-act callers can interleave.
        tokio::task::yield_now().await;
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}
