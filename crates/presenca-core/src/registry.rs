//! Embedding registry: the set of matchable students.
//!
//! The live collection is an immutable, generation-stamped [`RegistryView`]
//! behind an `Arc`. Writers are serialized, build the next collection off to
//! the side, persist it as a whole-file JSON snapshot, and only then publish
//! it with a pointer swap. Readers clone the `Arc` and scan without holding
//! any lock, so they never observe a half-applied mutation, and a failed
//! snapshot leaves memory exactly as it was on disk.

use crate::types::EnrollmentRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("student {0} is already enrolled")]
    DuplicateStudent(String),
    #[error("student {0} is not enrolled")]
    NotFound(String),
    #[error("failed to persist registry snapshot {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk envelope.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    generation: u64,
    records: Vec<EnrollmentRecord>,
}

/// What `load()` found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    /// No snapshot yet; started empty.
    Fresh,
    Loaded { records: usize },
    /// The snapshot was unreadable; started empty. Enrollments may be lost.
    Recovered {
        reason: String,
        backup: Option<PathBuf>,
    },
}

/// Point-in-time, read-only view of the registry.
///
/// Cheap to clone; iterate it as many times as needed.
#[derive(Debug, Clone, Default)]
pub struct RegistryView {
    generation: u64,
    records: Arc<Vec<EnrollmentRecord>>,
}

impl RegistryView {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EnrollmentRecord> {
        self.records.iter()
    }

    pub fn get(&self, student_id: &str) -> Option<&EnrollmentRecord> {
        self.records.iter().find(|r| r.student_id == student_id)
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.get(student_id).is_some()
    }
}

impl<'a> IntoIterator for &'a RegistryView {
    type Item = &'a EnrollmentRecord;
    type IntoIter = std::slice::Iter<'a, EnrollmentRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct EmbeddingRegistry {
    snapshot_path: PathBuf,
    current: RwLock<RegistryView>,
    writer: tokio::sync::Mutex<()>,
}

impl EmbeddingRegistry {
    /// Open the registry backed by `snapshot_path`.
    ///
    /// Never fails: a missing snapshot starts empty, a corrupt one is moved
    /// aside and also starts empty. Callers should surface
    /// [`LoadStatus::Recovered`] as a startup warning.
    pub fn load(snapshot_path: impl Into<PathBuf>) -> (Self, LoadStatus) {
        let snapshot_path = snapshot_path.into();
        let (view, status) = match fs::read(&snapshot_path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) if snapshot.format == SNAPSHOT_FORMAT => {
                    let records = sanitize(snapshot.records);
                    let count = records.len();
                    let view = RegistryView {
                        generation: snapshot.generation,
                        records: Arc::new(records),
                    };
                    (view, LoadStatus::Loaded { records: count })
                }
                Ok(snapshot) => {
                    let reason = format!("unsupported snapshot format {}", snapshot.format);
                    (RegistryView::default(), recover(&snapshot_path, reason))
                }
                Err(e) => (RegistryView::default(), recover(&snapshot_path, e.to_string())),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %snapshot_path.display(),
                    "no registry snapshot; starting empty"
                );
                (RegistryView::default(), LoadStatus::Fresh)
            }
            Err(e) => {
                tracing::warn!(
                    path = %snapshot_path.display(),
                    error = %e,
                    "registry snapshot unreadable; starting empty"
                );
                let status = LoadStatus::Recovered {
                    reason: e.to_string(),
                    backup: None,
                };
                (RegistryView::default(), status)
            }
        };

        if let LoadStatus::Loaded { records } = &status {
            tracing::info!(
                path = %snapshot_path.display(),
                records,
                generation = view.generation,
                "registry loaded"
            );
        }

        let registry = Self {
            snapshot_path,
            current: RwLock::new(view),
            writer: tokio::sync::Mutex::new(()),
        };
        (registry, status)
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Current consistent view for scanning.
    pub fn all(&self) -> RegistryView {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, student_id: &str) -> Option<EnrollmentRecord> {
        self.all().get(student_id).cloned()
    }

    /// Add a new record. Fails without touching anything if the id exists.
    pub async fn append(&self, record: EnrollmentRecord) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.all();
        if current.contains(&record.student_id) {
            return Err(RegistryError::DuplicateStudent(record.student_id));
        }

        let student_id = record.student_id.clone();
        let mut next = current.records.as_ref().clone();
        next.push(record);
        self.commit(&current, next).await?;
        tracing::info!(student_id = %student_id, "registry: appended");
        Ok(())
    }

    /// Swap the embedding and reference image of an existing record.
    ///
    /// Every other field of `new_record` is ignored.
    pub async fn replace(&self, student_id: &str, new_record: EnrollmentRecord) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.all();
        let mut next = current.records.as_ref().clone();
        let slot = next
            .iter_mut()
            .find(|r| r.student_id == student_id)
            .ok_or_else(|| RegistryError::NotFound(student_id.to_string()))?;
        slot.embedding = new_record.embedding;
        slot.reference_image = new_record.reference_image;

        self.commit(&current, next).await?;
        tracing::info!(student_id, "registry: replaced embedding");
        Ok(())
    }

    /// Update display fields. Returns `false` if the student is not enrolled.
    pub async fn update_profile(
        &self,
        student_id: &str,
        display_name: &str,
        group_ref: Option<i64>,
    ) -> Result<bool, RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.all();
        let mut next = current.records.as_ref().clone();
        let Some(slot) = next.iter_mut().find(|r| r.student_id == student_id) else {
            return Ok(false);
        };
        if slot.display_name == display_name && slot.group_ref == group_ref {
            return Ok(true);
        }
        slot.display_name = display_name.to_string();
        slot.group_ref = group_ref;

        self.commit(&current, next).await?;
        Ok(true)
    }

    /// Remove a record. Removing an absent id succeeds and returns `false`.
    pub async fn remove(&self, student_id: &str) -> Result<bool, RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.all();
        if !current.contains(student_id) {
            return Ok(false);
        }

        let next: Vec<EnrollmentRecord> = current
            .iter()
            .filter(|r| r.student_id != student_id)
            .cloned()
            .collect();
        self.commit(&current, next).await?;
        tracing::info!(student_id, "registry: removed");
        Ok(true)
    }

    /// Persist the current view, overwriting the previous snapshot.
    pub async fn snapshot(&self) -> Result<(), RegistryError> {
        let _guard = self.writer.lock().await;
        let current = self.all();
        self.persist(current.generation, current.records.clone()).await
    }

    /// Persist `next` and publish it. Caller must hold the writer lock.
    async fn commit(&self, current: &RegistryView, next: Vec<EnrollmentRecord>) -> Result<(), RegistryError> {
        let generation = current.generation + 1;
        let records = Arc::new(next);
        if let Err(e) = self.persist(generation, records.clone()).await {
            tracing::error!(
                path = %self.snapshot_path.display(),
                error = %e,
                "registry snapshot failed; mutation discarded"
            );
            return Err(e);
        }

        let view = RegistryView { generation, records };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = view;
        Ok(())
    }

    /// Serialize and fsync on the blocking pool, off the async workers.
    async fn persist(&self, generation: u64, records: Arc<Vec<EnrollmentRecord>>) -> Result<(), RegistryError> {
        let path = self.snapshot_path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let snapshot = SnapshotRef {
                format: SNAPSHOT_FORMAT,
                generation,
                records: &records,
            };
            write_atomically(&path, &snapshot)
        })
        .await
        .unwrap_or_else(|join| Err(io::Error::other(join.to_string())));
        written.map_err(|source| RegistryError::Persistence {
            path: self.snapshot_path.clone(),
            source,
        })
    }
}

/// Borrowed twin of [`Snapshot`] so persisting does not clone the records.
#[derive(Serialize)]
struct SnapshotRef<'a> {
    format: u32,
    generation: u64,
    records: &'a [EnrollmentRecord],
}

/// Drop records that can never be matched and duplicate ids (first wins).
fn sanitize(records: Vec<EnrollmentRecord>) -> Vec<EnrollmentRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| {
            if r.embedding.is_empty() {
                tracing::warn!(student_id = %r.student_id, "snapshot record without embedding dropped");
                return false;
            }
            if !seen.insert(r.student_id.clone()) {
                tracing::warn!(student_id = %r.student_id, "duplicate snapshot record dropped");
                return false;
            }
            true
        })
        .collect()
}

/// Move a corrupt snapshot aside so the next commit does not overwrite it.
fn recover(path: &Path, reason: String) -> LoadStatus {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".corrupt-{stamp}"));
    let backup = PathBuf::from(backup);

    let backup = match fs::rename(path, &backup) {
        Ok(()) => Some(backup),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not move corrupt snapshot aside");
            None
        }
    };
    tracing::warn!(
        path = %path.display(),
        reason = %reason,
        backup = ?backup,
        "registry snapshot corrupt; starting EMPTY, enrolled students must be re-embedded"
    );
    LoadStatus::Recovered { reason, backup }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomically<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn open(dir: &tempfile::TempDir) -> EmbeddingRegistry {
        EmbeddingRegistry::load(dir.path().join("embeddings.json")).0
    }

    fn ids(view: &RegistryView) -> Vec<String> {
        view.iter().map(|r| r.student_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_load_missing_snapshot_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, status) = EmbeddingRegistry::load(dir.path().join("embeddings.json"));
        assert_eq!(status, LoadStatus::Fresh);
        assert!(registry.all().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_all_contains_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();
        registry.append(record("1002", 2)).await.unwrap();

        let view = registry.all();
        assert_eq!(ids(&view), vec!["1001", "1002"]);
        assert_eq!(view.generation(), 2);
    }

    #[tokio::test]
    async fn test_append_duplicate_rejected_and_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();
        let before = registry.all();

        let err = registry.append(record("1001", 9)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateStudent(id) if id == "1001"));

        let after = registry.all();
        assert_eq!(after.generation(), before.generation());
        assert_eq!(after.len(), 1);
        assert_eq!(after.get("1001"), before.get("1001"));
    }

    #[tokio::test]
    async fn test_remove_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();
        registry.append(record("1002", 2)).await.unwrap();

        assert!(registry.remove("1001").await.unwrap());
        assert_eq!(ids(&registry.all()), vec!["1002"]);

        let generation = registry.all().generation();
        assert!(!registry.remove("1001").await.unwrap());
        assert_eq!(registry.all().generation(), generation);
    }

    #[tokio::test]
    async fn test_replace_changes_only_embedding_and_image() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();
        registry.append(record("1002", 2)).await.unwrap();
        let before = registry.all();

        let mut new = record("ignored", 7);
        new.display_name = "Someone Else".into();
        new.group_ref = Some(99);
        registry.replace("1001", new.clone()).await.unwrap();

        let after = registry.all();
        let old = before.get("1001").unwrap();
        let updated = after.get("1001").unwrap();
        assert_eq!(updated.embedding, new.embedding);
        assert_eq!(updated.reference_image, new.reference_image);
        assert_eq!(updated.student_id, old.student_id);
        assert_eq!(updated.display_name, old.display_name);
        assert_eq!(updated.group_ref, old.group_ref);
        assert_eq!(updated.enrolled_at, old.enrolled_at);
        assert_eq!(after.get("1002"), before.get("1002"));
    }

    #[tokio::test]
    async fn test_replace_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        let err = registry.replace("404", record("404", 1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let (registry, _) = EmbeddingRegistry::load(&path);
        for (i, id) in ["1001", "1002", "1003"].iter().enumerate() {
            registry.append(record(id, i as u8)).await.unwrap();
        }
        registry.remove("1002").await.unwrap();

        let (reloaded, status) = EmbeddingRegistry::load(&path);
        assert_eq!(status, LoadStatus::Loaded { records: 2 });

        let mut expected: Vec<_> = registry.all().iter().cloned().collect();
        let mut actual: Vec<_> = reloaded.all().iter().cloned().collect();
        expected.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        actual.sort_by(|a, b| a.student_id.cmp(&b.student_id));
        assert_eq!(actual, expected);
        assert_eq!(reloaded.all().generation(), registry.all().generation());
    }

    #[tokio::test]
    async fn test_failed_snapshot_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the snapshot's parent directory should be.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let (registry, _) = EmbeddingRegistry::load(blocker.join("embeddings.json"));

        let err = registry.append(record("1001", 1)).await.unwrap_err();
        assert!(matches!(err, RegistryError::Persistence { .. }));
        assert!(registry.all().is_empty());
        assert_eq!(registry.all().generation(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_recovers_empty_and_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, b"{ not json").unwrap();

        let (registry, status) = EmbeddingRegistry::load(&path);
        assert!(registry.all().is_empty());
        let LoadStatus::Recovered { backup: Some(backup), .. } = status else {
            panic!("expected recovery with backup, got {status:?}");
        };
        assert_eq!(fs::read(&backup).unwrap(), b"{ not json");
        assert!(!path.exists());

        // The registry stays usable after recovery.
        registry.append(record("1001", 1)).await.unwrap();
        assert_eq!(EmbeddingRegistry::load(&path).1, LoadStatus::Loaded { records: 1 });
    }

    #[tokio::test]
    async fn test_load_drops_unmatchable_and_duplicate_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let mut empty = record("1002", 2);
        empty.embedding.values.clear();
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            generation: 5,
            records: vec![record("1001", 1), empty, record("1001", 3)],
        };
        fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

        let (registry, status) = EmbeddingRegistry::load(&path);
        assert_eq!(status, LoadStatus::Loaded { records: 1 });
        assert_eq!(registry.get("1001").unwrap(), record("1001", 1));
    }

    #[tokio::test]
    async fn test_reader_view_is_stable_across_writes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();

        let view = registry.all();
        registry.append(record("1002", 2)).await.unwrap();
        registry.remove("1001").await.unwrap();

        assert_eq!(ids(&view), vec!["1001"]);
        assert_eq!(ids(&registry.all()), vec!["1002"]);
    }

    #[tokio::test]
    async fn test_update_profile() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        registry.append(record("1001", 1)).await.unwrap();

        assert!(registry.update_profile("1001", "Ana Maria", Some(4)).await.unwrap());
        let updated = registry.get("1001").unwrap();
        assert_eq!(updated.display_name, "Ana Maria");
        assert_eq!(updated.group_ref, Some(4));
        assert_eq!(updated.embedding, record("1001", 1).embedding);

        assert!(!registry.update_profile("404", "x", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_rewrites_after_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, b"garbage").unwrap();

        let (registry, status) = EmbeddingRegistry::load(&path);
        assert!(matches!(status, LoadStatus::Recovered { .. }));
        registry.snapshot().await.unwrap();

        assert_eq!(EmbeddingRegistry::load(&path).1, LoadStatus::Loaded { records: 0 });
    }

    #[tokio::test]
    async fn test_concurrent_writers_all_commit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = open(&dir);
        let (a, b, c) = tokio::join!(
            registry.append(record("1001", 1)),
            registry.append(record("1002", 2)),
            registry.append(record("1003", 3)),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(registry.all().generation(), 3);
        let (reloaded, _) = EmbeddingRegistry::load(registry.snapshot_path());
        assert_eq!(reloaded.all().len(), 3);
    }
}
