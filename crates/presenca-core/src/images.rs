//! Reference photo storage and probe staging on the local filesystem.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid student id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidStudentId(String),
    #[error("photo is not a decodable image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("photo is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("image storage I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ImageError + '_ {
    move |source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Student ids double as directory names, so keep them path-safe.
pub fn validate_student_id(student_id: &str) -> Result<(), ImageError> {
    let valid = !student_id.is_empty()
        && student_id.len() <= 64
        && !student_id.starts_with('.')
        && student_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ImageError::InvalidStudentId(student_id.to_string()))
    }
}

/// Decode enough of `bytes` to prove it is an image; return its format.
fn inspect(bytes: &[u8], limit: usize) -> Result<image::ImageFormat, ImageError> {
    if bytes.len() > limit {
        return Err(ImageError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    let format = image::guess_format(bytes)?;
    image::load_from_memory_with_format(bytes, format)?;
    Ok(format)
}

fn extension(format: image::ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}

/// Canonical student photos, laid out as `<root>/<student_id>/<student_id>_<uuid>.<ext>`.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
    max_bytes: usize,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    /// Reject photos that `save` would reject, without writing anything.
    pub fn check(&self, bytes: &[u8]) -> Result<image::ImageFormat, ImageError> {
        inspect(bytes, self.max_bytes)
    }

    /// Validate and write a new photo generation for `student_id`.
    pub async fn save(&self, student_id: &str, bytes: &[u8]) -> Result<PathBuf, ImageError> {
        validate_student_id(student_id)?;
        let format = inspect(bytes, self.max_bytes)?;

        let dir = self.root.join(student_id);
        tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let file_name = format!("{student_id}_{}.{}", Uuid::new_v4().simple(), extension(format));
        let path = dir.join(file_name);
        tokio::fs::write(&path, bytes).await.map_err(io_err(&path))?;

        tracing::debug!(student_id, path = %path.display(), "photo stored");
        Ok(path)
    }

    /// Delete a stored photo. Returns `false` if it was already gone.
    ///
    /// Paths outside the store root are refused and left alone.
    pub async fn delete(&self, path: &Path) -> Result<bool, ImageError> {
        if !path.starts_with(&self.root) {
            tracing::warn!(
                path = %path.display(),
                root = %self.root.display(),
                "refusing to delete photo outside image store"
            );
            return Ok(false);
        }

        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                // Drop the per-student directory once it is empty.
                if let Some(dir) = path.parent().filter(|d| *d != self.root) {
                    let _ = tokio::fs::remove_dir(dir).await;
                }
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(path)(e)),
        }
    }
}

/// A probe image written to the staging directory for the provider to read.
///
/// The file is removed when the value is dropped, on every exit path.
#[derive(Debug)]
pub struct StagedImage {
    path: PathBuf,
}

impl StagedImage {
    pub async fn create(dir: &Path, bytes: &[u8]) -> Result<Self, ImageError> {
        tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
        let ext = image::guess_format(bytes).map(extension).unwrap_or("png");
        let path = dir.join(format!("probe_{}.{ext}", Uuid::new_v4().simple()));
        tokio::fs::write(&path, bytes).await.map_err(io_err(&path))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedImage {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove staged probe");
            }
        }
    }
}
