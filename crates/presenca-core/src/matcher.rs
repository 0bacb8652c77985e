//! Recognition matcher. Identifies a probe capture against the registry.

use crate::images::{ImageError, StagedImage};
use crate::provider::{Detection, EmbeddingProvider};
use crate::registry::EmbeddingRegistry;
use crate::types::MatchOutcome;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("failed to stage probe image: {0}")]
    Staging(#[from] ImageError),
}

/// Scans the registry in order and accepts the first candidate the provider
/// verifies. This is a first-verified-wins policy, not a nearest-neighbour
/// search: a closer candidate later in registry order is never consulted.
pub struct RecognitionMatcher {
    provider: Arc<dyn EmbeddingProvider>,
    registry: Arc<EmbeddingRegistry>,
    staging_dir: PathBuf,
}

impl RecognitionMatcher {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        registry: Arc<EmbeddingRegistry>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            registry,
            staging_dir: staging_dir.into(),
        }
    }

    /// Stage `probe` on disk, match it, and remove the staged copy.
    pub async fn recognize(&self, probe: &[u8]) -> Result<MatchOutcome, MatcherError> {
        let staged = StagedImage::create(&self.staging_dir, probe).await?;
        let outcome = self.match_image(staged.path()).await;
        tracing::debug!(outcome = outcome.kind(), "recognition finished");
        Ok(outcome)
    }

    /// Match a probe image that is already on disk.
    ///
    /// Provider failures never escape: a failed face check reads as no face,
    /// a failed comparison reads as "this candidate does not verify".
    pub async fn match_image(&self, probe: &Path) -> MatchOutcome {
        match self.provider.embed(probe, Detection::Lenient).await {
            Ok(Some(_)) => {}
            Ok(None) => return MatchOutcome::NoFaceDetected,
            Err(e) => {
                tracing::warn!(error = %e, "face check failed; treating probe as faceless");
                return MatchOutcome::NoFaceDetected;
            }
        }

        let view = self.registry.all();
        if view.is_empty() {
            return MatchOutcome::NoRegisteredStudents;
        }

        for record in &view {
            let exists = tokio::fs::try_exists(&record.reference_image)
                .await
                .unwrap_or(false);
            if !exists {
                tracing::warn!(
                    student_id = %record.student_id,
                    path = %record.reference_image.display(),
                    "reference photo missing; skipping candidate"
                );
                continue;
            }

            match self.provider.verify(probe, &record.reference_image).await {
                Ok(v) if v.verified => {
                    tracing::info!(
                        student_id = %record.student_id,
                        distance = v.distance,
                        generation = view.generation(),
                        "probe matched"
                    );
                    return MatchOutcome::Matched {
                        record: record.clone(),
                        distance: v.distance,
                    };
                }
                Ok(v) => {
                    tracing::trace!(student_id = %record.student_id, distance = v.distance, "not verified");
                }
                Err(e) => {
                    tracing::warn!(
                        student_id = %record.student_id,
                        error = %e,
                        "verification failed; skipping candidate"
                    );
                }
            }
        }

        MatchOutcome::NoMatch
    }
}
