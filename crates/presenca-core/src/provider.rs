//! Embedding provider boundary.
//!
//! The core never computes embeddings itself. It asks an [`EmbeddingProvider`]
//! to embed an image or to verify a pair of images; the production provider
//! talks to a DeepFace-compatible HTTP service.

use crate::types::{Embedding, Verification};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected provider response: {0}")]
    Decode(String),
    #[error("failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How hard the provider should insist on finding a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Reject images without a confidently detected face (enrollment).
    Strict,
    /// Let borderline captures through to verification (recognition).
    Lenient,
}

impl Detection {
    fn enforce(self) -> bool {
        matches!(self, Detection::Strict)
    }
}

/// Strategy for turning face images into embeddings and verdicts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed the first face found in `image`. `Ok(None)` means no face.
    async fn embed(&self, image: &Path, detection: Detection)
        -> Result<Option<Embedding>, ProviderError>;

    /// Judge whether `probe` and `reference` show the same face.
    async fn verify(&self, probe: &Path, reference: &Path) -> Result<Verification, ProviderError>;
}

/// Connection settings for [`HttpEmbeddingProvider`].
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub model_name: String,
    pub detector_backend: String,
    pub timeout: Duration,
}

/// Provider backed by a DeepFace-style REST service (`/represent`, `/verify`).
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

#[derive(Deserialize)]
struct RepresentResponse {
    #[serde(default)]
    results: Vec<RepresentResult>,
}

#[derive(Deserialize)]
struct RepresentResult {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct VerifyResponse {
    verified: bool,
    distance: f32,
}

impl HttpEmbeddingProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post(&self, name: &str, body: serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let response = self.client.post(self.endpoint(name)).json(&body).send().await?;
        Ok(response)
    }

    async fn error_body(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ProviderError::Status { status, body }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(
        &self,
        image: &Path,
        detection: Detection,
    ) -> Result<Option<Embedding>, ProviderError> {
        let body = serde_json::json!({
            "img": data_url(image).await?,
            "model_name": self.config.model_name,
            "detector_backend": self.config.detector_backend,
            "enforce_detection": detection.enforce(),
        });
        let response = self.post("represent", body).await?;

        // DeepFace answers 400 when enforce_detection rejects the image.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            tracing::debug!(path = %image.display(), body = %text, "provider found no face");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_body(response).await);
        }

        let parsed: RepresentResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(format!("represent: {e}")))?;
        Ok(first_embedding(parsed, &self.config.model_name))
    }

    async fn verify(&self, probe: &Path, reference: &Path) -> Result<Verification, ProviderError> {
        let body = serde_json::json!({
            "img1": data_url(probe).await?,
            "img2": data_url(reference).await?,
            "model_name": self.config.model_name,
            "detector_backend": self.config.detector_backend,
            "enforce_detection": false,
        });
        let response = self.post("verify", body).await?;
        if !response.status().is_success() {
            return Err(Self::error_body(response).await);
        }

        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(format!("verify: {e}")))?;
        Ok(Verification {
            verified: parsed.verified,
            distance: parsed.distance,
        })
    }
}

fn first_embedding(response: RepresentResponse, model: &str) -> Option<Embedding> {
    response
        .results
        .into_iter()
        .map(|r| r.embedding)
        .find(|values| !values.is_empty())
        .map(|values| Embedding {
            values,
            model: Some(model.to_string()),
        })
}

/// Read an image file and encode it as a `data:` URL.
async fn data_url(path: &Path) -> Result<String, ProviderError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| ProviderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mime = image::ImageFormat::from_path(path)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/png");
    Ok(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}
