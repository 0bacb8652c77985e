use crate::config::Config;
use anyhow::{Context, Result};
use presenca_core::{
    AttendanceGate, CheckIn, Coordinator, EmbeddingProvider, EmbeddingRegistry, HttpEmbeddingProvider,
    HttpProviderConfig, ImageStore, LoadStatus, RecognitionMatcher, StudentStore,
};
use presenca_store::SqliteStore;
use std::path::Path;
use std::sync::Arc;

/// Everything a request handler needs, built once at startup.
pub struct Service {
    pub config: Config,
    pub store: SqliteStore,
    pub registry: Arc<EmbeddingRegistry>,
    pub coordinator: Coordinator,
    pub check_in: CheckIn,
    pub load_status: LoadStatus,
}

impl Service {
    /// Open the database, build the provider client and wire the core together.
    ///
    /// Fails fast if the database or provider client cannot be created.
    pub async fn start(config: Config) -> Result<Self> {
        let store = SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening database {}", config.db_path.display()))?;

        let provider: Arc<dyn EmbeddingProvider> = Arc::new(
            HttpEmbeddingProvider::new(HttpProviderConfig {
                base_url: config.provider_url.clone(),
                model_name: config.model_name.clone(),
                detector_backend: config.detector_backend.clone(),
                timeout: config.provider_timeout,
            })
            .context("building embedding provider client")?,
        );
        tracing::info!(
            url = %config.provider_url,
            model = %config.model_name,
            detector = %config.detector_backend,
            "embedding provider configured"
        );

        Ok(Self::assemble(config, store, provider).await)
    }

    /// Load the registry and build the core over an open store and provider.
    ///
    /// A corrupt registry snapshot is not fatal. It is logged loudly and an
    /// empty snapshot is written in its place.
    pub async fn assemble(config: Config, store: SqliteStore, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let (registry, load_status) = EmbeddingRegistry::load(&config.snapshot_path);
        if let LoadStatus::Recovered { reason, backup } = &load_status {
            tracing::warn!(
                %reason,
                backup = ?backup,
                "STARTUP WARNING: embedding registry was reset; recognition will miss previously enrolled students"
            );
            if let Err(e) = registry.snapshot().await {
                tracing::warn!(error = %e, "could not rewrite registry snapshot after recovery");
            }
        }
        let registry = Arc::new(registry);

        purge_staging(&config.staging_dir).await;

        let students: Arc<dyn StudentStore> = Arc::new(store.clone());
        let coordinator = Coordinator::new(
            registry.clone(),
            students,
            ImageStore::new(config.image_dir.clone(), config.max_photo_bytes),
            provider.clone(),
        );

        let matcher = Arc::new(RecognitionMatcher::new(
            provider,
            registry.clone(),
            config.staging_dir.clone(),
        ));
        let gate = Arc::new(AttendanceGate::new(
            Arc::new(store.clone()),
            chrono::Duration::minutes(config.cooldown_minutes),
        ));
        let check_in = CheckIn::new(matcher, gate);

        match coordinator.unrecognizable().await {
            Ok(pending) if !pending.is_empty() => {
                let ids: Vec<&str> = pending.iter().map(|s| s.student_id.as_str()).collect();
                tracing::warn!(
                    count = pending.len(),
                    students = ?ids,
                    "students registered but not recognizable; upload a new photo or reembed"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not reconcile students with registry"),
        }

        tracing::info!(
            students = registry.all().len(),
            cooldown_minutes = config.cooldown_minutes,
            "service ready"
        );

        Self {
            config,
            store,
            registry,
            coordinator,
            check_in,
            load_status,
        }
    }
}

/// Remove probe images left behind by a previous crash.
async fn purge_staging(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let mut removed = 0usize;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if tokio::fs::remove_file(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "purged stale probe images");
    }
}
