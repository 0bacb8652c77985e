use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API listens on (default: 127.0.0.1:5000).
    pub bind: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the embedding registry snapshot.
    pub snapshot_path: PathBuf,
    /// Directory holding student reference photos.
    pub image_dir: PathBuf,
    /// Directory for short-lived probe images.
    pub staging_dir: PathBuf,
    /// Base URL of the embedding provider service.
    pub provider_url: String,
    /// Recognition model requested from the provider.
    pub model_name: String,
    /// Face detector backend requested from the provider.
    pub detector_backend: String,
    /// Timeout for a single provider call.
    pub provider_timeout: Duration,
    /// Minimum time between two counted check-ins of one student.
    pub cooldown_minutes: i64,
    /// Largest accepted photo upload, in bytes.
    pub max_photo_bytes: usize,
}

impl Config {
    /// Load configuration from `PRESENCA_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("PRESENCA_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| {
                        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("presenca")
            });

        Self {
            bind: std::env::var("PRESENCA_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 5000))),
            db_path: env_path("PRESENCA_DB_PATH", || data_dir.join("attendance.db")),
            snapshot_path: env_path("PRESENCA_SNAPSHOT_PATH", || data_dir.join("embeddings.json")),
            image_dir: env_path("PRESENCA_IMAGE_DIR", || data_dir.join("student_images")),
            staging_dir: env_path("PRESENCA_STAGING_DIR", || data_dir.join("temp_recognition_images")),
            provider_url: std::env::var("PRESENCA_PROVIDER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5005".to_string()),
            model_name: std::env::var("PRESENCA_MODEL_NAME").unwrap_or_else(|_| "ArcFace".to_string()),
            detector_backend: std::env::var("PRESENCA_DETECTOR_BACKEND")
                .unwrap_or_else(|_| "ssd".to_string()),
            provider_timeout: Duration::from_secs(env_u64("PRESENCA_PROVIDER_TIMEOUT_SECS", 30)),
            cooldown_minutes: cooldown_minutes(std::env::var("PRESENCA_COOLDOWN_MINUTES").ok().as_deref()),
            max_photo_bytes: env_usize("PRESENCA_MAX_PHOTO_BYTES", 10 * 1024 * 1024),
        }
    }
}

fn env_path(key: &str, default: impl FnOnce() -> PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or_else(|_| default())
}

/// Longest accepted check-in cooldown: one week.
const MAX_COOLDOWN_MINUTES: i64 = 7 * 24 * 60;

/// Parse the cooldown setting, falling back to 30 minutes when it is unset
/// or not a number, and clamping it to `0..=MAX_COOLDOWN_MINUTES`.
fn cooldown_minutes(raw: Option<&str>) -> i64 {
    let parsed = raw.and_then(|v| v.trim().parse::<i64>().ok()).unwrap_or(30);
    let clamped = parsed.clamp(0, MAX_COOLDOWN_MINUTES);
    if clamped != parsed {
        tracing::warn!(
            requested = parsed,
            used = clamped,
            "PRESENCA_COOLDOWN_MINUTES out of range; clamped"
        );
    }
    clamped
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
