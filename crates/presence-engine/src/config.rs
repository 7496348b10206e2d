use presence_core::liveness::{
    LivenessConfig, DEFAULT_BLINK_THRESHOLD, DEFAULT_DEBOUNCE_FRAMES, DEFAULT_SMILE_THRESHOLD,
};
use presence_core::model::DEFAULT_MODEL_FILE;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// File name of the embedding model inside `model_dir`.
    pub embedding_model: String,
    /// Expected SHA-256 of the embedding model; unchecked when unset.
    pub model_sha256: Option<String>,
    pub blink_threshold: f32,
    pub smile_threshold: f32,
    /// Consecutive well-framed frames before a gesture is requested.
    pub debounce_frames: u32,
    pub liveness_timeout_secs: u64,
    pub face_loss_grace_ms: u64,
    /// Time allowed to find a face at all.
    pub session_budget_secs: u64,
    /// How often a stalled session re-checks its timeouts.
    pub tick_interval_ms: u64,
    /// Frame buffers available to a camera feed.
    pub frame_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("PRESENCE_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_model_dir(&var));

        Self {
            model_dir,
            embedding_model: var("PRESENCE_EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_MODEL_FILE.to_string()),
            model_sha256: var("PRESENCE_MODEL_SHA256").filter(|v| !v.trim().is_empty()),
            blink_threshold: parse_or(&var, "PRESENCE_BLINK_THRESHOLD", DEFAULT_BLINK_THRESHOLD),
            smile_threshold: parse_or(&var, "PRESENCE_SMILE_THRESHOLD", DEFAULT_SMILE_THRESHOLD),
            debounce_frames: parse_or(&var, "PRESENCE_DEBOUNCE_FRAMES", DEFAULT_DEBOUNCE_FRAMES),
            liveness_timeout_secs: parse_or(&var, "PRESENCE_LIVENESS_TIMEOUT_SECS", 10),
            face_loss_grace_ms: parse_or(&var, "PRESENCE_FACE_LOSS_GRACE_MS", 1500),
            session_budget_secs: parse_or(&var, "PRESENCE_SESSION_BUDGET_SECS", 30),
            tick_interval_ms: parse_or(&var, "PRESENCE_TICK_INTERVAL_MS", 100),
            frame_pool_size: parse_or(&var, "PRESENCE_FRAME_POOL_SIZE", 4),
        }
    }

    /// Path to the embedding model.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedding_model)
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            blink_threshold: self.blink_threshold,
            smile_threshold: self.smile_threshold,
            debounce_frames: self.debounce_frames.max(1),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
            face_loss_grace: Duration::from_millis(self.face_loss_grace_ms),
            session_budget: Duration::from_secs(self.session_budget_secs),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

fn default_model_dir(var: &impl Fn(&str) -> Option<String>) -> PathBuf {
    var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("presence/models")
}

fn parse_or<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    var(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
