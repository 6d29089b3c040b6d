use staffid_core::recognition::{DEFAULT_MATCH_THRESHOLD, DEFAULT_SCORE_DECIMALS};
use staffid_core::{AggregationPolicy, MatchPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8000).
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the JSON gallery file.
    pub gallery_path: PathBuf,
    /// Cosine similarity at or above which a probe is accepted.
    pub match_threshold: f32,
    /// Decimal places in reported match scores.
    pub score_decimals: u32,
    /// How enrollment combines per-image embeddings.
    pub aggregation: AggregationPolicy,
    /// Upper bound on detection + embedding work per request.
    pub request_timeout_secs: u64,
    /// Number of model workers, each owning its own ONNX sessions.
    pub engine_workers: usize,
    /// Maximum accepted request body size.
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            model_dir: staffid_core::default_model_dir(),
            gallery_path: staffid_core::default_gallery_path(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            score_decimals: DEFAULT_SCORE_DECIMALS,
            aggregation: AggregationPolicy::default(),
            request_timeout_secs: 10,
            engine_workers: 1,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from `STAFFID_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: std::env::var("STAFFID_BIND_ADDR").unwrap_or(defaults.bind_addr),
            model_dir: std::env::var("STAFFID_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_dir),
            gallery_path: std::env::var("STAFFID_GALLERY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.gallery_path),
            match_threshold: env_parse("STAFFID_MATCH_THRESHOLD", defaults.match_threshold),
            score_decimals: env_parse("STAFFID_SCORE_DECIMALS", defaults.score_decimals),
            aggregation: env_parse("STAFFID_AGGREGATION", defaults.aggregation),
            request_timeout_secs: env_parse("STAFFID_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            engine_workers: env_parse("STAFFID_ENGINE_WORKERS", defaults.engine_workers).max(1),
            max_upload_bytes: env_parse("STAFFID_MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
        }
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
            score_decimals: self.score_decimals,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(staffid_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> String {
        self.model_dir
            .join(staffid_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

/// Parse `key` if set; an unparsable value is logged and the default kept.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}
