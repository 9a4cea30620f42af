use facegate_core::oracle::DEFAULT_DISTANCE_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Application configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACEGATE_CONFIG`, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where captured reference photos are written.
    pub known_faces_dir: PathBuf,
    /// Run recognition on every Nth frame that shows a face.
    pub check_interval: u64,
    /// Cosine distance at or below which a pair counts as verified.
    pub distance_threshold: f32,
    /// Input size of the cheap per-frame detector.
    pub region_input_size: u32,
    /// Frames to wait for a face when registering from the camera.
    pub capture_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = facegate_core::default_data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: facegate_core::default_model_dir(),
            db_path: data_dir.join("access_control.db"),
            known_faces_dir: data_dir.join("known_faces"),
            check_interval: 30,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            region_input_size: 320,
            capture_attempts: 150,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `FACEGATE_*` overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEGATE_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("FACEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_KNOWN_FACES_DIR") {
            self.known_faces_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEGATE_CHECK_INTERVAL", &mut self.check_interval);
        override_parsed(&lookup, "FACEGATE_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&lookup, "FACEGATE_REGION_INPUT_SIZE", &mut self.region_input_size);
        override_parsed(&lookup, "FACEGATE_CAPTURE_ATTEMPTS", &mut self.capture_attempts);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval == 0 {
            return Err(ConfigError::Invalid("check_interval must be at least 1".into()));
        }
        if self.region_input_size == 0 || self.region_input_size % 32 != 0 {
            return Err(ConfigError::Invalid(format!(
                "region_input_size must be a positive multiple of 32, got {}",
                self.region_input_size
            )));
        }
        if !(self.distance_threshold > 0.0 && self.distance_threshold <= 2.0) {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold must be in (0, 2], got {}",
                self.distance_threshold
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(facegate_core::DETECTOR_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_model_path(&self) -> PathBuf {
        self.model_dir.join(facegate_core::RECOGNIZER_MODEL_FILE)
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}
