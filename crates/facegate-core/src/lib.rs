//! facegate-core — face localisation, embeddings and access decisions.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both
//! running via ONNX Runtime on the CPU. The access loop talks to them only
//! through the capability traits in [`oracle`].

pub mod detector;
pub mod matcher;
pub mod oracle;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::{DetectorError, FaceDetector};
pub use matcher::{find_best_match, BestMatch, Candidate, Decision, UNKNOWN_NAME};
pub use oracle::{ModelOracle, OracleError, RegionDetector, Representer, Verifier};
pub use recognizer::{FaceRecognizer, RecognizerError};
pub use types::{Embedding, FaceRegion, VerifyOutcome};

/// SCRFD detection model file name.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Per-user data directory: `$XDG_DATA_HOME/facegate`, falling back to
/// `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

/// Where the ONNX models are looked up when no directory is configured.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}
