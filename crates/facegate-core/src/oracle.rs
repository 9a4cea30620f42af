//! Capabilities the access loop consumes, and the model-backed oracle.
//!
//! The loop only sees the traits: a cheap [`RegionDetector`] that runs on
//! every frame, a [`Verifier`] that compares a probe against one stored
//! reference photo, and a [`Representer`] used at registration to check a
//! photo holds exactly one usable face.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Embedding, FaceRegion, VerifyOutcome};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

/// Default cosine-distance cut-off for a verified pair.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.60;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("no face detected in {0}")]
    NoFaceDetected(String),
    #[error("{count} faces detected in {path}, expected exactly one")]
    MultipleFaces { path: String, count: usize },
    #[error("failed to load image {path}: {source}")]
    ImageLoad {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Fast, approximate face localisation run on every captured frame.
pub trait RegionDetector {
    fn detect_regions(&mut self, frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError>;
}

/// Per-pair verification: is `probe` the person in the `reference` photo?
pub trait Verifier {
    fn verify(&mut self, probe: &GrayImage, reference: &Path) -> Result<VerifyOutcome, OracleError>;
}

/// Registration-time check that a photo yields exactly one encodable face.
pub trait Representer {
    fn represent(&mut self, image: &Path) -> Result<Embedding, OracleError>;
}

/// SCRFD + ArcFace oracle.
///
/// Reference photos are decoded and embedded again on every call; there is
/// no embedding cache, so the stored files must stay readable.
pub struct ModelOracle {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    distance_threshold: f32,
}

impl ModelOracle {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer, distance_threshold: f32) -> Self {
        Self {
            detector,
            recognizer,
            distance_threshold,
        }
    }

    /// Load both models from their file paths.
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        distance_threshold: f32,
    ) -> Result<Self, OracleError> {
        Ok(Self::new(
            FaceDetector::load(detector_path)?,
            FaceRecognizer::load(recognizer_path)?,
            distance_threshold,
        ))
    }

    pub fn distance_threshold(&self) -> f32 {
        self.distance_threshold
    }

    /// Embed the first detected face, or the whole image when none is found.
    fn embed_lenient(&mut self, image: &GrayImage) -> Result<Embedding, OracleError> {
        let faces = self.detector.detect(image)?;
        let embedding = match faces.first() {
            Some(face) => self.recognizer.extract_region(image, face)?,
            None => self.recognizer.extract(image)?,
        };
        Ok(embedding)
    }
}

impl Verifier for ModelOracle {
    fn verify(&mut self, probe: &GrayImage, reference: &Path) -> Result<VerifyOutcome, OracleError> {
        let reference_image = load_gray(reference)?;
        let probe_embedding = self.embed_lenient(probe)?;
        let reference_embedding = self.embed_lenient(&reference_image)?;

        let distance = probe_embedding.cosine_distance(&reference_embedding);
        let outcome = VerifyOutcome {
            distance,
            verified: distance <= self.distance_threshold,
        };
        tracing::trace!(reference = %reference.display(), distance, verified = outcome.verified, "verified pair");
        Ok(outcome)
    }
}

impl Representer for ModelOracle {
    fn represent(&mut self, path: &Path) -> Result<Embedding, OracleError> {
        let image = load_gray(path)?;
        let faces = self.detector.detect(&image)?;
        match faces.as_slice() {
            [] => Err(OracleError::NoFaceDetected(path.display().to_string())),
            [face] => Ok(self.recognizer.extract_region(&image, face)?),
            many => Err(OracleError::MultipleFaces {
                path: path.display().to_string(),
                count: many.len(),
            }),
        }
    }
}

/// Decode an image file into 8-bit grayscale.
pub fn load_gray(path: &Path) -> Result<GrayImage, OracleError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| OracleError::ImageLoad {
            path: path.display().to_string(),
            source,
        })
}
