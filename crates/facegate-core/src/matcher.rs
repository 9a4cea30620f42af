//! Best-match reduction across the registry and the grant/deny rule.

use crate::oracle::Verifier;
use image::GrayImage;
use std::path::PathBuf;

/// Name recorded for a denied attempt with no attributable identity.
pub const UNKNOWN_NAME: &str = "Unknown";

/// One registered identity as seen by the comparison scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identity_id: i64,
    pub name: String,
    pub reference_photo: PathBuf,
}

/// The candidate with the smallest distance seen during a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch {
    pub identity_id: i64,
    pub name: String,
    pub distance: f32,
    /// Oracle verdict for this specific pair.
    pub verified: bool,
}

/// Scan every candidate and keep the global minimum distance.
///
/// Ties keep the candidate scanned first. A comparison that fails is logged
/// and skipped so one unreadable reference photo cannot block the rest of
/// the registry. An empty candidate list returns `None` without touching
/// the verifier.
pub fn find_best_match<V: Verifier + ?Sized>(
    verifier: &mut V,
    probe: &GrayImage,
    candidates: &[Candidate],
) -> Option<BestMatch> {
    let mut best: Option<BestMatch> = None;

    for candidate in candidates {
        let outcome = match verifier.verify(probe, &candidate.reference_photo) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    identity = %candidate.name,
                    error = %err,
                    "comparison failed; skipping identity"
                );
                continue;
            }
        };

        let is_better = match &best {
            None => true,
            Some(current) => outcome.distance < current.distance,
        };
        if is_better {
            best = Some(BestMatch {
                identity_id: candidate.identity_id,
                name: candidate.name.clone(),
                distance: outcome.distance,
                verified: outcome.verified,
            });
        }
    }

    best
}

/// Outcome of one recognition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub granted: bool,
    /// Set only when access is granted.
    pub identity_id: Option<i64>,
    /// Name snapshot written to the access log.
    pub name: String,
    /// `1 - distance` when granted, `0` otherwise. Always within [0, 1].
    pub confidence: f32,
}

impl Decision {
    /// Grant only if a best match exists and the oracle verified that pair.
    pub fn from_best_match(best: Option<BestMatch>) -> Self {
        match best {
            Some(m) if m.verified => Self {
                granted: true,
                identity_id: Some(m.identity_id),
                name: m.name,
                confidence: (1.0 - m.distance).clamp(0.0, 1.0),
            },
            _ => Self::denied(),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: false,
            identity_id: None,
            name: UNKNOWN_NAME.to_string(),
            confidence: 0.0,
        }
    }

    /// Label drawn next to a face region while this decision is current.
    pub fn overlay_label(&self) -> String {
        if self.granted {
            format!("OK: {}", self.name)
        } else {
            format!("X: {UNKNOWN_NAME}")
        }
    }
}
