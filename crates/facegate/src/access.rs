//! Live access-control loop.
//!
//! Every frame runs the cheap region detector. On every `check_interval`-th
//! frame that shows at least one face, the first region is cropped and
//! compared against the whole registry; the resulting decision is written to
//! the access log and kept as the overlay label until the next check.

use crate::stop::StopSignal;
use facegate_core::{find_best_match, Candidate, Decision, DetectorError, FaceRegion, RegionDetector, Verifier};
use facegate_hw::{CameraError, FrameError, FrameSource};
use facegate_store::{RegistryStore, StoreError};
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("region detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("storage unavailable: {0}")]
    Storage(#[from] StoreError),
}

/// Where the loop is within one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    IdleSampling,
    Recognizing,
}

/// Result of processing a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frame_number: u64,
    pub phase: Phase,
    pub regions: Vec<FaceRegion>,
    /// Set only on frames where recognition ran.
    pub decision: Option<Decision>,
    /// Label for every drawn region; `None` when no face is visible.
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user asked to stop.
    Requested,
    /// The camera stopped delivering frames.
    EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub decisions: u64,
    pub granted: u64,
    pub reason: StopReason,
}

pub struct AccessController<'a, D: ?Sized, V: ?Sized> {
    store: &'a RegistryStore,
    detector: &'a mut D,
    verifier: &'a mut V,
    check_interval: u64,
    frame_count: u64,
    last_decision: Option<Decision>,
}

impl<'a, D, V> AccessController<'a, D, V>
where
    D: RegionDetector + ?Sized,
    V: Verifier + ?Sized,
{
    /// `check_interval` of 0 is treated as 1 (check every frame).
    pub fn new(
        store: &'a RegistryStore,
        detector: &'a mut D,
        verifier: &'a mut V,
        check_interval: u64,
    ) -> Self {
        Self {
            store,
            detector,
            verifier,
            check_interval: check_interval.max(1),
            frame_count: 0,
            last_decision: None,
        }
    }

    /// Most recent decision, possibly from many frames ago.
    pub fn last_decision(&self) -> Option<&Decision> {
        self.last_decision.as_ref()
    }

    /// Label for face regions: the last decision's, or "unknown" before any.
    pub fn overlay_label(&self) -> String {
        self.last_decision
            .as_ref()
            .map(Decision::overlay_label)
            .unwrap_or_else(|| Decision::denied().overlay_label())
    }

    /// Pull frames until a stop is requested or the source runs dry.
    ///
    /// The stop flag is checked once per frame, so a registry scan that has
    /// started always finishes first.
    pub fn run<S: FrameSource + ?Sized>(
        &mut self,
        source: &mut S,
        stop: &StopSignal,
        mut on_frame: impl FnMut(&FrameReport),
    ) -> Result<RunSummary, AccessError> {
        let mut summary = RunSummary {
            frames: 0,
            decisions: 0,
            granted: 0,
            reason: StopReason::EndOfStream,
        };

        loop {
            if stop.is_stop_requested() {
                summary.reason = StopReason::Requested;
                break;
            }

            let frame = match source.next_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::info!(error = %err, "frame source ended");
                    break;
                }
            };

            let report = self.process_frame(&frame.into_gray_image()?)?;
            summary.frames += 1;
            if let Some(decision) = &report.decision {
                summary.decisions += 1;
                summary.granted += u64::from(decision.granted);
            }
            on_frame(&report);
        }

        tracing::info!(
            frames = summary.frames,
            decisions = summary.decisions,
            granted = summary.granted,
            reason = ?summary.reason,
            "access loop stopped"
        );
        Ok(summary)
    }

    /// Detect, maybe recognise, and report on one frame.
    pub fn process_frame(&mut self, frame: &GrayImage) -> Result<FrameReport, AccessError> {
        self.frame_count += 1;
        let regions = self.detector.detect_regions(frame)?;
        tracing::trace!(frame = self.frame_count, regions = regions.len(), "frame sampled");

        let due = self.frame_count % self.check_interval == 0;
        let (phase, decision) = match regions.first() {
            Some(first) if due => {
                let probe = first.crop(frame);
                (Phase::Recognizing, Some(self.recognize(&probe)?))
            }
            _ => (Phase::IdleSampling, None),
        };

        let label = (!regions.is_empty()).then(|| self.overlay_label());
        Ok(FrameReport {
            frame_number: self.frame_count,
            phase,
            regions,
            decision,
            label,
        })
    }

    /// Scan the registry for `probe`, decide, and log the decision.
    pub fn recognize(&mut self, probe: &GrayImage) -> Result<Decision, AccessError> {
        let candidates: Vec<Candidate> = self
            .store
            .list_identities_for_recognition()?
            .into_iter()
            .map(|entry| Candidate {
                identity_id: entry.id,
                name: entry.name,
                reference_photo: entry.reference_photo_path,
            })
            .collect();

        if candidates.is_empty() {
            tracing::debug!("registry is empty; no match possible");
        }

        let best = find_best_match(&mut *self.verifier, probe, &candidates);
        let decision = Decision::from_best_match(best);

        if let Err(err) = self.store.record_access_event(
            decision.identity_id,
            &decision.name,
            decision.granted,
            f64::from(decision.confidence),
        ) {
            tracing::error!(error = %err, name = %decision.name, granted = decision.granted, "access decision was not logged");
            return Err(err.into());
        }
        self.last_decision = Some(decision.clone());

        if decision.granted {
            tracing::info!(name = %decision.name, confidence = decision.confidence, "access granted");
        } else {
            tracing::info!(candidates = candidates.len(), "access denied");
        }
        Ok(decision)
    }
}
