//! The four user-facing operations: register, run, stats, users.

use crate::access::{AccessController, AccessError, Phase};
use crate::config::Config;
use crate::registration::{self, CaptureOptions, NewIdentity, Registered, Registrar, RegistrationError};
use crate::stop::StdinStop;
use anyhow::{Context, Result};
use facegate_core::{FaceDetector, ModelOracle};
use facegate_hw::Camera;
use facegate_store::{Identity, RegistryStore, Statistics};
use std::fmt::Write as _;
use std::path::Path;

pub struct App {
    config: Config,
    store: RegistryStore,
}

impl App {
    pub fn open(config: Config) -> Result<Self> {
        let store = RegistryStore::open(&config.db_path)
            .with_context(|| format!("opening registry at {}", config.db_path.display()))?;
        tracing::debug!(db = %store.path().display(), "registry opened");
        Ok(Self { config, store })
    }

    /// Register from `photo`, or from the camera when no photo is given.
    ///
    /// The name is checked before any model, camera or terminal setup.
    pub fn register(&self, name: &str, email: Option<&str>, photo: Option<&Path>) -> Result<Registered> {
        let name = registration::check_name(&self.store, name)?;
        let who = NewIdentity { name, email };
        let mut oracle = self.load_oracle()?;
        let mut registrar = Registrar::new(&self.store, &mut oracle);

        let registered = match photo {
            Some(photo) => registrar.register_photo(who, photo)?,
            None => {
                let mut detector = self.load_region_detector()?;
                let camera = Camera::open(&self.config.camera_device).map_err(RegistrationError::from)?;
                let mut stream = camera.stream().map_err(RegistrationError::from)?;

                println!("Look at the camera. Press Enter to cancel.");
                let stdin = StdinStop::spawn().context("starting stdin reader")?;
                let options = CaptureOptions {
                    photo_dir: &self.config.known_faces_dir,
                    max_frames: self.config.capture_attempts,
                    stop: stdin.signal(),
                };
                let result = registrar.register_captured(who, &mut detector, &mut stream, &options);
                drop(stream);
                stdin.finish();
                result?
            }
        };
        Ok(registered)
    }

    /// Run the access loop until Enter is pressed or the camera stops.
    pub fn run(&self) -> Result<()> {
        let mut detector = self.load_region_detector()?;
        let mut oracle = self.load_oracle()?;
        let camera = Camera::open(&self.config.camera_device).map_err(AccessError::from)?;
        let mut stream = camera.stream().map_err(AccessError::from)?;

        println!(
            "Access control running on {} (recognition every {} frames). Press Enter to stop.",
            self.config.camera_device, self.config.check_interval
        );
        let stdin = StdinStop::spawn().context("starting stdin reader")?;
        let mut controller =
            AccessController::new(&self.store, &mut detector, &mut oracle, self.config.check_interval);

        let result = controller.run(&mut stream, stdin.signal(), |report| {
            if report.phase != Phase::Recognizing {
                return;
            }
            let confidence = report.decision.as_ref().map_or(0.0, |d| d.confidence);
            println!(
                "[frame {}] {} (faces: {}, confidence {:.2})",
                report.frame_number,
                report.label.as_deref().unwrap_or_default(),
                report.regions.len(),
                confidence
            );
        });
        if let Some(last) = controller.last_decision() {
            tracing::debug!(name = %last.name, granted = last.granted, "last decision");
        }
        drop(stream);
        stdin.finish();

        let summary = result?;
        println!(
            "Stopped after {} frames: {} decisions, {} granted.",
            summary.frames, summary.decisions, summary.granted
        );
        Ok(())
    }

    pub fn stats(&self, json: bool) -> Result<()> {
        let stats = self.store.get_statistics()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            print!("{}", render_stats(&stats));
        }
        Ok(())
    }

    pub fn users(&self, json: bool) -> Result<()> {
        let identities = self.store.list_identities_detailed()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&identities)?);
        } else {
            print!("{}", render_users(&identities));
        }
        Ok(())
    }

    fn load_region_detector(&self) -> Result<FaceDetector> {
        let path = self.config.detector_model_path();
        FaceDetector::load_with_input_size(&path, self.config.region_input_size)
            .with_context(|| format!("loading region detector from {}", path.display()))
    }

    fn load_oracle(&self) -> Result<ModelOracle> {
        ModelOracle::load(
            &self.config.detector_model_path(),
            &self.config.recognizer_model_path(),
            self.config.distance_threshold,
        )
        .with_context(|| format!("loading face models from {}", self.config.model_dir.display()))
    }
}

pub fn render_stats(stats: &Statistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Registered identities: {}", stats.total_identities);
    let _ = writeln!(out, "Access events:         {}", stats.total_events);
    let _ = writeln!(out, "  granted:             {}", stats.granted_count);
    let _ = writeln!(out, "  denied:              {}", stats.denied_count);
    let _ = writeln!(
        out,
        "Today:                 {} granted, {} denied",
        stats.granted_today, stats.denied_today
    );
    match stats.success_rate() {
        Some(rate) => {
            let _ = writeln!(out, "Success rate:          {rate:.1}%");
        }
        None => {
            let _ = writeln!(out, "Success rate:          n/a");
        }
    }

    if !stats.recent_events.is_empty() {
        let _ = writeln!(out, "\nRecent events:");
        for event in &stats.recent_events {
            let _ = writeln!(
                out,
                "  {}  {:<7}  {:<20}  {:.2}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                if event.granted { "GRANTED" } else { "DENIED" },
                event.identity_name,
                event.confidence
            );
        }
    }
    out
}

pub fn render_users(identities: &[Identity]) -> String {
    if identities.is_empty() {
        return "No identities registered.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:<5} {:<24} {:<30} Registered", "ID", "Name", "Email");
    for identity in identities {
        let _ = writeln!(
            out,
            "{:<5} {:<24} {:<30} {}",
            identity.id,
            identity.name,
            identity.email.as_deref().unwrap_or("N/A"),
            identity.registered_at.format("%Y-%m-%d %H:%M")
        );
    }
    out
}
