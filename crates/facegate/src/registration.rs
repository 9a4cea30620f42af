//! Identity registration.
//!
//! Steps run strictly in order: name check, photo acquisition, single-face
//! validation, insert. Nothing is persisted unless every step succeeds, and a
//! photo captured for a failed attempt is deleted again.

use crate::stop::StopSignal;
use chrono::NaiveDateTime;
use facegate_core::{DetectorError, OracleError, RegionDetector, Representer};
use facegate_hw::{CameraError, FrameError, FrameSource};
use facegate_store::{RegistryStore, StoreError};
use image::{GrayImage, ImageFormat};
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("an identity named '{0}' is already registered")]
    DuplicateIdentity(String),
    #[error("photo not found: {}", .0.display())]
    PhotoNotFound(PathBuf),
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("capture cancelled")]
    CaptureCancelled,
    #[error("no face came into view after {0} frames")]
    NoFaceInView(usize),
    #[error("no face detected in {0}")]
    NoFaceDetected(String),
    #[error("{count} faces detected in {path}, expected exactly one")]
    MultipleFaces { path: String, count: usize },
    #[error("face validation failed: {0}")]
    Oracle(OracleError),
    #[error("region detection failed: {0}")]
    Detector(#[from] DetectorError),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    #[error("failed to create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save photo {}: {source}", path.display())]
    SavePhoto {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("storage unavailable: {0}")]
    Storage(StoreError),
}

impl From<OracleError> for RegistrationError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::NoFaceDetected(path) => Self::NoFaceDetected(path),
            OracleError::MultipleFaces { path, count } => Self::MultipleFaces { path, count },
            other => Self::Oracle(other),
        }
    }
}

impl From<StoreError> for RegistrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity(name) => Self::DuplicateIdentity(name),
            StoreError::EmptyName => Self::EmptyName,
            other => Self::Storage(other),
        }
    }
}

/// Who is being registered.
#[derive(Debug, Clone, Copy)]
pub struct NewIdentity<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Registered {
    pub id: i64,
    pub name: String,
    pub reference_photo: PathBuf,
}

/// How long and where to look for a face when registering from the camera.
#[derive(Debug, Clone)]
pub struct CaptureOptions<'a> {
    pub photo_dir: &'a Path,
    pub max_frames: usize,
    pub stop: &'a StopSignal,
}

pub struct Registrar<'a, R: ?Sized> {
    store: &'a RegistryStore,
    representer: &'a mut R,
}

impl<'a, R: Representer + ?Sized> Registrar<'a, R> {
    pub fn new(store: &'a RegistryStore, representer: &'a mut R) -> Self {
        Self { store, representer }
    }

    /// Register `who` with an existing photo file.
    pub fn register_photo(
        &mut self,
        who: NewIdentity<'_>,
        photo: &Path,
    ) -> Result<Registered, RegistrationError> {
        let who = NewIdentity {
            name: check_name(self.store, who.name)?,
            ..who
        };

        let photo = photo
            .canonicalize()
            .map_err(|_| RegistrationError::PhotoNotFound(photo.to_path_buf()))?;
        if !photo.is_file() {
            return Err(RegistrationError::PhotoNotFound(photo));
        }

        self.validate_and_insert(who, photo)
    }

    /// Register `who` from the first camera frame in which a face is found.
    pub fn register_captured<D, S>(
        &mut self,
        who: NewIdentity<'_>,
        detector: &mut D,
        source: &mut S,
        options: &CaptureOptions<'_>,
    ) -> Result<Registered, RegistrationError>
    where
        D: RegionDetector + ?Sized,
        S: FrameSource + ?Sized,
    {
        let who = NewIdentity {
            name: check_name(self.store, who.name)?,
            ..who
        };

        let image = capture_face(detector, source, options)?;
        let taken_at = chrono::Local::now().naive_local();
        let photo = save_capture(&image, who.name, options.photo_dir, taken_at)?;

        let result = self.validate_and_insert(who, photo.clone());
        if result.is_err() {
            if let Err(err) = std::fs::remove_file(&photo) {
                tracing::warn!(path = %photo.display(), error = %err, "failed to remove rejected capture");
            }
        }
        result
    }

    fn validate_and_insert(
        &mut self,
        who: NewIdentity<'_>,
        photo: PathBuf,
    ) -> Result<Registered, RegistrationError> {
        let embedding = self.representer.represent(&photo)?;
        tracing::debug!(
            name = who.name,
            dims = embedding.values.len(),
            model = ?embedding.model_version,
            "reference photo validated"
        );

        let id = self.store.add_identity(who.name, who.email, &photo)?;
        tracing::info!(id, name = who.name, photo = %photo.display(), "identity registered");
        Ok(Registered {
            id,
            name: who.name.to_string(),
            reference_photo: photo,
        })
    }
}

/// Trim `name` and make sure it is non-empty and not registered yet.
///
/// Returns the trimmed name, which is the one to store.
pub fn check_name<'n>(store: &RegistryStore, name: &'n str) -> Result<&'n str, RegistrationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RegistrationError::EmptyName);
    }
    if store.find_identity_by_name(name)?.is_some() {
        return Err(RegistrationError::DuplicateIdentity(name.to_string()));
    }
    Ok(name)
}

/// Pull frames until the detector sees at least one face.
fn capture_face<D, S>(
    detector: &mut D,
    source: &mut S,
    options: &CaptureOptions<'_>,
) -> Result<GrayImage, RegistrationError>
where
    D: RegionDetector + ?Sized,
    S: FrameSource + ?Sized,
{
    for attempt in 1..=options.max_frames {
        if options.stop.is_stop_requested() {
            return Err(RegistrationError::CaptureCancelled);
        }

        let image = source.next_frame()?.into_gray_image()?;
        let regions = detector.detect_regions(&image)?;
        if !regions.is_empty() {
            tracing::debug!(attempt, regions = regions.len(), "face in view");
            return Ok(image);
        }
    }
    Err(RegistrationError::NoFaceInView(options.max_frames))
}

/// Write `capture` as a PNG into a file that did not exist before.
///
/// Existing files are never overwritten: on a name clash the next free
/// `-N` suffix is used.
fn save_capture(
    capture: &GrayImage,
    name: &str,
    dir: &Path,
    taken_at: NaiveDateTime,
) -> Result<PathBuf, RegistrationError> {
    std::fs::create_dir_all(dir).map_err(|source| RegistrationError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut attempt = 0u32;
    loop {
        let path = dir.join(photo_file_name(name, taken_at, attempt));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                attempt += 1;
                continue;
            }
            Err(err) => {
                return Err(RegistrationError::SavePhoto {
                    path,
                    source: image::ImageError::IoError(err),
                })
            }
        };

        let mut writer = BufWriter::new(file);
        let written = capture
            .write_to(&mut writer, ImageFormat::Png)
            .and_then(|()| writer.flush().map_err(image::ImageError::IoError));
        if let Err(source) = written {
            if let Err(err) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove partial capture");
            }
            return Err(RegistrationError::SavePhoto { path, source });
        }

        tracing::debug!(path = %path.display(), attempt, "capture saved");
        return Ok(path);
    }
}

/// `<name>_<YYYYMMDD_HHMMSS>[-N].png` with whitespace and path separators
/// replaced by underscores. `attempt` 0 has no suffix.
pub fn photo_file_name(name: &str, at: NaiveDateTime, attempt: u32) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() || c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let suffix = if attempt == 0 {
        String::new()
    } else {
        format!("-{attempt}")
    };
    format!("{stem}_{}{suffix}.png", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use facegate_core::{Embedding, FaceRegion};
    use facegate_hw::Frame;
    use std::collections::VecDeque;

    /// Representer whose verdict is fixed up front.
    struct FixedRepresenter {
        faces: usize,
        calls: usize,
    }

    impl FixedRepresenter {
        fn faces(faces: usize) -> Self {
            Self { faces, calls: 0 }
        }
    }

    impl Representer for FixedRepresenter {
        fn represent(&mut self, image: &Path) -> Result<Embedding, OracleError> {
            self.calls += 1;
            let path = image.display().to_string();
            match self.faces {
                0 => Err(OracleError::NoFaceDetected(path)),
                1 => Ok(Embedding {
                    values: vec![0.0; 512],
                    model_version: Some("test".into()),
                }),
                count => Err(OracleError::MultipleFaces { path, count }),
            }
        }
    }

    /// Finds a face only on the listed frame numbers (1-based).
    struct FaceOnFrames {
        frames: Vec<u64>,
        seen: u64,
    }

    impl RegionDetector for FaceOnFrames {
        fn detect_regions(&mut self, _frame: &GrayImage) -> Result<Vec<FaceRegion>, DetectorError> {
            self.seen += 1;
            if self.frames.contains(&self.seen) {
                Ok(vec![FaceRegion::new(1.0, 1.0, 4.0, 4.0, 0.8)])
            } else {
                Ok(Vec::new())
            }
        }
    }

    struct BlankSource {
        remaining: VecDeque<Frame>,
    }

    impl BlankSource {
        fn frames(count: usize) -> Self {
            let remaining = (0..count)
                .map(|_| Frame::new(vec![128u8; 64], 8, 8).unwrap())
                .collect();
            Self { remaining }
        }
    }

    impl FrameSource for BlankSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            self.remaining
                .pop_front()
                .ok_or_else(|| CameraError::CaptureFailed("stream closed".into()))
        }
    }

    fn setup() -> (tempfile::TempDir, RegistryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RegistryStore::open(dir.path().join("access.db")).unwrap();
        (dir, store)
    }

    fn write_photo(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        GrayImage::new(4, 4).save(&path).unwrap();
        path
    }

    fn taken_at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(14, 5, 7)
            .unwrap()
    }

    fn ana() -> NewIdentity<'static> {
        NewIdentity {
            name: "Ana",
            email: Some("ana@example.com"),
        }
    }

    #[test]
    fn test_register_photo() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "ana.png");
        let mut representer = FixedRepresenter::faces(1);

        let registered = Registrar::new(&store, &mut representer)
            .register_photo(ana(), &photo)
            .unwrap();

        let stored = store.find_identity_by_name("Ana").unwrap().unwrap();
        assert_eq!(stored.id, registered.id);
        assert_eq!(stored.email.as_deref(), Some("ana@example.com"));
        assert_eq!(stored.reference_photo_path, photo.canonicalize().unwrap());
    }

    #[test]
    fn test_duplicate_rejected_before_validation() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "ana.png");
        let mut representer = FixedRepresenter::faces(1);

        let mut registrar = Registrar::new(&store, &mut representer);
        registrar.register_photo(ana(), &photo).unwrap();
        let err = registrar.register_photo(ana(), &photo).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateIdentity(name) if name == "Ana"));

        assert_eq!(representer.calls, 1);
        assert_eq!(store.list_identities_detailed().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_photo_skips_oracle() {
        let (dir, store) = setup();
        let mut representer = FixedRepresenter::faces(1);

        let err = Registrar::new(&store, &mut representer)
            .register_photo(ana(), &dir.path().join("missing.png"))
            .unwrap_err();

        assert!(matches!(err, RegistrationError::PhotoNotFound(_)));
        assert_eq!(representer.calls, 0);
    }

    #[test]
    fn test_no_face_leaves_registry_unchanged() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "wall.png");
        let mut representer = FixedRepresenter::faces(0);

        let err = Registrar::new(&store, &mut representer)
            .register_photo(ana(), &photo)
            .unwrap_err();

        assert!(matches!(err, RegistrationError::NoFaceDetected(_)));
        assert!(store.find_identity_by_name("Ana").unwrap().is_none());
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "group.png");
        let mut representer = FixedRepresenter::faces(3);

        let err = Registrar::new(&store, &mut representer)
            .register_photo(ana(), &photo)
            .unwrap_err();

        assert!(matches!(err, RegistrationError::MultipleFaces { count: 3, .. }));
        assert!(store.list_identities_detailed().unwrap().is_empty());
    }

    #[test]
    fn test_blank_name_rejected() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "ana.png");
        let mut representer = FixedRepresenter::faces(1);

        let who = NewIdentity { name: "  ", email: None };
        let err = Registrar::new(&store, &mut representer)
            .register_photo(who, &photo)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::EmptyName));
    }

    #[test]
    fn test_register_captured_waits_for_face() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let mut representer = FixedRepresenter::faces(1);
        let mut detector = FaceOnFrames { frames: vec![3], seen: 0 };
        let mut source = BlankSource::frames(5);
        let stop = StopSignal::new();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 10,
            stop: &stop,
        };

        let who = NewIdentity { name: "Ana Maria", email: None };
        let registered = Registrar::new(&store, &mut representer)
            .register_captured(who, &mut detector, &mut source, &options)
            .unwrap();

        assert_eq!(detector.seen, 3);
        assert!(registered.reference_photo.is_file());
        assert!(registered.reference_photo.starts_with(&photo_dir));
        let file_name = registered.reference_photo.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("Ana_Maria_"));
        assert!(store.find_identity_by_name("Ana Maria").unwrap().is_some());
    }

    #[test]
    fn test_rejected_capture_is_removed() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let mut representer = FixedRepresenter::faces(2);
        let mut detector = FaceOnFrames { frames: vec![1], seen: 0 };
        let mut source = BlankSource::frames(1);
        let stop = StopSignal::new();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 10,
            stop: &stop,
        };

        let err = Registrar::new(&store, &mut representer)
            .register_captured(ana(), &mut detector, &mut source, &options)
            .unwrap_err();

        assert!(matches!(err, RegistrationError::MultipleFaces { .. }));
        assert_eq!(std::fs::read_dir(&photo_dir).unwrap().count(), 0);
        assert!(store.find_identity_by_name("Ana").unwrap().is_none());
    }

    #[test]
    fn test_capture_gives_up_after_max_frames() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let mut representer = FixedRepresenter::faces(1);
        let mut detector = FaceOnFrames { frames: vec![], seen: 0 };
        let mut source = BlankSource::frames(10);
        let stop = StopSignal::new();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 4,
            stop: &stop,
        };

        let err = Registrar::new(&store, &mut representer)
            .register_captured(ana(), &mut detector, &mut source, &options)
            .unwrap_err();

        assert!(matches!(err, RegistrationError::NoFaceInView(4)));
        assert_eq!(detector.seen, 4);
        assert_eq!(representer.calls, 0);
        assert!(!photo_dir.exists());
    }

    #[test]
    fn test_capture_cancelled_by_stop() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let mut representer = FixedRepresenter::faces(1);
        let mut detector = FaceOnFrames { frames: vec![1], seen: 0 };
        let mut source = BlankSource::frames(3);
        let stop = StopSignal::new();
        stop.request_stop();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 10,
            stop: &stop,
        };

        let err = Registrar::new(&store, &mut representer)
            .register_captured(ana(), &mut detector, &mut source, &options)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::CaptureCancelled));
        assert_eq!(detector.seen, 0);
    }

    #[test]
    fn test_camera_failure_during_capture() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let mut representer = FixedRepresenter::faces(1);
        let mut detector = FaceOnFrames { frames: vec![], seen: 0 };
        let mut source = BlankSource::frames(0);
        let stop = StopSignal::new();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 10,
            stop: &stop,
        };

        let err = Registrar::new(&store, &mut representer)
            .register_captured(ana(), &mut detector, &mut source, &options)
            .unwrap_err();
        assert!(matches!(err, RegistrationError::CameraUnavailable(_)));
    }

    #[test]
    fn test_photo_file_name() {
        let at = taken_at();
        assert_eq!(photo_file_name("Ana Maria", at, 0), "Ana_Maria_20240309_140507.png");
        assert_eq!(photo_file_name(" a/b ", at, 0), "a_b_20240309_140507.png");
        assert_eq!(photo_file_name("Ana", at, 2), "Ana_20240309_140507-2.png");
    }

    #[test]
    fn test_save_capture_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let first_image = GrayImage::from_pixel(4, 4, image::Luma([10u8]));
        let second_image = GrayImage::from_pixel(4, 4, image::Luma([200u8]));

        // Both names map to the same stem.
        let first = save_capture(&first_image, "Ana Maria", dir.path(), taken_at()).unwrap();
        let before = std::fs::read(&first).unwrap();
        let second = save_capture(&second_image, "Ana_Maria", dir.path(), taken_at()).unwrap();

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("Ana_Maria_20240309_140507-1.png"));
        assert_eq!(std::fs::read(&first).unwrap(), before);
        assert_eq!(image::open(&second).unwrap().to_luma8().get_pixel(0, 0).0[0], 200);
    }

    #[test]
    fn test_rejected_capture_keeps_other_identity_photo() {
        let (dir, store) = setup();
        let photo_dir = dir.path().join("known_faces");
        let stop = StopSignal::new();
        let options = CaptureOptions {
            photo_dir: &photo_dir,
            max_frames: 10,
            stop: &stop,
        };

        let mut accepting = FixedRepresenter::faces(1);
        let first = Registrar::new(&store, &mut accepting)
            .register_captured(
                NewIdentity { name: "Ana Maria", email: None },
                &mut FaceOnFrames { frames: vec![1], seen: 0 },
                &mut BlankSource::frames(1),
                &options,
            )
            .unwrap();

        let mut rejecting = FixedRepresenter::faces(0);
        let err = Registrar::new(&store, &mut rejecting)
            .register_captured(
                NewIdentity { name: "Ana_Maria", email: None },
                &mut FaceOnFrames { frames: vec![1], seen: 0 },
                &mut BlankSource::frames(1),
                &options,
            )
            .unwrap_err();

        assert!(matches!(err, RegistrationError::NoFaceDetected(_)));
        assert!(first.reference_photo.is_file());
        assert_eq!(std::fs::read_dir(&photo_dir).unwrap().count(), 1);
        let stored = store.find_identity_by_name("Ana Maria").unwrap().unwrap();
        assert_eq!(stored.reference_photo_path, first.reference_photo);
    }

    #[test]
    fn test_name_is_trimmed_before_storing() {
        let (dir, store) = setup();
        let photo = write_photo(dir.path(), "ana.png");
        let mut representer = FixedRepresenter::faces(1);
        let mut registrar = Registrar::new(&store, &mut representer);

        let padded = NewIdentity { name: "  Ana ", email: None };
        let registered = registrar.register_photo(padded, &photo).unwrap();
        assert_eq!(registered.name, "Ana");
        assert!(store.find_identity_by_name("Ana").unwrap().is_some());

        let err = registrar.register_photo(ana(), &photo).unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateIdentity(name) if name == "Ana"));
    }

    #[test]
    fn test_check_name() {
        let (_dir, store) = setup();
        store.add_identity("Ana", None, Path::new("ana.png")).unwrap();

        assert_eq!(check_name(&store, " Luis ").unwrap(), "Luis");
        assert!(matches!(check_name(&store, "Ana "), Err(RegistrationError::DuplicateIdentity(_))));
        assert!(matches!(check_name(&store, ""), Err(RegistrationError::EmptyName)));
    }
}
