//! Enrollment flow: one face, one record, one reference image.
//!
//! Name collisions need explicit confirmation. A confirmed overwrite is
//! applied together with the new record in one store rewrite, after the
//! descriptor has been extracted, so a failed capture never touches the
//! store.

use crate::capture::{CameraOpener, CaptureError, FrameSource};
use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::store::{EnrollmentStore, StoreError};
use crate::types::{now_timestamp, UserRecord, UNKNOWN_NAME};
use image::{GrayImage, ImageFormat};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("no face detected; make sure your face is clearly visible")]
    NoFaceDetected,
    #[error("detected {count} faces; make sure only one face is visible")]
    MultipleFacesDetected { count: usize },
    #[error("camera: {0}")]
    Camera(#[from] CaptureError),
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("reference image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Operator interaction needed by the flow.
pub trait EnrollmentPrompt {
    /// Ask for the new user's name; `None` cancels.
    fn ask_name(&mut self) -> Option<String>;

    /// Ask whether existing records for `name` may be replaced.
    fn confirm_overwrite(&mut self, name: &str) -> bool;

    /// Show the live feed until the operator captures a frame or cancels.
    fn capture(&mut self, camera: &mut dyn FrameSource) -> Option<GrayImage>;
}

/// A validated name with the overwrite decision already taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEnrollment {
    pub name: String,
    pub overwrite: bool,
}

/// Successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrolled {
    pub record: UserRecord,
    pub image_path: PathBuf,
    /// Records removed for the same name by an overwrite.
    pub replaced: usize,
}

#[derive(Debug, Clone)]
pub struct Enroller {
    store: EnrollmentStore,
    train_dir: PathBuf,
}

impl Enroller {
    pub fn new(store: EnrollmentStore, train_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            train_dir: train_dir.into(),
        }
    }

    pub fn store(&self) -> &EnrollmentStore {
        &self.store
    }

    pub fn train_dir(&self) -> &Path {
        &self.train_dir
    }

    /// Validate `name` and resolve a collision with existing records.
    pub fn prepare(
        &self,
        name: &str,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<PendingEnrollment, EnrollmentError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollmentError::InvalidName("name cannot be empty".into()));
        }
        if name == UNKNOWN_NAME {
            return Err(EnrollmentError::InvalidName(format!(
                "{UNKNOWN_NAME:?} is reserved for unmatched faces"
            )));
        }

        let overwrite = self.store.exists(name);
        if overwrite {
            tracing::warn!(name, "user already exists");
            if !prompt.confirm_overwrite(name) {
                tracing::info!(name, "overwrite declined");
                return Err(EnrollmentError::Cancelled);
            }
        }

        Ok(PendingEnrollment {
            name: name.to_string(),
            overwrite,
        })
    }

    /// Extract the single face in `frame` and persist it.
    pub fn complete(
        &self,
        pending: PendingEnrollment,
        frame: &GrayImage,
        extractor: &mut dyn DescriptorExtractor,
    ) -> Result<Enrolled, EnrollmentError> {
        let mut detections = extractor.detect(frame)?;
        let detection = match detections.len() {
            0 => return Err(EnrollmentError::NoFaceDetected),
            1 => detections.remove(0),
            count => return Err(EnrollmentError::MultipleFacesDetected { count }),
        };

        let record = UserRecord::new(pending.name, detection.descriptor, now_timestamp());
        let image_path = self.save_reference(&record.name, frame)?;

        let stored = if pending.overwrite {
            self.store.replace_by_name(&record)
        } else {
            self.store.append(&record).map(|()| 0)
        };
        let replaced = match stored {
            Ok(replaced) => replaced,
            Err(e) => {
                let _ = fs::remove_file(&image_path);
                return Err(e.into());
            }
        };

        tracing::info!(
            name = %record.name,
            replaced,
            image = %image_path.display(),
            "user registered"
        );
        Ok(Enrolled {
            record,
            image_path,
            replaced,
        })
    }

    /// Enroll `name` from an already captured frame.
    pub fn register(
        &self,
        frame: &GrayImage,
        name: &str,
        extractor: &mut dyn DescriptorExtractor,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<Enrolled, EnrollmentError> {
        let pending = self.prepare(name, prompt)?;
        self.complete(pending, frame, extractor)
    }

    /// Full interactive enrollment: ask for a name, confirm any overwrite,
    /// capture from a freshly opened camera, then register.
    ///
    /// The camera is released before this returns.
    pub fn run_interactive<C: CameraOpener>(
        &self,
        opener: &C,
        extractor: &mut dyn DescriptorExtractor,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<Enrolled, EnrollmentError> {
        let name = prompt.ask_name().ok_or(EnrollmentError::Cancelled)?;
        let pending = self.prepare(&name, prompt)?;

        let frame = {
            let mut camera = opener.open()?;
            prompt.capture(&mut camera)
        }
        .ok_or(EnrollmentError::Cancelled)?;

        self.complete(pending, &frame, extractor)
    }

    /// Write `frame` as `<train_dir>/<name>_<capture time>.jpg`, never
    /// replacing an earlier image.
    fn save_reference(&self, name: &str, frame: &GrayImage) -> Result<PathBuf, EnrollmentError> {
        fs::create_dir_all(&self.train_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let stem = format!("{}_{stamp}", file_stem(name));

        let mut path = self.train_dir.join(format!("{stem}.jpg"));
        let mut n = 1;
        while path.exists() {
            path = self.train_dir.join(format!("{stem}-{n}.jpg"));
            n += 1;
        }

        frame.save_with_format(&path, ImageFormat::Jpeg)?;
        Ok(path)
    }
}

/// Filesystem-safe form of a user name.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.trim_matches('_').is_empty() {
        "user".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{descriptor, frame, CameraHandle, FakeExtractor, ScriptedPrompt};
    use tempfile::TempDir;

    const ONE_FACE: u8 = 10;
    const NO_FACE: u8 = 20;
    const TWO_FACES: u8 = 30;
    const BROKEN: u8 = 40;

    fn setup(tmp: &TempDir) -> (Enroller, FakeExtractor) {
        let store = EnrollmentStore::open(tmp.path().join("authorized_users.csv")).unwrap();
        let enroller = Enroller::new(store, tmp.path().join("train"));
        let extractor = FakeExtractor::new()
            .with_faces(ONE_FACE, vec![descriptor(&[0.5, 0.5])])
            .with_faces(NO_FACE, vec![])
            .with_faces(TWO_FACES, vec![descriptor(&[0.1, 0.1]), descriptor(&[0.9, 0.9])])
            .failing_on(BROKEN);
        (enroller, extractor)
    }

    fn images(tmp: &TempDir) -> usize {
        fs::read_dir(tmp.path().join("train"))
            .map(|dir| dir.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_register_single_face() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let mut prompt = ScriptedPrompt::default();

        let enrolled = enroller
            .register(&frame(ONE_FACE), "  Alice ", &mut extractor, &mut prompt)
            .unwrap();

        assert_eq!(enrolled.record.name, "Alice");
        assert_eq!(enrolled.replaced, 0);
        assert!(enrolled.image_path.exists());
        let file_name = enrolled.image_path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("Alice_"), "{file_name}");

        let records = enroller.store().load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].descriptor.values(), &[0.5, 0.5]);
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let mut prompt = ScriptedPrompt::default();

        let err = enroller
            .register(&frame(ONE_FACE), "   ", &mut extractor, &mut prompt)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::InvalidName(_)));
        assert_eq!(extractor.calls(), 0);
        assert!(enroller.store().load().is_empty());
    }

    #[test]
    fn test_unknown_sentinel_is_reserved() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let err = enroller
            .register(&frame(ONE_FACE), UNKNOWN_NAME, &mut extractor, &mut ScriptedPrompt::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::InvalidName(_)));
    }

    #[test]
    fn test_zero_faces_leaves_store_unchanged() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let err = enroller
            .register(&frame(NO_FACE), "alice", &mut extractor, &mut ScriptedPrompt::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::NoFaceDetected));
        assert!(enroller.store().load().is_empty());
        assert_eq!(images(&tmp), 0);
    }

    #[test]
    fn test_multiple_faces_leaves_store_unchanged() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        enroller
            .register(&frame(ONE_FACE), "bob", &mut extractor, &mut ScriptedPrompt::default())
            .unwrap();

        let err = enroller
            .register(&frame(TWO_FACES), "alice", &mut extractor, &mut ScriptedPrompt::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::MultipleFacesDetected { count: 2 }));
        assert_eq!(enroller.store().load().len(), 1);
        assert_eq!(images(&tmp), 1);
    }

    #[test]
    fn test_declined_overwrite_cancels() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        enroller
            .register(&frame(ONE_FACE), "bob", &mut extractor, &mut ScriptedPrompt::default())
            .unwrap();
        let calls = extractor.calls();

        let mut prompt = ScriptedPrompt::default().confirming(false);
        let err = enroller
            .register(&frame(ONE_FACE), "bob", &mut extractor, &mut prompt)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Cancelled));
        assert_eq!(prompt.confirmations_asked(), 1);
        assert_eq!(extractor.calls(), calls);
        assert_eq!(enroller.store().load().len(), 1);
    }

    #[test]
    fn test_confirmed_overwrite_replaces_all_records() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let store = enroller.store().clone();
        let ts = now_timestamp();
        store.append(&UserRecord::new("alice", descriptor(&[0.0, 0.0]), ts)).unwrap();
        store.append(&UserRecord::new("Bob", descriptor(&[0.1, 0.2]), ts)).unwrap();
        store.append(&UserRecord::new("Bob", descriptor(&[0.3, 0.4]), ts)).unwrap();

        let mut prompt = ScriptedPrompt::default().confirming(true);
        let enrolled = enroller
            .register(&frame(ONE_FACE), "Bob", &mut extractor, &mut prompt)
            .unwrap();
        assert_eq!(enrolled.replaced, 2);

        let records = store.load();
        assert_eq!(records.len(), 2);
        let bobs: Vec<_> = records.iter().filter(|r| r.name == "Bob").collect();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].descriptor.values(), &[0.5, 0.5]);
    }

    #[test]
    fn test_overwrite_of_single_record_keeps_count() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let store = enroller.store().clone();
        store
            .append(&UserRecord::new("Bob", descriptor(&[0.1, 0.2]), now_timestamp()))
            .unwrap();

        let mut prompt = ScriptedPrompt::default().confirming(true);
        enroller
            .register(&frame(ONE_FACE), "Bob", &mut extractor, &mut prompt)
            .unwrap();
        let records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].descriptor.values(), &[0.5, 0.5]);
    }

    #[test]
    fn test_failed_extraction_after_confirm_keeps_old_records() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let store = enroller.store().clone();
        store
            .append(&UserRecord::new("Bob", descriptor(&[0.1, 0.2]), now_timestamp()))
            .unwrap();

        let mut prompt = ScriptedPrompt::default().confirming(true);
        let err = enroller
            .register(&frame(BROKEN), "Bob", &mut extractor, &mut prompt)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Extractor(_)));
        let records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].descriptor.values(), &[0.1, 0.2]);
    }

    #[test]
    fn test_repeated_enrollment_keeps_every_image() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let mut prompt = ScriptedPrompt::default().confirming(true);
        let first = enroller
            .register(&frame(ONE_FACE), "carol", &mut extractor, &mut prompt)
            .unwrap();
        let second = enroller
            .register(&frame(ONE_FACE), "carol", &mut extractor, &mut prompt)
            .unwrap();
        assert_ne!(first.image_path, second.image_path);
        assert!(first.image_path.exists());
        assert!(second.image_path.exists());
    }

    #[test]
    fn test_store_failure_removes_reference_image() {
        let tmp = TempDir::new().unwrap();
        let (enroller, _) = setup(&tmp);
        enroller
            .store()
            .append(&UserRecord::new("dave", descriptor(&[0.1, 0.2, 0.3]), now_timestamp()))
            .unwrap();
        // Two-dimensional descriptor against a three-dimensional store.
        let mut extractor = FakeExtractor::new().with_faces(ONE_FACE, vec![descriptor(&[0.5, 0.5])]);

        let err = enroller
            .register(&frame(ONE_FACE), "erin", &mut extractor, &mut ScriptedPrompt::default())
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Store(StoreError::DimensionMismatch { .. })));
        assert_eq!(images(&tmp), 0);
    }

    #[test]
    fn test_run_interactive_captures_and_releases_camera() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let camera = CameraHandle::new();
        camera.push_frame(frame(ONE_FACE));

        let mut prompt = ScriptedPrompt::default().with_name("frank");
        let enrolled = enroller
            .run_interactive(&camera.opener(), &mut extractor, &mut prompt)
            .unwrap();
        assert_eq!(enrolled.record.name, "frank");
        assert_eq!(camera.opens(), 1);
        assert_eq!(camera.open_handles(), 0);
    }

    #[test]
    fn test_run_interactive_cancelled_capture() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let camera = CameraHandle::new();

        let mut prompt = ScriptedPrompt::default().with_name("frank").capturing(false);
        let err = enroller
            .run_interactive(&camera.opener(), &mut extractor, &mut prompt)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Cancelled));
        assert_eq!(camera.open_handles(), 0);
        assert!(enroller.store().load().is_empty());
    }

    #[test]
    fn test_run_interactive_without_camera() {
        let tmp = TempDir::new().unwrap();
        let (enroller, mut extractor) = setup(&tmp);
        let camera = CameraHandle::new();
        camera.set_available(false);

        let mut prompt = ScriptedPrompt::default().with_name("frank");
        let err = enroller
            .run_interactive(&camera.opener(), &mut extractor, &mut prompt)
            .unwrap_err();
        assert!(matches!(err, EnrollmentError::Camera(CaptureError::Unavailable(_))));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("alice"), "alice");
        assert_eq!(file_stem("Mary Ann/../x"), "Mary_Ann____x");
        assert_eq!(file_stem("José"), "Jos_");
        assert_eq!(file_stem("../"), "user");
    }
}
