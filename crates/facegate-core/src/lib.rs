//! facegate-core — Descriptor matching and enrollment consistency.
//!
//! Holds the enrolled-user store, the nearest-neighbor matcher, the
//! enrollment flow and the access loop state machine. Cameras and face
//! models are reached only through the collaborator traits in
//! [`capture`] and [`extractor`], so everything here runs on synthetic
//! frames in tests.

pub mod access_log;
pub mod capture;
pub mod enroll;
pub mod extractor;
pub mod gate;
pub mod matcher;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use access_log::{AccessLog, AccessLogError};
pub use capture::{CameraOpener, CaptureError, FrameSource};
pub use enroll::{Enrolled, Enroller, EnrollmentError, EnrollmentPrompt};
pub use extractor::{DescriptorExtractor, ExtractorError};
pub use gate::{
    Command, Controls, Display, Feedback, FrameView, Gate, GateConfig, GateError, GateState,
    LabeledFace, Tone,
};
pub use matcher::{EuclideanMatcher, Matcher};
pub use store::{EnrollmentStore, StoreError};
pub use types::{
    AccessAttempt, AccessStatus, BoundingBox, Descriptor, Detection, MatchOutcome, UserRecord,
    DEFAULT_MATCH_THRESHOLD, UNKNOWN_NAME,
};
