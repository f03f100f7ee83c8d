//! Access loop: scan frames, match faces, log decisions, hand off to
//! enrollment on request.
//!
//! States: `Idle → Scanning ⇄ Matching → (Stopped | EnrollmentSuspended)`.
//! The enrolled set is an in-memory snapshot, replaced only by
//! [`Gate::reload`], which runs at start and after every enrollment
//! hand-off. Scanning and enrollment never overlap, and the camera is
//! released for the duration of an enrollment.

use crate::access_log::AccessLog;
use crate::capture::{CameraOpener, CaptureError, FrameSource};
use crate::enroll::{Enrolled, Enroller, EnrollmentError, EnrollmentPrompt};
use crate::extractor::DescriptorExtractor;
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::{
    now_timestamp, AccessAttempt, BoundingBox, Detection, UserRecord, DEFAULT_MATCH_THRESHOLD,
};
use image::GrayImage;
use std::time::{Duration, Instant};
use thiserror::Error;

const CAMERA_LOST_MESSAGE: &str = "Camera Error! Restart Needed.";

#[derive(Error, Debug)]
pub enum GateError {
    #[error("cannot access the camera: {0}")]
    CameraUnavailable(#[source] CaptureError),
    #[error("could not re-access the camera after registration: {0}")]
    CameraLost(#[source] CaptureError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Constructed, camera not yet acquired.
    Idle,
    Scanning,
    /// A recognition pass is in flight.
    Matching,
    /// Camera released, enrollment flow in control.
    EnrollmentSuspended,
    Stopped,
}

/// Operator commands the loop responds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    Quit,
}

pub trait Controls {
    /// Non-blocking check for a pending command.
    fn poll(&mut self) -> Option<Command>;
}

pub trait Display {
    fn show(&mut self, view: &FrameView<'_>);

    /// Show an error that ends the session.
    fn alert(&mut self, message: &str);
}

/// A face box with the label from the last recognition pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledFace {
    pub bbox: BoundingBox,
    pub name: String,
    pub granted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Granted,
    Denied,
    Notice,
}

/// Transient status message.
#[derive(Debug, Clone)]
pub struct Feedback {
    pub message: String,
    pub tone: Tone,
    pub shown_at: Instant,
}

impl Feedback {
    pub fn new(message: impl Into<String>, tone: Tone) -> Self {
        Self {
            message: message.into(),
            tone,
            shown_at: Instant::now(),
        }
    }

    pub fn is_active(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.shown_at) < window
    }
}

/// Everything a display needs for one iteration.
pub struct FrameView<'a> {
    pub frame: &'a GrayImage,
    pub faces: &'a [LabeledFace],
    pub feedback: Option<&'a Feedback>,
    pub state: GateState,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Inclusive Euclidean acceptance threshold.
    pub threshold: f32,
    /// How long a feedback message stays visible.
    pub feedback_window: Duration,
    /// Pause after a failed frame grab.
    pub retry_delay: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            feedback_window: Duration::from_secs(3),
            retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct Gate<O: CameraOpener, E, M = EuclideanMatcher> {
    opener: O,
    camera: Option<O::Source>,
    extractor: E,
    matcher: M,
    enroller: Enroller,
    log: AccessLog,
    enrolled: Vec<UserRecord>,
    config: GateConfig,
    state: GateState,
    /// Alternates every frame; odd frames reuse the previous pass.
    process_this_frame: bool,
    faces: Vec<LabeledFace>,
    feedback: Option<Feedback>,
    last_enrollment: Option<Result<Enrolled, EnrollmentError>>,
}

impl<O: CameraOpener, E: DescriptorExtractor> Gate<O, E, EuclideanMatcher> {
    pub fn new(opener: O, extractor: E, enroller: Enroller, log: AccessLog, config: GateConfig) -> Self {
        Self::with_matcher(opener, extractor, EuclideanMatcher, enroller, log, config)
    }
}

impl<O: CameraOpener, E: DescriptorExtractor, M: Matcher> Gate<O, E, M> {
    /// Build the loop and load the enrolled set.
    pub fn with_matcher(
        opener: O,
        extractor: E,
        matcher: M,
        enroller: Enroller,
        log: AccessLog,
        config: GateConfig,
    ) -> Self {
        let mut gate = Self {
            opener,
            camera: None,
            extractor,
            matcher,
            enroller,
            log,
            enrolled: Vec::new(),
            config,
            state: GateState::Idle,
            process_this_frame: true,
            faces: Vec::new(),
            feedback: None,
            last_enrollment: None,
        };
        gate.reload();
        gate
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn enrolled(&self) -> &[UserRecord] {
        &self.enrolled
    }

    pub fn faces(&self) -> &[LabeledFace] {
        &self.faces
    }

    pub fn feedback(&self) -> Option<&Feedback> {
        self.feedback.as_ref()
    }

    pub fn access_log(&self) -> &AccessLog {
        &self.log
    }

    /// Outcome of the most recent enrollment hand-off.
    pub fn last_enrollment(&self) -> Option<&Result<Enrolled, EnrollmentError>> {
        self.last_enrollment.as_ref()
    }

    /// Replace the in-memory enrolled set with the store's current contents.
    /// Returns the number of records loaded.
    pub fn reload(&mut self) -> usize {
        self.enrolled = self.enroller.store().load();
        tracing::info!(
            count = self.enrolled.len(),
            path = %self.enroller.store().path().display(),
            "loaded authorized users"
        );
        self.enrolled.len()
    }

    /// Run until quit. Fails only when the camera cannot be acquired.
    pub fn run(
        &mut self,
        controls: &mut dyn Controls,
        display: &mut dyn Display,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<(), GateError> {
        while self.step(controls, display, prompt)? != GateState::Stopped {}
        Ok(())
    }

    /// One loop iteration: grab a frame, recognize on alternate frames,
    /// render, then act on at most one operator command.
    pub fn step(
        &mut self,
        controls: &mut dyn Controls,
        display: &mut dyn Display,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<GateState, GateError> {
        if self.state == GateState::Stopped {
            return Ok(self.state);
        }
        if self.camera.is_none() {
            self.start(display)?;
        }
        let Some(camera) = self.camera.as_mut() else {
            return Ok(self.state);
        };

        match camera.next_frame() {
            Ok(frame) => {
                self.scan(&frame);
                let now = Instant::now();
                if self
                    .feedback
                    .as_ref()
                    .is_some_and(|f| !f.is_active(now, self.config.feedback_window))
                {
                    self.feedback = None;
                }
                display.show(&FrameView {
                    frame: &frame,
                    faces: &self.faces,
                    feedback: self.feedback.as_ref(),
                    state: self.state,
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to grab frame; retrying");
                std::thread::sleep(self.config.retry_delay);
            }
        }

        match controls.poll() {
            Some(Command::Quit) => self.stop(),
            Some(Command::Register) => self.suspend_for_enrollment(display, prompt)?,
            None => {}
        }
        Ok(self.state)
    }

    /// Release the camera and end the loop.
    pub fn stop(&mut self) {
        tracing::info!("quitting access control");
        self.camera = None;
        self.faces.clear();
        self.state = GateState::Stopped;
    }

    fn start(&mut self, display: &mut dyn Display) -> Result<(), GateError> {
        match self.opener.open() {
            Ok(camera) => {
                self.camera = Some(camera);
                self.state = GateState::Scanning;
                tracing::info!(enrolled = self.enrolled.len(), "access control active");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot access the camera");
                display.alert("Cannot access the camera.");
                self.state = GateState::Stopped;
                Err(GateError::CameraUnavailable(e))
            }
        }
    }

    fn scan(&mut self, frame: &GrayImage) {
        if self.process_this_frame {
            self.state = GateState::Matching;
            let faces: Vec<LabeledFace> = match self.extractor.detect(frame) {
                Ok(detections) => detections.into_iter().map(|d| self.decide(d)).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "face extraction failed");
                    Vec::new()
                }
            };
            self.faces = faces;
            self.state = GateState::Scanning;
        }
        self.process_this_frame = !self.process_this_frame;
    }

    fn decide(&mut self, detection: Detection) -> LabeledFace {
        let outcome = self
            .matcher
            .compare(&detection.descriptor, &self.enrolled, self.config.threshold);
        tracing::debug!(
            name = %outcome.name,
            distance = ?outcome.distance,
            threshold = self.config.threshold,
            "match decision"
        );

        let attempt = AccessAttempt::from_outcome(&outcome, now_timestamp());
        if let Err(e) = self.log.record(&attempt) {
            tracing::warn!(error = %e, path = %self.log.path().display(), "failed to write access log");
        }

        let tone = if outcome.granted { Tone::Granted } else { Tone::Denied };
        self.feedback = Some(Feedback::new(
            format!("Access: {} for {}", outcome.status(), outcome.name),
            tone,
        ));

        LabeledFace {
            bbox: detection.bbox,
            name: outcome.name,
            granted: outcome.granted,
        }
    }

    fn suspend_for_enrollment(
        &mut self,
        display: &mut dyn Display,
        prompt: &mut dyn EnrollmentPrompt,
    ) -> Result<(), GateError> {
        tracing::info!("initiating new user registration");
        self.state = GateState::EnrollmentSuspended;
        self.camera = None;
        self.faces.clear();
        self.process_this_frame = true;

        let outcome = self
            .enroller
            .run_interactive(&self.opener, &mut self.extractor, prompt);
        let feedback = match &outcome {
            Ok(enrolled) => {
                tracing::info!(name = %enrolled.record.name, "registration completed");
                Feedback::new("Registration Process Completed", Tone::Notice)
            }
            Err(EnrollmentError::Cancelled) => {
                tracing::info!("registration cancelled");
                Feedback::new("Registration Cancelled", Tone::Notice)
            }
            Err(e) => {
                tracing::warn!(error = %e, "registration aborted");
                Feedback::new(format!("Registration Failed: {e}"), Tone::Denied)
            }
        };
        self.last_enrollment = Some(outcome);

        match self.opener.open() {
            Ok(camera) => self.camera = Some(camera),
            Err(e) => {
                tracing::error!(error = %e, "could not re-access camera after registration");
                display.alert(CAMERA_LOST_MESSAGE);
                self.state = GateState::Stopped;
                return Err(GateError::CameraLost(e));
            }
        }

        self.reload();
        self.feedback = Some(feedback);
        self.state = GateState::Scanning;
        Ok(())
    }
}
