//! In-memory fakes for the camera, extractor and operator.
//!
//! Frames are tiny uniform images; the pixel value acts as a tag that the
//! fake extractor maps to a fixed list of faces.

use crate::capture::{CameraOpener, CaptureError, FrameSource};
use crate::enroll::EnrollmentPrompt;
use crate::extractor::{DescriptorExtractor, ExtractorError};
use crate::gate::{Command, Controls, Display, FrameView};
use crate::types::{BoundingBox, Descriptor, Detection};
use image::{GrayImage, Luma};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

pub fn descriptor(values: &[f32]) -> Descriptor {
    Descriptor::new(values.to_vec())
}

pub fn frame(tag: u8) -> GrayImage {
    GrayImage::from_pixel(8, 8, Luma([tag]))
}

fn tag_of(image: &GrayImage) -> u8 {
    image.get_pixel(0, 0)[0]
}

#[derive(Default)]
pub struct FakeExtractor {
    faces: HashMap<u8, Vec<Descriptor>>,
    failing: HashSet<u8>,
    calls: usize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faces(mut self, tag: u8, descriptors: Vec<Descriptor>) -> Self {
        self.faces.insert(tag, descriptors);
        self
    }

    pub fn failing_on(mut self, tag: u8) -> Self {
        self.failing.insert(tag);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl DescriptorExtractor for FakeExtractor {
    fn detect(&mut self, image: &GrayImage) -> Result<Vec<Detection>, ExtractorError> {
        self.calls += 1;
        let tag = tag_of(image);
        if self.failing.contains(&tag) {
            return Err(ExtractorError::Failed(format!("frame tag {tag}")));
        }
        let detections = self
            .faces
            .get(&tag)
            .map(|descriptors| {
                descriptors
                    .iter()
                    .enumerate()
                    .map(|(i, d)| Detection {
                        bbox: BoundingBox {
                            x: 10.0 * i as f32,
                            y: 0.0,
                            width: 8.0,
                            height: 8.0,
                            confidence: 0.99,
                        },
                        descriptor: d.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(detections)
    }
}

#[derive(Default)]
struct CameraState {
    frames: VecDeque<Result<GrayImage, CaptureError>>,
    unavailable: bool,
    /// Remaining successful opens before the camera becomes unavailable.
    opens_left: Option<usize>,
    opens: usize,
    open_handles: usize,
}

/// Shared view of a fake camera; clones observe the same device.
#[derive(Clone, Default)]
pub struct CameraHandle {
    state: Rc<RefCell<CameraState>>,
}

impl CameraHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opener(&self) -> FakeOpener {
        FakeOpener {
            handle: self.clone(),
        }
    }

    pub fn push_frame(&self, image: GrayImage) {
        self.state.borrow_mut().frames.push_back(Ok(image));
    }

    pub fn push_error(&self) {
        self.state
            .borrow_mut()
            .frames
            .push_back(Err(CaptureError::Frame("dequeue timed out".into())));
    }

    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().unavailable = !available;
    }

    pub fn allow_opens(&self, count: usize) {
        self.state.borrow_mut().opens_left = Some(count);
    }

    pub fn opens(&self) -> usize {
        self.state.borrow().opens
    }

    pub fn open_handles(&self) -> usize {
        self.state.borrow().open_handles
    }
}

pub struct FakeOpener {
    handle: CameraHandle,
}

impl CameraOpener for FakeOpener {
    type Source = FakeSource;

    fn open(&self) -> Result<FakeSource, CaptureError> {
        let mut state = self.handle.state.borrow_mut();
        if state.unavailable || state.opens_left == Some(0) {
            return Err(CaptureError::Unavailable("/dev/fake0".into()));
        }
        if let Some(left) = state.opens_left.as_mut() {
            *left -= 1;
        }
        state.opens += 1;
        state.open_handles += 1;
        Ok(FakeSource {
            handle: self.handle.clone(),
        })
    }
}

pub struct FakeSource {
    handle: CameraHandle,
}

impl FrameSource for FakeSource {
    fn next_frame(&mut self) -> Result<GrayImage, CaptureError> {
        // An exhausted script yields empty scenes.
        self.handle
            .state
            .borrow_mut()
            .frames
            .pop_front()
            .unwrap_or_else(|| Ok(frame(0)))
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.handle.state.borrow_mut().open_handles -= 1;
    }
}

pub struct ScriptedPrompt {
    names: VecDeque<String>,
    confirm: bool,
    capture: bool,
    confirmations: usize,
}

impl Default for ScriptedPrompt {
    fn default() -> Self {
        Self {
            names: VecDeque::new(),
            confirm: false,
            capture: true,
            confirmations: 0,
        }
    }
}

impl ScriptedPrompt {
    pub fn with_name(mut self, name: &str) -> Self {
        self.names.push_back(name.to_string());
        self
    }

    pub fn confirming(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn capturing(mut self, capture: bool) -> Self {
        self.capture = capture;
        self
    }

    pub fn confirmations_asked(&self) -> usize {
        self.confirmations
    }
}

impl EnrollmentPrompt for ScriptedPrompt {
    fn ask_name(&mut self) -> Option<String> {
        self.names.pop_front()
    }

    fn confirm_overwrite(&mut self, _name: &str) -> bool {
        self.confirmations += 1;
        self.confirm
    }

    fn capture(&mut self, camera: &mut dyn FrameSource) -> Option<GrayImage> {
        if !self.capture {
            return None;
        }
        camera.next_frame().ok()
    }
}

#[derive(Default)]
pub struct ScriptedControls {
    commands: VecDeque<Option<Command>>,
}

impl ScriptedControls {
    /// `None` entries are iterations with no key pressed.
    pub fn new(commands: Vec<Option<Command>>) -> Self {
        Self {
            commands: commands.into(),
        }
    }
}

impl Controls for ScriptedControls {
    fn poll(&mut self) -> Option<Command> {
        // An exhausted script quits so loops always terminate.
        self.commands.pop_front().unwrap_or(Some(Command::Quit))
    }
}

/// What one rendered iteration looked like.
#[derive(Debug, Clone, PartialEq)]
pub struct Shown {
    pub labels: Vec<String>,
    pub feedback: Option<String>,
}

#[derive(Default)]
pub struct RecordingDisplay {
    pub shown: Vec<Shown>,
    pub alerts: Vec<String>,
}

impl Display for RecordingDisplay {
    fn show(&mut self, view: &FrameView<'_>) {
        self.shown.push(Shown {
            labels: view.faces.iter().map(|f| f.name.clone()).collect(),
            feedback: view.feedback.map(|f| f.message.clone()),
        });
    }

    fn alert(&mut self, message: &str) {
        self.alerts.push(message.to_string());
    }
}
