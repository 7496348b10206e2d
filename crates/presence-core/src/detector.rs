//! Face detection wrapper over an external on-device detection service.
//!
//! The detection network itself is opaque: anything implementing
//! [`FaceDetectionService`] can back the pipeline. [`FaceDetector`] adds the
//! frame checks and largest-face selection the liveness pipeline relies on.

use crate::types::DetectedFace;
use presence_frame::Frame;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("frame has no pixel data")]
    FrameUnavailable,
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detection service failed: {0}")]
    Service(String),
}

#[derive(Error, Debug)]
#[error("{0}")]
pub struct ServiceError(pub String);

/// Contract of the external face-detection service.
///
/// Returns every face found in the upright frame, in the service's native order.
pub trait FaceDetectionService: Send + Sync {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ServiceError>;
}

/// Single-face detector used by the verification pipeline.
///
/// The caller keeps ownership of the frame; frames leased from a
/// `FramePool` are released when the caller drops the lease, whatever
/// this call returns.
pub struct FaceDetector<S> {
    service: S,
}

impl<S: FaceDetectionService> FaceDetector<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Detect the primary face in `frame`.
    pub fn detect(&self, frame: &Frame) -> Result<DetectedFace, DetectionError> {
        if frame.is_empty() {
            return Err(DetectionError::FrameUnavailable);
        }

        let faces = self
            .service
            .detect_faces(frame)
            .map_err(|e| DetectionError::Service(e.0))?;

        tracing::trace!(
            sequence = frame.sequence,
            rotation = frame.rotation.degrees(),
            count = faces.len(),
            "detection service returned"
        );

        select_largest(faces).ok_or(DetectionError::NoFaceDetected)
    }
}

/// Pick the face with the greatest bounding-box area; ties go to the first.
pub fn select_largest(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    let mut best: Option<DetectedFace> = None;
    for face in faces {
        let larger = match &best {
            None => true,
            Some(current) => face.bounding_box.area() > current.bounding_box.area(),
        };
        if larger {
            best = Some(face);
        }
    }
    best
}

#[derive(Deserialize)]
struct ReplayRecord {
    sequence: u32,
    #[serde(default)]
    faces: Vec<DetectedFace>,
}

/// Plays back recorded detections keyed by frame sequence number.
///
/// Input is JSON lines: `{"sequence": 0, "faces": [ ... ]}`. Frames with no
/// record yield no faces.
#[derive(Default)]
pub struct ReplayDetector {
    records: HashMap<u32, Vec<DetectedFace>>,
}

impl ReplayDetector {
    pub fn from_reader(reader: impl BufRead) -> Result<Self, ServiceError> {
        let mut records = HashMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ServiceError(format!("read failed: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(&line)
                .map_err(|e| ServiceError(format!("line {}: {e}", line_no + 1)))?;
            records.insert(record.sequence, record.faces);
        }
        Ok(Self { records })
    }

    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        let file = std::fs::File::open(path)
            .map_err(|e| ServiceError(format!("{}: {e}", path.display())))?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn insert(&mut self, sequence: u32, faces: Vec<DetectedFace>) {
        self.records.insert(sequence, faces);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FaceDetectionService for ReplayDetector {
    fn detect_faces(&self, frame: &Frame) -> Result<Vec<DetectedFace>, ServiceError> {
        Ok(self.records.get(&frame.sequence).cloned().unwrap_or_default())
    }
}
