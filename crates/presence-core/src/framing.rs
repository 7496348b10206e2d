//! Framing validation: is the face big enough, small enough, and centered?

use crate::types::BoundingBox;

/// Smallest accepted face side, as a fraction of the frame's shorter side.
pub const MIN_FACE_RATIO: f32 = 0.20;
/// Largest accepted face side, as a fraction of the frame's shorter side.
pub const MAX_FACE_RATIO: f32 = 0.80;
/// Largest accepted center offset, as a fraction of frame width/height per axis.
pub const MAX_CENTER_OFFSET: f32 = 0.25;

/// Upright frame dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for FrameSize {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Decide whether a detected face is adequately sized and centered for capture.
///
/// Boundaries are inclusive: a face exactly at 20% / 80% or exactly 25% off
/// center is accepted.
pub fn is_well_positioned(face: &BoundingBox, frame_width: u32, frame_height: u32) -> bool {
    if frame_width == 0 || frame_height == 0 || !face.is_finite() {
        return false;
    }

    let w = frame_width as f32;
    let h = frame_height as f32;
    let reference = w.min(h);

    let side = face.min_side();
    if side < MIN_FACE_RATIO * reference || side > MAX_FACE_RATIO * reference {
        return false;
    }

    let (cx, cy) = face.center();
    (cx - w / 2.0).abs() <= MAX_CENTER_OFFSET * w && (cy - h / 2.0).abs() <= MAX_CENTER_OFFSET * h
}
