use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Output length of the embedding model.
pub const EMBEDDING_DIM: usize = 128;

/// Size in bytes of an encoded [`EmbeddingVector`].
pub const ENCODED_EMBEDDING_LEN: usize = EMBEDDING_DIM * 4;

/// Face bounding box in upright frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl BoundingBox {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    /// Build a box from its top-left corner and extent.
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(x, y, x + width, y + height)
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn min_side(&self) -> f32 {
        self.width().min(self.height())
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.left.is_finite() && self.top.is_finite() && self.right.is_finite() && self.bottom.is_finite()
    }
}

/// One face reported by the detection service for a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    /// Probability in [0, 1] that the left eye is open.
    #[serde(default)]
    pub left_eye_open: Option<f32>,
    /// Probability in [0, 1] that the right eye is open.
    #[serde(default)]
    pub right_eye_open: Option<f32>,
    /// Probability in [0, 1] that the face is smiling.
    #[serde(default)]
    pub smiling: Option<f32>,
}

impl DetectedFace {
    pub fn new(bounding_box: BoundingBox) -> Self {
        Self {
            bounding_box,
            left_eye_open: None,
            right_eye_open: None,
            smiling: None,
        }
    }

    pub fn with_eyes(mut self, left: f32, right: f32) -> Self {
        self.left_eye_open = Some(left);
        self.right_eye_open = Some(right);
        self
    }

    pub fn with_smile(mut self, smiling: f32) -> Self {
        self.smiling = Some(smiling);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid embedding length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Fixed-length face embedding produced by the embedding model.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Little-endian IEEE-754 encoding, `4 × EMBEDDING_DIM` bytes, no header.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENCODED_EMBEDDING_LEN);
        for value in &self.values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    /// Inverse of [`encode`](Self::encode). Bit-exact, including NaN payloads.
    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() != ENCODED_EMBEDDING_LEN {
            return Err(EncodingError::InvalidLength {
                expected: ENCODED_EMBEDDING_LEN,
                actual: bytes.len(),
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self { values })
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &EmbeddingVector) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    pub fn euclidean_distance(&self, other: &EmbeddingVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for EmbeddingVector {
    type Error = EncodingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        if values.len() != EMBEDDING_DIM {
            return Err(EncodingError::InvalidLength {
                expected: EMBEDDING_DIM,
                actual: values.len(),
            });
        }
        Ok(Self { values })
    }
}
