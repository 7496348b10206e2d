//! presence-core — Face verification pipeline.
//!
//! Largest-face selection over a detection service, framing checks, the
//! blink/smile liveness state machine, face cropping, and 128-float face
//! embeddings from an ONNX model.

pub mod acquire;
pub mod crop;
pub mod detector;
pub mod embedding;
pub mod framing;
pub mod liveness;
pub mod model;
pub mod types;

pub use acquire::{FetchError, ImageAcquirer, ImageSource, ReqwestTransport};
pub use crop::{crop, CropError};
pub use detector::{DetectionError, FaceDetectionService, FaceDetector, ReplayDetector};
pub use embedding::{EmbeddingEngine, EmbeddingError, EmbeddingGenerator, EmbeddingModel};
pub use framing::{is_well_positioned, FrameSize};
pub use liveness::{
    FailureCause, LivenessConfig, LivenessMachine, LivenessState, VerificationSession,
};
pub use types::{BoundingBox, DetectedFace, EmbeddingVector, EMBEDDING_DIM};
