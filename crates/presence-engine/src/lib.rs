//! presence-engine — Runtime wiring for face verification.
//!
//! Environment-driven [`Config`], the [`Engine`] composition root that owns
//! the shared embedding engine, and the per-session pipeline task.

pub mod config;
pub mod engine;
pub mod session;

pub use config::Config;
pub use engine::{Engine, EngineError};
pub use session::{FrameGate, SessionConfig, SessionHandle, SessionOutcome, SessionUpdate};
