//! presence-frame — Camera frame plumbing for the verification pipeline.
//!
//! Provides the RGB `Frame` type, a bounded buffer pool whose leases are
//! released exactly once, and the `FrameSource` contract.

pub mod frame;
pub mod pool;
pub mod source;

pub use frame::{Frame, Rotation};
pub use pool::{FrameError, FrameLease, FramePool};
pub use source::{DirectoryFrameSource, FrameSource};
