//! Active liveness protocol: debounce a well-framed face, then wait for a
//! deliberate blink or smile within a bounded window.
//!
//! The protocol is a plain enum plus a pure step function
//! ([`LivenessMachine::step`]), so it can be driven frame by frame from the
//! pipeline or from a test with synthetic timestamps.
//!
//! ```text
//! Idle ──start──▶ DetectingFace ──N framed frames──▶ WaitingForLiveness
//!                                                      │ blink | smile
//!                                                      ▼
//!            Success ◀──ok── VerifyingFace ◀──── LivenessDetected
//!            Failure ◀──err──┘
//! WaitingForLiveness ──window elapsed──▶ Timeout
//! any state after DetectingFace ──face lost > grace──▶ Failure
//! ```

use crate::crop::CropError;
use crate::embedding::EmbeddingError;
use crate::framing::{is_well_positioned, FrameSize};
use crate::types::DetectedFace;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Both eye-open probabilities must be strictly below this to count as a blink.
pub const DEFAULT_BLINK_THRESHOLD: f32 = 0.4;
/// Smiling probability must be strictly above this to count as a smile.
pub const DEFAULT_SMILE_THRESHOLD: f32 = 0.7;
/// Consecutive well-framed frames required before asking for a gesture.
pub const DEFAULT_DEBOUNCE_FRAMES: u32 = 3;
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FACE_LOSS_GRACE: Duration = Duration::from_millis(1500);
pub const DEFAULT_SESSION_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LivenessState {
    Idle,
    DetectingFace,
    WaitingForLiveness,
    LivenessDetected,
    VerifyingFace,
    Success,
    Failure,
    Timeout,
}

impl LivenessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LivenessGesture {
    Blink,
    Smile,
}

/// Why a session ended in [`LivenessState::Failure`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureCause {
    #[error("face left the frame")]
    FaceLost,
    #[error("crop failed: {0}")]
    Crop(#[from] CropError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

impl FailureCause {
    /// Coarse category so the UI can tell network, model and framing problems apart.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FaceLost | Self::Crop(_) => "framing",
            Self::Embedding(EmbeddingError::AcquisitionFailed(_)) => "network",
            Self::Embedding(_) => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
    pub blink_threshold: f32,
    pub smile_threshold: f32,
    pub debounce_frames: u32,
    pub liveness_timeout: Duration,
    pub face_loss_grace: Duration,
    /// Upper bound on time spent looking for a face before giving up.
    pub session_budget: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            blink_threshold: DEFAULT_BLINK_THRESHOLD,
            smile_threshold: DEFAULT_SMILE_THRESHOLD,
            debounce_frames: DEFAULT_DEBOUNCE_FRAMES,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            face_loss_grace: DEFAULT_FACE_LOSS_GRACE,
            session_budget: DEFAULT_SESSION_BUDGET,
        }
    }
}

/// State of one verification attempt. Owned by a single writer.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationSession {
    pub state: LivenessState,
    pub started_at: Instant,
    pub state_entered_at: Instant,
    /// Consecutive well-framed frames seen while detecting.
    pub consecutive_framed: u32,
    pub last_face_at: Instant,
    pub gesture: Option<LivenessGesture>,
    pub failure: Option<FailureCause>,
}

impl VerificationSession {
    pub fn new(now: Instant) -> Self {
        Self {
            state: LivenessState::Idle,
            started_at: now,
            state_entered_at: now,
            consecutive_framed: 0,
            last_face_at: now,
            gesture: None,
            failure: None,
        }
    }

    /// `Idle → DetectingFace`. Returns false if the session was not idle.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.state != LivenessState::Idle {
            return false;
        }
        *self = Self::new(now);
        self.enter(LivenessState::DetectingFace, now);
        true
    }

    /// Discard all progress and return to `Idle`.
    pub fn reset(&mut self, now: Instant) {
        *self = Self::new(now);
    }

    /// `LivenessDetected → VerifyingFace`, called once the frame is captured.
    pub fn begin_verifying(&mut self, now: Instant) -> bool {
        if self.state != LivenessState::LivenessDetected {
            return false;
        }
        self.enter(LivenessState::VerifyingFace, now);
        true
    }

    /// Settle `VerifyingFace` with the crop/embedding outcome.
    pub fn complete(&mut self, outcome: Result<(), FailureCause>, now: Instant) -> bool {
        if self.state != LivenessState::VerifyingFace {
            return false;
        }
        match outcome {
            Ok(()) => self.enter(LivenessState::Success, now),
            Err(cause) => self.fail(cause, now),
        }
        true
    }

    /// Advance by one frame observation.
    pub fn tick(
        &mut self,
        machine: &LivenessMachine,
        face: Option<&DetectedFace>,
        frame: FrameSize,
        now: Instant,
    ) -> LivenessState {
        let previous = self.state;
        *self = machine.step(self, face, frame, now);
        if self.state != previous {
            tracing::debug!(from = ?previous, to = ?self.state, gesture = ?self.gesture, "liveness transition");
        }
        self.state
    }

    /// Check deadlines only; see [`LivenessMachine::expire`].
    pub fn expire(&mut self, machine: &LivenessMachine, now: Instant) -> LivenessState {
        let previous = self.state;
        *self = machine.expire(self, now);
        if self.state != previous {
            tracing::debug!(from = ?previous, to = ?self.state, "liveness deadline passed");
        }
        self.state
    }

    fn enter(&mut self, state: LivenessState, now: Instant) {
        self.state = state;
        self.state_entered_at = now;
    }

    fn fail(&mut self, cause: FailureCause, now: Instant) {
        self.failure = Some(cause);
        self.enter(LivenessState::Failure, now);
    }
}

/// Transition rules, parameterised by [`LivenessConfig`].
#[derive(Debug, Clone, Default)]
pub struct LivenessMachine {
    config: LivenessConfig,
}

impl LivenessMachine {
    pub fn new(config: LivenessConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Pure transition: the session after observing `face` (or no face) at `now`.
    pub fn step(
        &self,
        session: &VerificationSession,
        face: Option<&DetectedFace>,
        frame: FrameSize,
        now: Instant,
    ) -> VerificationSession {
        let mut next = session.clone();
        if session.state == LivenessState::Idle || session.state.is_terminal() {
            return next;
        }

        if face.is_some() {
            next.last_face_at = now;
        }
        let framed = face.filter(|f| is_well_positioned(&f.bounding_box, frame.width, frame.height));

        if session.state == LivenessState::DetectingFace {
            if now.saturating_duration_since(session.started_at) >= self.config.session_budget {
                next.enter(LivenessState::Timeout, now);
            } else if framed.is_some() {
                next.consecutive_framed += 1;
                if next.consecutive_framed >= self.config.debounce_frames {
                    next.enter(LivenessState::WaitingForLiveness, now);
                }
            } else {
                next.consecutive_framed = 0;
            }
            return next;
        }

        if session.state == LivenessState::WaitingForLiveness
            && now.saturating_duration_since(session.state_entered_at) >= self.config.liveness_timeout
        {
            next.enter(LivenessState::Timeout, now);
            return next;
        }

        if face.is_none()
            && now.saturating_duration_since(session.last_face_at) > self.config.face_loss_grace
        {
            next.fail(FailureCause::FaceLost, now);
            return next;
        }

        match session.state {
            LivenessState::WaitingForLiveness => {
                if let Some(gesture) = framed.and_then(|f| self.detect_gesture(f)) {
                    next.gesture = Some(gesture);
                    next.enter(LivenessState::LivenessDetected, now);
                }
            }
            LivenessState::LivenessDetected => next.enter(LivenessState::VerifyingFace, now),
            _ => {}
        }
        next
    }

    /// Apply only the wall-clock deadlines, without observing a frame.
    ///
    /// Used while a detection is still in flight, so a stalled detector
    /// cannot hold a session open. Debounce progress is left untouched.
    pub fn expire(&self, session: &VerificationSession, now: Instant) -> VerificationSession {
        let mut next = session.clone();
        let since = |t: Instant| now.saturating_duration_since(t);
        match session.state {
            LivenessState::DetectingFace => {
                if since(session.started_at) >= self.config.session_budget {
                    next.enter(LivenessState::Timeout, now);
                }
            }
            LivenessState::WaitingForLiveness
                if since(session.state_entered_at) >= self.config.liveness_timeout =>
            {
                next.enter(LivenessState::Timeout, now);
            }
            LivenessState::WaitingForLiveness
            | LivenessState::LivenessDetected
            | LivenessState::VerifyingFace
                if since(session.last_face_at) > self.config.face_loss_grace =>
            {
                next.fail(FailureCause::FaceLost, now);
            }
            _ => {}
        }
        next
    }

    /// Blink (both eyes closed) or smile. Blink wins when both are present.
    pub fn detect_gesture(&self, face: &DetectedFace) -> Option<LivenessGesture> {
        let blink = matches!(
            (face.left_eye_open, face.right_eye_open),
            (Some(l), Some(r)) if l < self.config.blink_threshold && r < self.config.blink_threshold
        );
        if blink {
            return Some(LivenessGesture::Blink);
        }
        match face.smiling {
            Some(s) if s > self.config.smile_threshold => Some(LivenessGesture::Smile),
            _ => None,
        }
    }
}
