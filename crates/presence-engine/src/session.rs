//! Per-session verification pipeline.
//!
//! One tokio task owns the [`VerificationSession`] and is its only writer.
//! Frames come in through [`SessionHandle::offer`]; a frame offered while a
//! detection is in flight is dropped, never queued. Detection and inference
//! run on the blocking pool.

use image::DynamicImage;
use presence_core::crop::{crop, CropError};
use presence_core::detector::{DetectionError, FaceDetectionService, FaceDetector};
use presence_core::embedding::{EmbeddingError, EmbeddingGenerator};
use presence_core::framing::FrameSize;
use presence_core::liveness::{
    FailureCause, LivenessConfig, LivenessMachine, LivenessState, VerificationSession,
};
use presence_core::types::{BoundingBox, DetectedFace, EmbeddingVector};
use presence_frame::FrameLease;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

/// Published to the UI on every state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUpdate {
    pub state: LivenessState,
    pub face: Option<BoundingBox>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Success(EmbeddingVector),
    Failure(FailureCause),
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub liveness: LivenessConfig,
    pub tick_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            tick_interval: Duration::from_millis(100),
        }
    }
}

/// Admits at most one frame into detection at a time.
#[derive(Debug, Default)]
pub struct FrameGate {
    busy: AtomicBool,
}

impl FrameGate {
    /// Claim the gate. False if a frame is already in flight.
    pub fn try_enter(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn leave(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Caller's side of a running session. Dropping it cancels the session.
pub struct SessionHandle {
    frames: mpsc::Sender<FrameLease>,
    gate: Arc<FrameGate>,
    updates: watch::Receiver<SessionUpdate>,
    outcome: oneshot::Receiver<SessionOutcome>,
    cancel: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    /// Offer a frame. Returns false (and releases the frame) if the session
    /// is still busy with the previous one or has finished.
    pub fn offer(&self, frame: FrameLease) -> bool {
        if !self.gate.try_enter() {
            tracing::trace!(sequence = frame.sequence, "frame dropped: detection in flight");
            return false;
        }
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.gate.leave();
                false
            }
        }
    }

    /// True while an accepted frame is still being processed.
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn updates(&self) -> watch::Receiver<SessionUpdate> {
        self.updates.clone()
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the session to finish.
    pub async fn outcome(mut self) -> SessionOutcome {
        (&mut self.outcome).await.unwrap_or(SessionOutcome::Cancelled)
    }
}

type Detection = (Result<DetectedFace, DetectionError>, FrameLease);

/// Spawn a session task on the current runtime and start it.
pub fn spawn_session<S>(
    detector: Arc<FaceDetector<S>>,
    generator: EmbeddingGenerator,
    config: SessionConfig,
) -> SessionHandle
where
    S: FaceDetectionService + 'static,
{
    let (frame_tx, frame_rx) = mpsc::channel(1);
    let (update_tx, update_rx) = watch::channel(SessionUpdate {
        state: LivenessState::Idle,
        face: None,
    });
    let (outcome_tx, outcome_rx) = oneshot::channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let gate = Arc::new(FrameGate::default());

    let task = SessionTask {
        machine: LivenessMachine::new(config.liveness),
        session: VerificationSession::new(Instant::now()),
        detector,
        generator,
        gate: gate.clone(),
        updates: update_tx,
        tick_interval: config.tick_interval,
        last_frame_at: Instant::now(),
        size: FrameSize::new(0, 0),
        embedding: None,
    };
    tokio::spawn(task.run(frame_rx, cancel_rx, outcome_tx));

    SessionHandle {
        frames: frame_tx,
        gate,
        updates: update_rx,
        outcome: outcome_rx,
        cancel: Some(cancel_tx),
    }
}

struct SessionTask<S> {
    machine: LivenessMachine,
    session: VerificationSession,
    detector: Arc<FaceDetector<S>>,
    generator: EmbeddingGenerator,
    gate: Arc<FrameGate>,
    updates: watch::Sender<SessionUpdate>,
    tick_interval: Duration,
    last_frame_at: Instant,
    /// Upright size of the most recent frame, reused for idle ticks.
    size: FrameSize,
    embedding: Option<EmbeddingVector>,
}

impl<S: FaceDetectionService + 'static> SessionTask<S> {
    async fn run(
        mut self,
        mut frames: mpsc::Receiver<FrameLease>,
        mut cancel: oneshot::Receiver<()>,
        outcome: oneshot::Sender<SessionOutcome>,
    ) {
        let now = Instant::now();
        self.session.start(now);
        self.last_frame_at = now;
        self.publish(None);
        tracing::info!("verification session started");

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut detecting: Option<JoinHandle<Detection>> = None;
        let mut job: Option<JoinHandle<Result<EmbeddingVector, EmbeddingError>>> = None;

        let result = loop {
            tokio::select! {
                biased;

                _ = &mut cancel => {
                    if let Some(job) = job.take() {
                        job.abort();
                    }
                    tracing::info!(state = ?self.session.state, "verification session cancelled");
                    break SessionOutcome::Cancelled;
                }

                joined = await_slot(&mut job), if job.is_some() => {
                    job = None;
                    self.finish_embedding(joined);
                }

                joined = await_slot(&mut detecting), if detecting.is_some() => {
                    detecting = None;
                    if let Some(crop) = self.on_detection(joined) {
                        job = Some(self.spawn_embedding(crop));
                    }
                    self.gate.leave();
                }

                Some(lease) = frames.recv(), if detecting.is_none() => {
                    self.last_frame_at = Instant::now();
                    let detector = self.detector.clone();
                    detecting = Some(tokio::task::spawn_blocking(move || {
                        let result = detector.detect(&lease);
                        (result, lease)
                    }));
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    if detecting.is_some() {
                        self.expire(now);
                    } else if now.saturating_duration_since(self.last_frame_at) >= self.tick_interval {
                        self.observe(None, self.size, now);
                    }
                }
            }

            if let Some(done) = self.terminal_outcome(&mut job) {
                break done;
            }
        };

        frames.close();
        if let Some(pending) = detecting.take() {
            pending.abort();
            self.gate.leave();
        }
        tracing::info!(outcome = outcome_label(&result), "verification session finished");
        let _ = outcome.send(result);
    }

    /// Apply a completed detection. Returns the face crop when liveness was
    /// just confirmed on this frame.
    fn on_detection(&mut self, joined: Result<Detection, JoinError>) -> Option<image::RgbImage> {
        let now = Instant::now();
        let (result, lease) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "detection task failed; treating as no face");
                self.observe(None, self.size, now);
                return None;
            }
        };

        let (width, height) = lease.upright_size();
        let size = FrameSize::new(width, height);
        let face = match result {
            Ok(face) => Some(face),
            Err(e) => {
                tracing::debug!(sequence = lease.sequence, error = %e, "no usable face this frame");
                None
            }
        };

        self.observe(face.as_ref(), size, now);
        if self.session.state != LivenessState::LivenessDetected {
            return None;
        }

        let face = face?;
        let cropped = lease
            .to_upright_image()
            .ok_or(CropError::DegenerateRegion)
            .and_then(|image| crop(&face.bounding_box, &image));
        drop(lease);

        self.session.begin_verifying(now);
        self.publish(Some(face.bounding_box));
        match cropped {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!(error = %e, "face crop failed");
                self.session.complete(Err(FailureCause::Crop(e)), Instant::now());
                self.publish(None);
                None
            }
        }
    }

    fn spawn_embedding(
        &self,
        face: image::RgbImage,
    ) -> JoinHandle<Result<EmbeddingVector, EmbeddingError>> {
        let generator = self.generator.clone();
        tokio::spawn(async move {
            generator
                .generate_blocking(DynamicImage::ImageRgb8(face))
                .await
        })
    }

    fn finish_embedding(&mut self, joined: Result<Result<EmbeddingVector, EmbeddingError>, JoinError>) {
        let result = joined
            .map_err(|e| EmbeddingError::Inference(format!("embedding job failed: {e}")))
            .and_then(|r| r);
        let now = Instant::now();
        match result {
            Ok(embedding) => {
                if self.session.complete(Ok(()), now) {
                    self.embedding = Some(embedding);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding generation failed");
                self.session.complete(Err(FailureCause::Embedding(e)), now);
            }
        }
        self.publish(None);
    }

    fn observe(&mut self, face: Option<&DetectedFace>, size: FrameSize, now: Instant) {
        let previous = self.session.state;
        self.size = size;
        let state = self.session.tick(&self.machine, face, size, now);
        if state != previous || face.is_some() {
            self.publish(face.map(|f| f.bounding_box));
        }
    }

    /// Deadline checks while a detection is still running.
    fn expire(&mut self, now: Instant) {
        let previous = self.session.state;
        if self.session.expire(&self.machine, now) != previous {
            self.publish(None);
        }
    }

    fn publish(&self, face: Option<BoundingBox>) {
        self.updates.send_replace(SessionUpdate {
            state: self.session.state,
            face,
        });
    }

    /// Settle the outcome once the session is terminal, aborting any
    /// embedding job a terminal transition left behind.
    fn terminal_outcome(
        &mut self,
        job: &mut Option<JoinHandle<Result<EmbeddingVector, EmbeddingError>>>,
    ) -> Option<SessionOutcome> {
        let outcome = match self.session.state {
            LivenessState::Success => SessionOutcome::Success(self.embedding.take()?),
            LivenessState::Failure => SessionOutcome::Failure(
                self.session.failure.clone().unwrap_or(FailureCause::FaceLost),
            ),
            LivenessState::Timeout => SessionOutcome::Timeout,
            _ => return None,
        };
        if let Some(job) = job.take() {
            job.abort();
        }
        Some(outcome)
    }
}

/// Await the task in `slot`, or never resolve if it is empty.
async fn await_slot<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn outcome_label(outcome: &SessionOutcome) -> &'static str {
    match outcome {
        SessionOutcome::Success(_) => "success",
        SessionOutcome::Failure(cause) => cause.kind(),
        SessionOutcome::Timeout => "timeout",
        SessionOutcome::Cancelled => "cancelled",
    }
}
