//! Bounded frame buffer pool with release-once leases.
//!
//! Camera buffers are a scarce resource: a `FrameLease` pins one buffer
//! until it is dropped, at which point the buffer goes back to the pool.
//! Dropping is the only way to release, so every exit path (success,
//! error, panic unwinding) releases exactly once.

use crate::frame::{Frame, Rotation, BYTES_PER_PIXEL};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame pool exhausted: all {0} buffers are leased")]
    PoolExhausted(usize),
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("frame source read failed: {0}")]
    Source(String),
}

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    outstanding: AtomicUsize,
    released: AtomicU64,
}

impl PoolInner {
    fn free_list(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        // Every critical section is a single push or pop.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fixed-capacity pool of RGB frame buffers. Cheap to clone.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
                outstanding: AtomicUsize::new(0),
                released: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a zeroed buffer sized for a `width`×`height` RGB frame.
    pub fn acquire(
        &self,
        width: u32,
        height: u32,
        rotation: Rotation,
        sequence: u32,
    ) -> Result<FrameLease, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::InvalidDimensions { width, height });
        }

        let reserved = self.inner.outstanding.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| (n < self.inner.capacity).then_some(n + 1),
        );
        if reserved.is_err() {
            return Err(FrameError::PoolExhausted(self.inner.capacity));
        }

        let mut data = self.inner.free_list().pop().unwrap_or_default();
        data.clear();
        data.resize(width as usize * height as usize * BYTES_PER_PIXEL, 0);

        Ok(FrameLease {
            frame: Frame {
                data,
                width,
                height,
                rotation,
                timestamp: Instant::now(),
                sequence,
            },
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of leases currently alive.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Total number of leases released since the pool was created.
    pub fn released(&self) -> u64 {
        self.inner.released.load(Ordering::Acquire)
    }
}

/// A frame pinned from a `FramePool`. The buffer returns to the pool on drop.
pub struct FrameLease {
    frame: Frame,
    pool: Arc<PoolInner>,
}

impl Deref for FrameLease {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl DerefMut for FrameLease {
    fn deref_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.frame.data);
        self.pool.free_list().push(data);
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.pool.released.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(sequence = self.frame.sequence, "frame released");
    }
}
