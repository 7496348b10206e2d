//! Frame sources.

use crate::frame::Rotation;
use crate::pool::{FrameError, FrameLease, FramePool};
use std::path::{Path, PathBuf};

/// Supplies successive frames, leased from the caller's pool.
///
/// Returns `None` once the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self, pool: &FramePool) -> Option<Result<FrameLease, FrameError>>;
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Replays image files from a directory in file-name order.
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    next: usize,
    rotation: Rotation,
}

impl DirectoryFrameSource {
    pub fn open(dir: &Path, rotation: Rotation) -> Result<Self, FrameError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| FrameError::Source(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        tracing::info!(dir = %dir.display(), frames = files.len(), "opened frame directory");

        Ok(Self {
            files,
            next: 0,
            rotation,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self, pool: &FramePool) -> Option<Result<FrameLease, FrameError>> {
        let path = self.files.get(self.next)?;
        let sequence = self.next as u32;
        self.next += 1;

        let decoded = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                return Some(Err(FrameError::Source(format!("{}: {e}", path.display()))));
            }
        };

        let (width, height) = decoded.dimensions();
        Some(pool.acquire(width, height, self.rotation, sequence).map(|mut lease| {
            lease.data.copy_from_slice(decoded.as_raw());
            lease
        }))
    }
}
