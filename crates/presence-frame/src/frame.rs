//! Frame type and rotation handling.

use image::RgbImage;
use std::time::Instant;

/// Bytes per pixel of the packed RGB8 layout every frame uses.
pub const BYTES_PER_PIXEL: usize = 3;

/// Clockwise rotation needed to bring a sensor frame upright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Parse a rotation reported in degrees. Only right angles are valid.
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// True when width and height trade places after rotating upright.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// A captured RGB camera frame in sensor orientation.
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// True when the frame carries no usable pixel data.
    pub fn is_empty(&self) -> bool {
        self.width == 0
            || self.height == 0
            || self.data.len() < self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Dimensions after applying `rotation`; detector coordinates live in this space.
    pub fn upright_size(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }

    /// Copy the frame into an owned, upright RGB image.
    ///
    /// Returns `None` if the buffer is shorter than the declared dimensions.
    pub fn to_upright_image(&self) -> Option<RgbImage> {
        if self.is_empty() {
            return None;
        }
        let len = self.width as usize * self.height as usize * BYTES_PER_PIXEL;
        let sensor = RgbImage::from_raw(self.width, self.height, self.data[..len].to_vec())?;
        Some(match self.rotation {
            Rotation::Deg0 => sensor,
            Rotation::Deg90 => image::imageops::rotate90(&sensor),
            Rotation::Deg180 => image::imageops::rotate180(&sensor),
            Rotation::Deg270 => image::imageops::rotate270(&sensor),
        })
    }
}
