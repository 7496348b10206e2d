//! Face region cropping with clamping to image bounds.

use crate::types::BoundingBox;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CropError {
    #[error("face region is empty after clamping to image bounds")]
    DegenerateRegion,
}

/// Pixel rectangle fully contained in an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamp a floating-point box to `[0, width] × [0, height]`.
///
/// Edges are rounded outward so partially covered pixels are kept.
/// Non-finite edges collapse to the nearest bound.
pub fn clamp_region(face: &BoundingBox, width: u32, height: u32) -> Result<CropRegion, CropError> {
    let clamp = |v: f32, max: u32| -> u32 {
        if v.is_nan() {
            0
        } else {
            v.clamp(0.0, max as f32) as u32
        }
    };

    let left = clamp(face.left.floor(), width);
    let top = clamp(face.top.floor(), height);
    let right = clamp(face.right.ceil(), width);
    let bottom = clamp(face.bottom.ceil(), height);

    if right <= left || bottom <= top {
        return Err(CropError::DegenerateRegion);
    }

    Ok(CropRegion {
        x: left,
        y: top,
        width: right - left,
        height: bottom - top,
    })
}

/// Clip the face region out of a full-resolution image.
pub fn crop(face: &BoundingBox, image: &RgbImage) -> Result<RgbImage, CropError> {
    let region = clamp_region(face, image.width(), image.height())?;
    tracing::debug!(?region, "cropping face");
    Ok(image::imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image())
}
