//! Crop-and-resize normalization shared by enrollment, training and recognition.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::GrayImage;
use thiserror::Error;

/// Side length of every normalized face patch.
pub const FACE_SIZE: u32 = 100;

#[derive(Error, Debug, PartialEq)]
pub enum FaceError {
    #[error("face region {0:?} does not overlap the {1}x{2} image")]
    EmptyRegion(BoundingBox, u32, u32),
}

/// A square `FACE_SIZE`×`FACE_SIZE` grayscale face patch.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFace(GrayImage);

impl NormalizedFace {
    /// Wrap an already-normalized patch, resizing if the caller got it wrong.
    pub fn from_image(image: GrayImage) -> Self {
        if image.width() == FACE_SIZE && image.height() == FACE_SIZE {
            Self(image)
        } else {
            Self(imageops::resize(&image, FACE_SIZE, FACE_SIZE, FilterType::Triangle))
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.0
    }
}

/// Crop `bbox` out of `image` (clamped to the image bounds) and resize it to
/// the fixed square resolution.
pub fn normalize_face(image: &GrayImage, bbox: &BoundingBox) -> Result<NormalizedFace, FaceError> {
    let (w, h) = image.dimensions();
    let empty = || FaceError::EmptyRegion(*bbox, w, h);

    if !(bbox.x.is_finite() && bbox.y.is_finite() && bbox.width.is_finite() && bbox.height.is_finite()) {
        return Err(empty());
    }

    let x0 = bbox.x.max(0.0).floor() as u32;
    let y0 = bbox.y.max(0.0).floor() as u32;
    let x1 = ((bbox.x + bbox.width).ceil().max(0.0) as u32).min(w);
    let y1 = ((bbox.y + bbox.height).ceil().max(0.0) as u32).min(h);

    if x0 >= x1 || y0 >= y1 {
        return Err(empty());
    }

    let crop = imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image();
    Ok(NormalizedFace(imageops::resize(
        &crop,
        FACE_SIZE,
        FACE_SIZE,
        FilterType::Triangle,
    )))
}
