//! Face crop extraction and sample normalization.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;

/// Context margin added around a detected box, as a fraction of its shorter side.
const CROP_PADDING_RATIO: f32 = 0.1;

/// Crop `bbox` from `frame` with a small margin and resize to `size`×`size`.
///
/// The padded region is clamped to the frame. A box that lies entirely
/// outside the frame yields a black crop, which the quality gate rejects.
pub fn extract_face(frame: &RgbImage, bbox: &BoundingBox, size: u32) -> RgbImage {
    let pad = (bbox.width.min(bbox.height) as f32 * CROP_PADDING_RATIO).round() as i64;

    let left = (i64::from(bbox.x) - pad).clamp(0, i64::from(frame.width()));
    let top = (i64::from(bbox.y) - pad).clamp(0, i64::from(frame.height()));
    let right = (bbox.right() + pad).clamp(0, i64::from(frame.width()));
    let bottom = (bbox.bottom() + pad).clamp(0, i64::from(frame.height()));

    if right <= left || bottom <= top {
        return RgbImage::new(size, size);
    }

    let region = imageops::crop_imm(
        frame,
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    )
    .to_image();

    imageops::resize(&region, size, size, FilterType::Triangle)
}

/// Resize a whole image to the normalized crop size.
///
/// Used when an enrollment sample has no detectable face and is treated as
/// an already-cropped face.
pub fn normalize_sample(image: &RgbImage, size: u32) -> RgbImage {
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    if image.width() == 0 || image.height() == 0 {
        return RgbImage::new(size, size);
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}
