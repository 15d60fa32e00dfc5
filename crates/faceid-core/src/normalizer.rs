//! Face crop normalization shared by training and inference.
//!
//! Every embedding in an index and every probe queried against it must go
//! through [`FaceNormalizer::normalize`]. Changing the filter or the constants
//! below invalidates previously built indexes.

use crate::types::{BoundingBox, NormalizedTensor};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array3;
use thiserror::Error;

/// Resampling filter used for every face crop.
pub const RESIZE_FILTER: FilterType = FilterType::Lanczos3;
/// Pixel offset subtracted before scaling (FaceNet prewhitening).
pub const NORM_OFFSET: f32 = 127.5;
/// Divisor applied after the offset.
pub const NORM_SCALE: f32 = 128.0;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error(
        "face box ({}, {}, {}x{}) has no area inside the {image_width}x{image_height} image",
        .face.x, .face.y, .face.width, .face.height
    )]
    DegenerateRegion {
        face: BoundingBox,
        image_width: u32,
        image_height: u32,
    },
}

/// Crops, resizes and rescales a face to a fixed S×S×3 tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceNormalizer {
    size: u32,
}

impl FaceNormalizer {
    /// Create a normalizer producing `size`×`size` tensors.
    pub fn new(size: u32) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Crop the clamped face region and resize it to S×S with [`RESIZE_FILTER`].
    pub fn crop(&self, image: &RgbImage, face: &BoundingBox) -> Result<RgbImage, NormalizeError> {
        let region = face
            .clamp_to(image.width(), image.height())
            .ok_or(NormalizeError::DegenerateRegion {
                face: *face,
                image_width: image.width(),
                image_height: image.height(),
            })?;

        let cropped = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
        Ok(imageops::resize(&cropped, self.size, self.size, RESIZE_FILTER))
    }

    /// Produce the embedding-ready tensor for one face.
    pub fn normalize(
        &self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<NormalizedTensor, NormalizeError> {
        let crop = self.crop(image, face)?;
        Ok(Self::rescale(&crop))
    }

    /// Map an already-resized crop to `(pixel - NORM_OFFSET) / NORM_SCALE`, HWC.
    fn rescale(crop: &RgbImage) -> NormalizedTensor {
        let (w, h) = crop.dimensions();
        let data = Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
            let pixel = crop.get_pixel(x as u32, y as u32)[c] as f32;
            (pixel - NORM_OFFSET) / NORM_SCALE
        });
        NormalizedTensor::from_array(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient_image(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8]))
    }

    #[test]
    fn test_output_shape() {
        let img = gradient_image(64, 48);
        let n = FaceNormalizer::new(160);
        let t = n.normalize(&img, &BoundingBox::new(10, 10, 30, 20, 0.9)).unwrap();
        assert_eq!(t.view().shape(), &[160, 160, 3]);
        assert_eq!(t.size(), 160);
    }

    #[test]
    fn test_rescale_constants() {
        let img = RgbImage::from_pixel(32, 32, Rgb([255, 0, 128]));
        let n = FaceNormalizer::new(8);
        let t = n.normalize(&img, &BoundingBox::new(0, 0, 32, 32, 1.0)).unwrap();
        let v = t.view();
        assert!((v[[0, 0, 0]] - (255.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((v[[0, 0, 1]] - (0.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((v[[3, 5, 2]] - (128.0 - 127.5) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let img = gradient_image(120, 90);
        let face = BoundingBox::new(17, 11, 53, 61, 0.9);
        let n = FaceNormalizer::new(160);
        let a = n.normalize(&img, &face).unwrap();
        let b = n.normalize(&img, &face).unwrap();
        assert_eq!(a.to_le_bytes(), b.to_le_bytes());
    }

    #[test]
    fn test_negative_origin_is_clamped() {
        let img = gradient_image(80, 80);
        let n = FaceNormalizer::new(16);
        let shifted = n.normalize(&img, &BoundingBox::new(-10, -20, 50, 60, 0.9)).unwrap();
        let clamped = n.normalize(&img, &BoundingBox::new(0, 0, 40, 40, 0.9)).unwrap();
        assert_eq!(shifted, clamped);
    }

    #[test]
    fn test_box_outside_image_is_degenerate() {
        let img = gradient_image(50, 50);
        let n = FaceNormalizer::new(16);
        let err = n.normalize(&img, &BoundingBox::new(60, 60, 10, 10, 0.9)).unwrap_err();
        assert!(matches!(err, NormalizeError::DegenerateRegion { image_width: 50, image_height: 50, .. }));
    }

    #[test]
    fn test_crop_matches_normalize() {
        let img = gradient_image(64, 64);
        let face = BoundingBox::new(4, 8, 40, 36, 0.9);
        let n = FaceNormalizer::new(24);
        let crop = n.crop(&img, &face).unwrap();
        assert_eq!(crop.dimensions(), (24, 24));
        assert_eq!(FaceNormalizer::rescale(&crop), n.normalize(&img, &face).unwrap());
    }
}
