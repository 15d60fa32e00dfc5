//! Deterministic stand-ins for the ONNX models, used by unit tests.

use crate::detector::{DetectorError, FaceLocalizer};
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::types::{BoundingBox, Embedding, NormalizedTensor};
use image::{Rgb, RgbImage};
use ndarray::Axis;

/// Reports the bounding box of all non-black pixels as a single face.
pub struct BlobLocalizer;

impl FaceLocalizer for BlobLocalizer {
    fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in image.enumerate_pixels() {
            if p.0.iter().any(|&c| c > 16) {
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
        }
        Ok(bounds
            .map(|(x0, y0, x1, y1)| {
                vec![BoundingBox::new(x0 as i32, y0 as i32, (x1 - x0 + 1) as i32, (y1 - y0 + 1) as i32, 0.9)]
            })
            .unwrap_or_default())
    }
}

/// Always returns the same boxes.
pub struct FixedLocalizer(pub Vec<BoundingBox>);

impl FaceLocalizer for FixedLocalizer {
    fn detect(&self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self.0.clone())
    }
}

/// Embeds a face as the per-channel mean of its normalized tensor.
pub struct MeanColorExtractor {
    size: u32,
}

impl MeanColorExtractor {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl EmbeddingExtractor for MeanColorExtractor {
    fn input_size(&self) -> u32 {
        self.size
    }

    fn model_version(&self) -> &str {
        "mean-color"
    }

    fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError> {
        let means = tensor
            .view()
            .mean_axis(Axis(0))
            .and_then(|rows| rows.mean_axis(Axis(0)))
            .ok_or_else(|| RecognizerError::InferenceFailed("empty tensor".into()))?;
        Ok(Embedding::new(means.to_vec()))
    }
}

/// Black image with one solid rectangle (x, y, w, h) of `color`.
pub fn blob_image(width: u32, height: u32, color: [u8; 3], rect: (u32, u32, u32, u32)) -> RgbImage {
    let (rx, ry, rw, rh) = rect;
    RgbImage::from_fn(width, height, |x, y| {
        if x >= rx && x < rx + rw && y >= ry && y < ry + rh {
            Rgb(color)
        } else {
            Rgb([0, 0, 0])
        }
    })
}
