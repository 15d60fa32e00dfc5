use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest corner magnitude kept by [`BoundingBox::from_corners`].
pub const COORD_LIMIT: f32 = 1.0e9;

/// Bounding box for a detected face, in source image pixel space.
///
/// Coordinates are detector-native and may fall partly outside the image;
/// [`clamp_to`](Self::clamp_to) yields the region that is actually cropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) },
        }
    }

    /// Build a box from floating-point corner coordinates, rounding to the pixel grid.
    ///
    /// Returns `None` if any input is NaN or infinite. Corners saturate at
    /// ±[`COORD_LIMIT`] so that `x + width` always fits in an `i32`.
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Option<Self> {
        if ![x1, y1, x2, y2, confidence].iter().all(|v| v.is_finite()) {
            return None;
        }
        let px = |v: f32| v.round().clamp(-COORD_LIMIT, COORD_LIMIT) as i32;
        let (x, y) = (px(x1), px(y1));
        Some(Self::new(x, y, px(x2) - x, px(y2) - y, confidence))
    }

    /// Area of the box as reported by the detector (0 for inverted boxes).
    pub fn area(&self) -> i64 {
        self.width.max(0) as i64 * self.height.max(0) as i64
    }

    /// Clamp the box to an image of the given size.
    ///
    /// Negative `x`/`y` are clamped to 0 and the far edges to the image bounds.
    /// Returns `None` when nothing of the box remains inside the image.
    pub fn clamp_to(&self, image_width: u32, image_height: u32) -> Option<CropRegion> {
        let x0 = (self.x as i64).max(0);
        let y0 = (self.y as i64).max(0);
        let x1 = (self.x as i64 + self.width as i64).min(image_width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(image_height as i64);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(CropRegion {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// A box clamped to image bounds with non-zero area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One labeled training image. Lives only for the duration of a training run.
#[derive(Debug, Clone)]
pub struct Sample {
    pub path: PathBuf,
    pub label: String,
}

/// Face crop resized to the extractor's input size and rescaled, in HWC layout.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
    data: Array3<f32>,
}

impl NormalizedTensor {
    pub(crate) fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Spatial size S of the S×S tensor.
    pub fn size(&self) -> usize {
        self.data.shape()[0]
    }

    /// The tensor as [height, width, channel].
    pub fn view(&self) -> ndarray::ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Little-endian byte image of the tensor, for exact comparisons.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|v| v.to_le_bytes()).collect()
    }
}

/// Face embedding vector (512-dimensional for FaceNet 20180402).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit L2 norm. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

/// Pick the face to use when the localizer returns several.
///
/// Highest confidence wins; ties go to the larger box, then to the earlier
/// detection. Boxes with zero area or a non-finite confidence are never selected.
pub fn select_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    let mut best: Option<&BoundingBox> = None;
    for face in faces.iter().filter(|f| f.area() > 0 && f.confidence.is_finite()) {
        let replace = match best {
            None => true,
            Some(current) => {
                face.confidence > current.confidence
                    || (face.confidence == current.confidence && face.area() > current.area())
            }
        };
        if replace {
            best = Some(face);
        }
    }
    best
}
