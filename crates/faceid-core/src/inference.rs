//! Classifies the face in a single image against the live identity index.

use crate::detector::FaceLocalizer;
use crate::index::{IndexError, IndexHandle};
use crate::normalizer::NormalizeError;
use crate::pipeline::{FacePipeline, StageError};
use crate::recognizer::EmbeddingExtractor;
use image::{DynamicImage, RgbImage};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// What happened to one image. "No face" and "unreadable" are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClassificationResult {
    Identified {
        label: String,
        /// Neighbors that voted for `label`, out of `k`.
        votes: usize,
        k: usize,
        /// Mean Euclidean distance to the voting neighbors.
        distance: f32,
    },
    NoFaceDetected,
    DecodeError {
        message: String,
    },
}

impl ClassificationResult {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Identified { label, .. } => Some(label),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("index query failed: {0}")]
    Index(#[from] IndexError),
}

impl InferenceError {
    /// The selected detector box had no area inside the image.
    pub fn is_degenerate_region(&self) -> bool {
        matches!(self, Self::Stage(StageError::Normalize(NormalizeError::DegenerateRegion { .. })))
    }
}

/// Face stages plus a handle to the index they query.
pub struct InferencePipeline<L, E> {
    stages: FacePipeline<L, E>,
    index: Arc<IndexHandle>,
}

impl<L: FaceLocalizer, E: EmbeddingExtractor> InferencePipeline<L, E> {
    pub fn new(stages: FacePipeline<L, E>, index: Arc<IndexHandle>) -> Self {
        let current = index.current();
        if current.model_version() != stages.extractor().model_version() {
            tracing::warn!(
                index_model = current.model_version(),
                extractor_model = stages.extractor().model_version(),
                "identity index was built with a different embedding model"
            );
        }
        Self { stages, index }
    }

    pub fn stages(&self) -> &FacePipeline<L, E> {
        &self.stages
    }

    pub fn index(&self) -> &Arc<IndexHandle> {
        &self.index
    }

    /// Classify an encoded image (PNG, JPEG, ...).
    pub fn classify_bytes(&self, bytes: &[u8]) -> Result<ClassificationResult, InferenceError> {
        match image::load_from_memory(bytes) {
            Ok(image) => self.classify_image(&image),
            Err(e) => Ok(decode_error(e)),
        }
    }

    /// Classify an image file. Missing or undecodable files yield `DecodeError`.
    pub fn classify_path(&self, path: &Path) -> Result<ClassificationResult, InferenceError> {
        match image::open(path) {
            Ok(image) => self.classify_image(&image),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "image decode failed");
                Ok(decode_error(e))
            }
        }
    }

    pub fn classify_image(&self, image: &DynamicImage) -> Result<ClassificationResult, InferenceError> {
        self.classify_rgb(&image.to_rgb8())
    }

    pub fn classify_rgb(&self, image: &RgbImage) -> Result<ClassificationResult, InferenceError> {
        let Some(found) = self.stages.embed_image(image)? else {
            tracing::debug!(width = image.width(), height = image.height(), "no face detected");
            return Ok(ClassificationResult::NoFaceDetected);
        };

        // One snapshot per call: a concurrent swap cannot change this answer.
        let index = self.index.current();
        let prediction = index.predict(&found.embedding)?;

        tracing::info!(
            label = %prediction.label,
            votes = prediction.votes,
            k = prediction.k,
            distance = prediction.distance,
            confidence = found.face.confidence,
            "face identified"
        );

        Ok(ClassificationResult::Identified {
            label: prediction.label,
            votes: prediction.votes,
            k: prediction.k,
            distance: prediction.distance,
        })
    }
}

fn decode_error(e: image::ImageError) -> ClassificationResult {
    ClassificationResult::DecodeError { message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IdentityIndex;
    use crate::testing::{blob_image, BlobLocalizer, FixedLocalizer, MeanColorExtractor};
    use crate::training::{TrainOptions, TrainingPipeline};
    use crate::types::{BoundingBox, Embedding};
    use std::io::Cursor;
    use tempfile::TempDir;

    const RED: [u8; 3] = [220, 30, 30];
    const GREEN: [u8; 3] = [30, 220, 30];
    const BLUE: [u8; 3] = [30, 30, 220];

    fn color_embedding(color: [u8; 3]) -> Embedding {
        Embedding::new(color.iter().map(|&c| (c as f32 - 127.5) / 128.0).collect())
    }

    fn color_index(entries: &[([u8; 3], &str)], k: usize) -> IdentityIndex {
        let pairs = entries
            .iter()
            .map(|(c, l)| (color_embedding(*c), l.to_string()))
            .collect();
        IdentityIndex::build(pairs, k, "mean-color").unwrap()
    }

    fn pipeline(index: IdentityIndex) -> InferencePipeline<BlobLocalizer, MeanColorExtractor> {
        let handle = Arc::new(IndexHandle::new(index).unwrap());
        InferencePipeline::new(FacePipeline::new(BlobLocalizer, MeanColorExtractor::new(16)), handle)
    }

    fn png_bytes(image: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_identifies_single_face() {
        let p = pipeline(color_index(&[(RED, "alice"), (RED, "alice"), (BLUE, "bob"), (BLUE, "bob")], 3));
        let result = p.classify_rgb(&blob_image(60, 60, BLUE, (10, 20, 30, 25))).unwrap();
        assert_eq!(result.label(), Some("bob"));
        let ClassificationResult::Identified { votes, k, .. } = result else {
            panic!("expected Identified");
        };
        assert_eq!((votes, k), (2, 3));
    }

    #[test]
    fn test_black_image_has_no_face() {
        let p = pipeline(color_index(&[(RED, "alice")], 1));
        let result = p.classify_rgb(&RgbImage::new(48, 48)).unwrap();
        assert_eq!(result, ClassificationResult::NoFaceDetected);
    }

    #[test]
    fn test_decode_errors_are_outcomes() {
        let p = pipeline(color_index(&[(RED, "alice")], 1));
        assert!(matches!(
            p.classify_bytes(b"definitely not a png").unwrap(),
            ClassificationResult::DecodeError { .. }
        ));
        assert!(matches!(
            p.classify_path(Path::new("/nonexistent/face.jpg")).unwrap(),
            ClassificationResult::DecodeError { .. }
        ));
    }

    #[test]
    fn test_classify_encoded_bytes() {
        let p = pipeline(color_index(&[(RED, "alice"), (GREEN, "gina")], 1));
        let bytes = png_bytes(&blob_image(40, 40, GREEN, (5, 5, 20, 20)));
        assert_eq!(p.classify_bytes(&bytes).unwrap().label(), Some("gina"));
    }

    #[test]
    fn test_degenerate_region_surfaces_as_error() {
        let handle = Arc::new(IndexHandle::new(color_index(&[(RED, "alice")], 1)).unwrap());
        let p = InferencePipeline::new(
            FacePipeline::new(
                FixedLocalizer(vec![BoundingBox::new(-40, -40, 10, 10, 0.9)]),
                MeanColorExtractor::new(16),
            ),
            handle,
        );
        let err = p.classify_rgb(&blob_image(32, 32, RED, (0, 0, 32, 32))).unwrap_err();
        assert!(err.is_degenerate_region());
    }

    #[test]
    fn test_swapped_index_used_by_next_call() {
        let p = pipeline(color_index(&[(RED, "alice")], 1));
        let img = blob_image(32, 32, RED, (4, 4, 16, 16));
        assert_eq!(p.classify_rgb(&img).unwrap().label(), Some("alice"));

        p.index().replace(color_index(&[(RED, "ruby"), (BLUE, "bob")], 1)).unwrap();
        assert_eq!(p.classify_rgb(&img).unwrap().label(), Some("ruby"));
    }

    #[test]
    fn test_training_and_inference_share_preprocessing() {
        let corpus = TempDir::new().unwrap();
        let label_dir = corpus.path().join("alice");
        std::fs::create_dir_all(&label_dir).unwrap();
        // A gradient face so the resize filter actually matters.
        let face = RgbImage::from_fn(64, 64, |x, y| {
            if (8..56).contains(&x) && (8..56).contains(&y) {
                image::Rgb([(x * 4) as u8, (y * 4) as u8, 128])
            } else {
                image::Rgb([0, 0, 0])
            }
        });
        face.save(label_dir.join("face.png")).unwrap();

        let stages = FacePipeline::new(BlobLocalizer, MeanColorExtractor::new(20));
        let (index, _) = TrainingPipeline::new(&stages, TrainOptions { k: 1, crops_dir: None })
            .run(corpus.path())
            .unwrap();

        let p = InferencePipeline::new(stages, Arc::new(IndexHandle::new(index).unwrap()));
        let result = p.classify_path(&label_dir.join("face.png")).unwrap();
        assert_eq!(
            result,
            ClassificationResult::Identified {
                label: "alice".into(),
                votes: 1,
                k: 1,
                distance: 0.0,
            }
        );
    }

    #[test]
    fn test_result_json_shape() {
        let identified = ClassificationResult::Identified {
            label: "alice".into(),
            votes: 2,
            k: 3,
            distance: 0.5,
        };
        let json = serde_json::to_value(&identified).unwrap();
        assert_eq!(json["outcome"], "identified");
        assert_eq!(json["label"], "alice");
        assert_eq!(
            serde_json::to_value(ClassificationResult::NoFaceDetected).unwrap(),
            serde_json::json!({ "outcome": "no_face_detected" })
        );
    }
}
