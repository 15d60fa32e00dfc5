//! Localize → select → normalize → embed, shared by training and inference.

use crate::detector::{DetectorError, FaceLocalizer};
use crate::normalizer::{FaceNormalizer, NormalizeError};
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::types::{select_face, BoundingBox, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// The face chosen in an image and its embedding.
#[derive(Debug, Clone)]
pub struct FaceEmbedding {
    pub face: BoundingBox,
    /// How many boxes the localizer returned.
    pub candidates: usize,
    pub embedding: Embedding,
}

/// One localizer, one extractor, and the normalizer sized for that extractor.
pub struct FacePipeline<L, E> {
    localizer: L,
    extractor: E,
    normalizer: FaceNormalizer,
}

impl<L: FaceLocalizer, E: EmbeddingExtractor> FacePipeline<L, E> {
    pub fn new(localizer: L, extractor: E) -> Self {
        let normalizer = FaceNormalizer::new(extractor.input_size());
        Self {
            localizer,
            extractor,
            normalizer,
        }
    }

    pub fn normalizer(&self) -> &FaceNormalizer {
        &self.normalizer
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Detect faces and apply the selection policy. `None` means no face.
    pub fn locate(&self, image: &RgbImage) -> Result<Option<(BoundingBox, usize)>, StageError> {
        let faces = self.localizer.detect(image)?;
        let selected = select_face(&faces).copied();
        if let Some(face) = &selected {
            tracing::debug!(
                candidates = faces.len(),
                x = face.x,
                y = face.y,
                width = face.width,
                height = face.height,
                confidence = face.confidence,
                "face selected"
            );
        }
        Ok(selected.map(|face| (face, faces.len())))
    }

    /// Normalize one face and run the extractor on it.
    pub fn embed_face(&self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, StageError> {
        let tensor = self.normalizer.normalize(image, face)?;
        Ok(self.extractor.embed(&tensor)?)
    }

    /// Full stage chain for one image.
    pub fn embed_image(&self, image: &RgbImage) -> Result<Option<FaceEmbedding>, StageError> {
        let Some((face, candidates)) = self.locate(image)? else {
            return Ok(None);
        };
        let embedding = self.embed_face(image, &face)?;
        Ok(Some(FaceEmbedding {
            face,
            candidates,
            embedding,
        }))
    }
}
