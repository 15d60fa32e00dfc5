//! FaceNet embedding extractor via ONNX Runtime.
//!
//! Maps 160×160 normalized face tensors to 512-dimensional embeddings using an
//! ONNX export of the FaceNet 20180402-114759 model.

use crate::types::{Embedding, NormalizedTensor};
use ndarray::{Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const FACENET_INPUT_SIZE: u32 = 160;
pub const FACENET_EMBEDDING_DIM: usize = 512;
pub const FACENET_MODEL_VERSION: &str = "facenet-20180402-114759";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("tensor is {actual}x{actual}, extractor expects {expected}x{expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a normalized face tensor into an embedding.
///
/// Implementations must be deterministic for fixed weights and safe to call
/// from several threads.
pub trait EmbeddingExtractor {
    /// Spatial size S the extractor expects; pipelines build their normalizer from it.
    fn input_size(&self) -> u32;

    /// Identifier of the weights, recorded in the identity index.
    fn model_version(&self) -> &str;

    fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError>;
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for &T {
    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError> {
        (**self).embed(tensor)
    }
}

impl<T: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Arc<T> {
    fn input_size(&self) -> u32 {
        (**self).input_size()
    }

    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError> {
        (**self).embed(tensor)
    }
}

/// Memory layout of the model's image input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputLayout {
    /// [batch, height, width, channel], as in TensorFlow exports of FaceNet.
    #[default]
    Nhwc,
    /// [batch, channel, height, width], as in PyTorch exports.
    Nchw,
}

/// FaceNet-based embedding extractor.
pub struct FaceNetExtractor {
    session: Mutex<Session>,
    layout: InputLayout,
}

impl FaceNetExtractor {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &Path, layout: InputLayout, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            ?layout,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self {
            session: Mutex::new(session),
            layout,
        })
    }

    /// Add the batch axis and arrange channels for the model.
    fn to_input(tensor: &NormalizedTensor, layout: InputLayout) -> Array4<f32> {
        let hwc = tensor.view();
        let arranged = match layout {
            InputLayout::Nhwc => hwc,
            InputLayout::Nchw => hwc.permuted_axes([2, 0, 1]),
        };
        arranged.insert_axis(Axis(0)).as_standard_layout().into_owned()
    }
}

impl EmbeddingExtractor for FaceNetExtractor {
    fn input_size(&self) -> u32 {
        FACENET_INPUT_SIZE
    }

    fn model_version(&self) -> &str {
        FACENET_MODEL_VERSION
    }

    fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError> {
        let expected = FACENET_INPUT_SIZE as usize;
        if tensor.size() != expected {
            return Err(RecognizerError::InputSize { expected, actual: tensor.size() });
        }

        let input = Self::to_input(tensor, self.layout);

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("FaceNet session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(raw.to_vec()).l2_normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::FaceNormalizer;
    use crate::types::BoundingBox;
    use image::{Rgb, RgbImage};

    fn tensor(size: u32) -> NormalizedTensor {
        let img = RgbImage::from_fn(size, size, |x, y| Rgb([x as u8, y as u8, 7]));
        FaceNormalizer::new(size)
            .normalize(&img, &BoundingBox::new(0, 0, size as i32, size as i32, 1.0))
            .unwrap()
    }

    #[test]
    fn test_to_input_nhwc() {
        let t = tensor(4);
        let input = FaceNetExtractor::to_input(&t, InputLayout::Nhwc);
        assert_eq!(input.shape(), &[1, 4, 4, 3]);
        assert_eq!(input[[0, 2, 1, 0]], t.view()[[2, 1, 0]]);
        assert_eq!(input[[0, 3, 0, 2]], t.view()[[3, 0, 2]]);
    }

    #[test]
    fn test_to_input_nchw() {
        let t = tensor(4);
        let input = FaceNetExtractor::to_input(&t, InputLayout::Nchw);
        assert_eq!(input.shape(), &[1, 3, 4, 4]);
        assert_eq!(input[[0, 0, 2, 1]], t.view()[[2, 1, 0]]);
        assert_eq!(input[[0, 2, 3, 0]], t.view()[[3, 0, 2]]);
        assert!(input.is_standard_layout());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceNetExtractor::load(Path::new("/nonexistent/facenet.onnx"), InputLayout::Nhwc, 1)
            .err()
            .unwrap();
        assert!(matches!(err, RecognizerError::ModelNotFound(_)));
    }
}
