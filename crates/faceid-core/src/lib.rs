//! faceid-core: face localization, normalization, embedding and k-NN identity lookup.
//!
//! SCRFD finds faces and FaceNet embeds them, both through ONNX Runtime on the
//! CPU. Training turns a labeled image corpus into a persisted [`IdentityIndex`];
//! inference classifies single images against it.

pub mod detector;
pub mod index;
pub mod inference;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod recognizer;
pub mod training;
pub mod types;

#[cfg(test)]
mod testing;

pub use detector::{DetectorError, FaceLocalizer, ScrfdLocalizer};
pub use index::{IdentityIndex, IndexError, IndexHandle, IndexLoadError, LabelVocabulary, Prediction, DEFAULT_K};
pub use inference::{ClassificationResult, InferenceError, InferencePipeline};
pub use models::{default_data_dir, default_index_path, default_model_dir, load_models, ModelLoadError, ModelPaths, OnnxPipeline};
pub use normalizer::{FaceNormalizer, NormalizeError};
pub use pipeline::{FaceEmbedding, FacePipeline, StageError};
pub use recognizer::{EmbeddingExtractor, FaceNetExtractor, InputLayout, RecognizerError};
pub use training::{collect_samples, TrainError, TrainOptions, TrainingPipeline, TrainingReport};
pub use types::{select_face, BoundingBox, CropRegion, Embedding, NormalizedTensor, Sample};
