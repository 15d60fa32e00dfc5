//! Process-wide model handle.
//!
//! Both ONNX sessions are created once by [`load_models`] and released when the
//! returned pipeline is dropped. A missing or unreadable model is fatal: callers
//! should refuse to start rather than retry per request.

use crate::detector::{DetectorError, ScrfdLocalizer};
use crate::pipeline::FacePipeline;
use crate::recognizer::{FaceNetExtractor, InputLayout, RecognizerError};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const EXTRACTOR_MODEL_FILE: &str = "facenet.onnx";

/// Face pipeline backed by the SCRFD and FaceNet ONNX models.
pub type OnnxPipeline = FacePipeline<ScrfdLocalizer, FaceNetExtractor>;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding extractor: {0}")]
    Extractor(#[from] RecognizerError),
}

/// Where the model files live and how to run them.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub extractor: PathBuf,
    pub extractor_layout: InputLayout,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl ModelPaths {
    /// Standard file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL_FILE),
            extractor: dir.join(EXTRACTOR_MODEL_FILE),
            extractor_layout: InputLayout::default(),
            intra_threads: 2,
        }
    }
}

/// Per-user data directory: `$XDG_DATA_HOME/faceid`, else `~/.local/share/faceid`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceid")
}

pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

pub fn default_index_path() -> PathBuf {
    default_data_dir().join("index.json")
}

/// Load both models and assemble the face pipeline.
pub fn load_models(paths: &ModelPaths) -> Result<OnnxPipeline, ModelLoadError> {
    let localizer = ScrfdLocalizer::load(&paths.detector, paths.intra_threads)?;
    let extractor = FaceNetExtractor::load(&paths.extractor, paths.extractor_layout, paths.intra_threads)?;
    tracing::info!(
        detector = %paths.detector.display(),
        extractor = %paths.extractor.display(),
        "face models loaded"
    );
    Ok(FacePipeline::new(localizer, extractor))
}
