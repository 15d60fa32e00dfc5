use faceid_core::{InputLayout, ModelPaths, DEFAULT_K};
use std::path::PathBuf;

/// Which message bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing `det_10g.onnx` and `facenet.onnx`.
    pub model_dir: PathBuf,
    /// Identity index artifact loaded at startup and rewritten by retraining.
    pub index_path: PathBuf,
    /// Corpus used by `Retrain` when the caller passes an empty path.
    pub corpus_dir: Option<PathBuf>,
    /// Number of inference workers, each with its own model sessions.
    pub workers: usize,
    /// Neighbors consulted per query for indexes built by `Retrain`.
    pub k: usize,
    pub bus: BusKind,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Whether the FaceNet graph takes NCHW input instead of NHWC.
    pub nchw_input: bool,
}

impl Config {
    /// Load configuration from `FACEID_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let model_dir = var("FACEID_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(faceid_core::default_model_dir);

        let index_path = var("FACEID_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(faceid_core::default_index_path);

        let bus = match var("FACEID_BUS").as_deref() {
            Some("system") => BusKind::System,
            _ => BusKind::Session,
        };

        Self {
            model_dir,
            index_path,
            corpus_dir: var("FACEID_CORPUS_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            workers: parse_or(var("FACEID_WORKERS"), 2).max(1),
            k: parse_or(var("FACEID_K"), DEFAULT_K).max(1),
            bus,
            intra_threads: parse_or(var("FACEID_INTRA_THREADS"), 2).max(1),
            nchw_input: var("FACEID_NCHW_INPUT").map(|v| v != "0").unwrap_or(false),
        }
    }

    /// Model files and session options for one worker.
    pub fn model_paths(&self) -> ModelPaths {
        let mut paths = ModelPaths::in_dir(&self.model_dir);
        paths.intra_threads = self.intra_threads;
        if self.nchw_input {
            paths.extractor_layout = InputLayout::Nchw;
        }
        paths
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}
