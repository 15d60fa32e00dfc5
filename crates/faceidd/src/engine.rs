use faceid_core::{
    ClassificationResult, EmbeddingExtractor, FaceLocalizer, FacePipeline, IdentityIndex, IndexError,
    IndexHandle, IndexLoadError, InferenceError, InferencePipeline, TrainError, TrainOptions, TrainingPipeline,
    TrainingReport,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("training failed: {0}")]
    Train(#[from] TrainError),
    #[error("index reload failed: {0}")]
    Reload(#[from] IndexLoadError),
    #[error("index swap rejected: {0}")]
    Index(#[from] IndexError),
    #[error("no corpus directory given and FACEID_CORPUS_DIR is unset")]
    NoCorpus,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine workers exited")]
    ChannelClosed,
}

/// What a classify request carries.
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// Messages sent from D-Bus handlers to the worker pool.
enum EngineRequest {
    Classify {
        source: ImageSource,
        reply: oneshot::Sender<Result<ClassificationResult, EngineError>>,
    },
    Retrain {
        corpus: PathBuf,
        reply: oneshot::Sender<Result<TrainingReport, EngineError>>,
    },
    Reload {
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// Settings shared by all workers.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub index_path: PathBuf,
    pub corpus_dir: Option<PathBuf>,
    pub k: usize,
}

/// Clone-safe handle to the worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    index: Arc<IndexHandle>,
    default_corpus: Option<PathBuf>,
    workers: usize,
}

impl EngineHandle {
    pub async fn classify(&self, source: ImageSource) -> Result<ClassificationResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Classify { source, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Train from `corpus` (or the configured corpus), persist, reload and swap.
    pub async fn retrain(&self, corpus: Option<PathBuf>) -> Result<TrainingReport, EngineError> {
        let corpus = corpus
            .or_else(|| self.default_corpus.clone())
            .ok_or(EngineError::NoCorpus)?;
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Retrain { corpus, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Re-read the index artifact from disk. Returns the new entry count.
    pub async fn reload(&self) -> Result<usize, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::Reload { reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// The index snapshot queries are currently answered from.
    pub fn index(&self) -> Arc<IdentityIndex> {
        self.index.current()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn one OS thread per pipeline.
///
/// Pipelines are loaded by the caller so model failures abort startup before
/// any thread exists. Workers share one request queue and one index handle.
pub fn spawn_engine<L, E>(
    pipelines: Vec<FacePipeline<L, E>>,
    index: Arc<IndexHandle>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    L: FaceLocalizer + Send + 'static,
    E: EmbeddingExtractor + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));
    // Retrain and reload both rewrite the live index; one at a time.
    let swap_lock = Arc::new(Mutex::new(()));
    let default_corpus = settings.corpus_dir.clone();
    let settings = Arc::new(settings);
    let workers = pipelines.len();

    for (id, stages) in pipelines.into_iter().enumerate() {
        let worker = Worker {
            id,
            pipeline: InferencePipeline::new(stages, Arc::clone(&index)),
            settings: Arc::clone(&settings),
            swap_lock: Arc::clone(&swap_lock),
        };
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("faceid-worker-{id}"))
            .spawn(move || worker.run(&rx))
            .map_err(EngineError::Spawn)?;
    }

    tracing::info!(workers, "engine started");
    Ok(EngineHandle {
        tx,
        index,
        default_corpus,
        workers,
    })
}

struct Worker<L, E> {
    id: usize,
    pipeline: InferencePipeline<L, E>,
    settings: Arc<EngineSettings>,
    swap_lock: Arc<Mutex<()>>,
}

impl<L: FaceLocalizer, E: EmbeddingExtractor> Worker<L, E> {
    fn run(self, rx: &Mutex<mpsc::Receiver<EngineRequest>>) {
        tracing::debug!(worker = self.id, "worker started");
        loop {
            // Only the receive is under the lock; requests run in parallel.
            let request = rx.lock().unwrap_or_else(PoisonError::into_inner).blocking_recv();
            let Some(request) = request else { break };
            match request {
                EngineRequest::Classify { source, reply } => {
                    let _ = reply.send(self.classify(source));
                }
                EngineRequest::Retrain { corpus, reply } => {
                    let _ = reply.send(self.retrain(corpus));
                }
                EngineRequest::Reload { reply } => {
                    let _ = reply.send(self.reload());
                }
            }
        }
        tracing::debug!(worker = self.id, "worker exiting");
    }

    fn classify(&self, source: ImageSource) -> Result<ClassificationResult, EngineError> {
        let result = match source {
            ImageSource::Path(path) => self.pipeline.classify_path(&path),
            ImageSource::Bytes(bytes) => self.pipeline.classify_bytes(&bytes),
        };
        if let Err(e) = &result {
            tracing::warn!(worker = self.id, error = %e, "classification failed");
        }
        Ok(result?)
    }

    fn retrain(&self, corpus: PathBuf) -> Result<TrainingReport, EngineError> {
        let _guard = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(worker = self.id, corpus = %corpus.display(), "retraining");

        let options = TrainOptions {
            k: self.settings.k,
            crops_dir: None,
        };
        let (_, report) =
            TrainingPipeline::new(self.pipeline.stages(), options).train(&corpus, &self.settings.index_path)?;
        // Serve exactly what was written, so a restart sees the same index.
        let index = IdentityIndex::load(&self.settings.index_path)?;
        let entries = index.len();
        self.pipeline.index().replace(index)?;

        tracing::info!(
            worker = self.id,
            entries,
            labels = report.labels,
            skipped = report.skipped(),
            "index retrained and swapped"
        );
        Ok(report)
    }

    fn reload(&self) -> Result<usize, EngineError> {
        let _guard = self.swap_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let index = IdentityIndex::load(&self.settings.index_path)?;
        let entries = index.len();
        self.pipeline.index().replace(index)?;
        tracing::info!(entries, path = %self.settings.index_path.display(), "index reloaded");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::{BoundingBox, DetectorError, Embedding, NormalizedTensor, RecognizerError};
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    /// Whole image is the face unless it is entirely black.
    struct FullFrame;

    impl FaceLocalizer for FullFrame {
        fn detect(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            if image.pixels().all(|p| p.0 == [0, 0, 0]) {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox::new(0, 0, image.width() as i32, image.height() as i32, 0.99)])
        }
    }

    /// Embeds the top-left pixel of the normalized face.
    struct CornerPixel;

    impl EmbeddingExtractor for CornerPixel {
        fn input_size(&self) -> u32 {
            8
        }

        fn model_version(&self) -> &str {
            "corner-pixel"
        }

        fn embed(&self, tensor: &NormalizedTensor) -> Result<Embedding, RecognizerError> {
            let view = tensor.view();
            Ok(Embedding::new((0..3).map(|c| view[[0, 0, c]]).collect()))
        }
    }

    fn solid(color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(12, 12, Rgb(color))
    }

    fn write_corpus(root: &std::path::Path, entries: &[(&str, [u8; 3])]) {
        for (i, (label, color)) in entries.iter().enumerate() {
            let dir = root.join(label);
            std::fs::create_dir_all(&dir).unwrap();
            solid(*color).save(dir.join(format!("{i}.png"))).unwrap();
        }
    }

    fn start(dir: &TempDir, workers: usize, corpus: &[(&str, [u8; 3])]) -> EngineHandle {
        let corpus_dir = dir.path().join("corpus");
        write_corpus(&corpus_dir, corpus);
        let index_path = dir.path().join("index.json");
        let stages = FacePipeline::new(FullFrame, CornerPixel);
        let options = TrainOptions { k: 1, crops_dir: None };
        let (index, _) = TrainingPipeline::new(&stages, options).train(&corpus_dir, &index_path).unwrap();

        let pipelines = (0..workers).map(|_| FacePipeline::new(FullFrame, CornerPixel)).collect();
        let settings = EngineSettings {
            index_path,
            corpus_dir: Some(corpus_dir),
            k: 1,
        };
        spawn_engine(pipelines, Arc::new(IndexHandle::new(index).unwrap()), settings).unwrap()
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        solid(color).write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_classify_across_workers() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 3, &[("red", [200, 0, 0]), ("blue", [0, 0, 200])]);
        assert_eq!(engine.workers(), 3);

        let mut pending = Vec::new();
        for i in 0..12 {
            let engine = engine.clone();
            let color = if i % 2 == 0 { [200, 0, 0] } else { [0, 0, 200] };
            pending.push(tokio::spawn(async move { (color, engine.classify(ImageSource::Bytes(png(color))).await) }));
        }
        for task in pending {
            let (color, result) = task.await.unwrap();
            let expected = if color[0] == 200 { "red" } else { "blue" };
            assert_eq!(result.unwrap().label(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_classify_outcomes() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 1, &[("red", [200, 0, 0])]);

        let missing = engine.classify(ImageSource::Path(dir.path().join("nope.png"))).await.unwrap();
        assert!(matches!(missing, ClassificationResult::DecodeError { .. }));

        let black = engine.classify(ImageSource::Bytes(png([0, 0, 0]))).await.unwrap();
        assert_eq!(black, ClassificationResult::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_retrain_swaps_index() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 2, &[("red", [200, 0, 0])]);
        let green = png([0, 200, 0]);
        assert_eq!(engine.classify(ImageSource::Bytes(green.clone())).await.unwrap().label(), Some("red"));

        let updated = dir.path().join("updated");
        write_corpus(&updated, &[("red", [200, 0, 0]), ("green", [0, 200, 0])]);
        let report = engine.retrain(Some(updated)).await.unwrap();
        assert_eq!(report.labels, 2);
        assert_eq!(report.embedded, 2);

        assert_eq!(engine.index().len(), 2);
        assert_eq!(engine.classify(ImageSource::Bytes(green)).await.unwrap().label(), Some("green"));

        // The artifact on disk matches what is served.
        let on_disk = IdentityIndex::load(&dir.path().join("index.json")).unwrap();
        assert_eq!(on_disk.vocabulary().names(), engine.index().vocabulary().names());
    }

    #[tokio::test]
    async fn test_failed_retrain_keeps_live_index() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 1, &[("red", [200, 0, 0])]);

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(empty.join("nobody")).unwrap();
        let err = engine.retrain(Some(empty)).await.unwrap_err();
        assert!(matches!(err, EngineError::Train(TrainError::NoUsableSamples(_))));
        assert_eq!(engine.index().vocabulary().names(), ["red"]);

        // No path falls back to the configured corpus.
        let report = engine.retrain(None).await.unwrap();
        assert_eq!(report.labels, 1);
    }

    #[tokio::test]
    async fn test_reload_reads_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 1, &[("red", [200, 0, 0])]);

        let other = IdentityIndex::build(
            vec![
                (Embedding::new(vec![0.1, 0.2, 0.3]), "x".into()),
                (Embedding::new(vec![0.3, 0.2, 0.1]), "y".into()),
            ],
            1,
            "corner-pixel",
        )
        .unwrap();
        other.persist(&dir.path().join("index.json")).unwrap();

        assert_eq!(engine.reload().await.unwrap(), 2);
        assert_eq!(engine.index().vocabulary().names(), ["x", "y"]);
    }

    #[tokio::test]
    async fn test_reload_rejects_corrupt_artifact() {
        let dir = TempDir::new().unwrap();
        let engine = start(&dir, 1, &[("red", [200, 0, 0])]);
        std::fs::write(dir.path().join("index.json"), b"{ not json").unwrap();

        assert!(matches!(engine.reload().await, Err(EngineError::Reload(_))));
        assert_eq!(engine.index().len(), 1);
    }
}
