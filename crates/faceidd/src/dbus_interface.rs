use crate::engine::{EngineError, EngineHandle, ImageSource};
use faceid_core::IdentityIndex;
use std::path::{Path, PathBuf};
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.FaceId1";
pub const OBJECT_PATH: &str = "/org/freedesktop/FaceId1";

/// D-Bus interface for the face identification daemon.
///
/// Bus name: org.freedesktop.FaceId1
/// Object path: /org/freedesktop/FaceId1
pub struct FaceIdService {
    engine: EngineHandle,
    index_path: PathBuf,
}

impl FaceIdService {
    pub fn new(engine: EngineHandle, index_path: PathBuf) -> Self {
        Self { engine, index_path }
    }
}

#[interface(name = "org.freedesktop.FaceId1")]
impl FaceIdService {
    /// Classify the image at `path`. Returns a JSON classification result.
    async fn classify(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "classify requested");
        let result = self
            .engine
            .classify(ImageSource::Path(PathBuf::from(path)))
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Classify an encoded image sent over the bus.
    async fn classify_bytes(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "classify_bytes requested");
        let result = self.engine.classify(ImageSource::Bytes(image)).await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Re-read the index artifact. Returns the number of entries now served.
    async fn reload(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("reload requested");
        let entries = self.engine.reload().await.map_err(to_fdo)?;
        Ok(u32::try_from(entries).unwrap_or(u32::MAX))
    }

    /// Retrain from `corpus`, or from FACEID_CORPUS_DIR when empty. Returns the JSON report.
    async fn retrain(&self, corpus: &str) -> zbus::fdo::Result<String> {
        tracing::info!(corpus, "retrain requested");
        let corpus = (!corpus.is_empty()).then(|| PathBuf::from(corpus));
        let report = self.engine.retrain(corpus).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Identity labels known to the live index, sorted.
    async fn list_labels(&self) -> zbus::fdo::Result<Vec<String>> {
        Ok(self.engine.index().vocabulary().names().to_vec())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(status_json(&self.engine.index(), self.engine.workers(), &self.index_path).to_string())
    }
}

fn status_json(index: &IdentityIndex, workers: usize, index_path: &Path) -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workers": workers,
        "index_path": index_path.display().to_string(),
        "entries": index.len(),
        "labels": index.vocabulary().len(),
        "k": index.k(),
        "dim": index.dim(),
        "model_version": index.model_version(),
        "built_at": index.built_at().to_rfc3339(),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    match err {
        EngineError::NoCorpus => zbus::fdo::Error::InvalidArgs(err.to_string()),
        EngineError::ChannelClosed => zbus::fdo::Error::ServiceUnknown(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceid_core::Embedding;

    #[test]
    fn test_status_json_fields() {
        let index = IdentityIndex::build(
            vec![
                (Embedding::new(vec![1.0, 0.0]), "bob".into()),
                (Embedding::new(vec![0.0, 1.0]), "alice".into()),
                (Embedding::new(vec![0.1, 0.9]), "alice".into()),
            ],
            3,
            "facenet-20180402-114759",
        )
        .unwrap();
        let status = status_json(&index, 4, Path::new("/var/lib/faceid/index.json"));
        assert_eq!(status["workers"], 4);
        assert_eq!(status["entries"], 3);
        assert_eq!(status["labels"], 2);
        assert_eq!(status["k"], 3);
        assert_eq!(status["dim"], 2);
        assert_eq!(status["model_version"], "facenet-20180402-114759");
        assert_eq!(status["index_path"], "/var/lib/faceid/index.json");
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(to_fdo(EngineError::NoCorpus), zbus::fdo::Error::InvalidArgs(_)));
        assert!(matches!(to_fdo(EngineError::ChannelClosed), zbus::fdo::Error::ServiceUnknown(_)));
    }
}
