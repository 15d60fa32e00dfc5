//! Identity index: labeled embeddings with a k-nearest-neighbor decision rule.
//!
//! The index is built once per training run and persisted as a versioned,
//! checksummed JSON artifact. Serving code holds it behind an [`IndexHandle`]
//! and swaps whole indexes, never mutating one in place.

use crate::types::Embedding;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Number of neighbors consulted per query unless configured otherwise.
pub const DEFAULT_K: usize = 3;

const INDEX_MAGIC: &str = "faceid-index";
const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("identity index holds no embeddings")]
    EmptyIndex,
    #[error("k must be at least 1")]
    InvalidK,
    #[error("embedding has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding for label {label:?} contains non-finite values")]
    NonFiniteEmbedding { label: String },
    #[error("failed to write index artifact {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize index: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum IndexLoadError {
    #[error("failed to read index artifact {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("index artifact is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("not a faceid index artifact (magic {0:?})")]
    BadMagic(String),
    #[error("unsupported index format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("index checksum mismatch: stored {stored}, computed {computed}")]
    ChecksumMismatch { stored: String, computed: String },
    #[error("inconsistent index artifact: {0}")]
    Inconsistent(String),
}

/// Bidirectional mapping between identity names and dense ids.
///
/// Ids follow sorted name order, so the same label set always yields the same ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelVocabulary {
    names: Vec<String>,
    ids: HashMap<String, u32>,
}

impl LabelVocabulary {
    /// Build a vocabulary from every distinct label in `labels`.
    pub fn fit<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let names: BTreeSet<&str> = labels.into_iter().collect();
        Self::from_sorted(names.into_iter().map(str::to_owned).collect())
    }

    /// Restore a persisted vocabulary, rejecting unsorted or duplicate names.
    fn from_names(names: Vec<String>) -> Result<Self, String> {
        if let Some(pair) = names.windows(2).find(|w| w[0] >= w[1]) {
            return Err(format!("labels not strictly sorted at {:?}, {:?}", pair[0], pair[1]));
        }
        Ok(Self::from_sorted(names))
    }

    fn from_sorted(names: Vec<String>) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        Self { names, ids }
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct IndexEntry {
    embedding: Embedding,
    label_id: u32,
}

/// Outcome of a k-NN vote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    /// Neighbors among the k nearest that carry `label`.
    pub votes: usize,
    /// Number of neighbors actually consulted.
    pub k: usize,
    /// Mean distance from the probe to the winning label's neighbors.
    pub distance: f32,
}

/// Labeled embeddings plus the vocabulary that names them.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityIndex {
    entries: Vec<IndexEntry>,
    vocabulary: LabelVocabulary,
    k: usize,
    dim: usize,
    model_version: String,
    built_at: DateTime<Utc>,
}

impl IdentityIndex {
    /// Build an index from (embedding, label name) pairs.
    ///
    /// All embeddings must share one dimension. An empty input yields an empty
    /// index, which refuses queries.
    pub fn build(
        pairs: Vec<(Embedding, String)>,
        k: usize,
        model_version: &str,
    ) -> Result<Self, IndexError> {
        if k == 0 {
            return Err(IndexError::InvalidK);
        }

        let dim = pairs.first().map(|(e, _)| e.dim()).unwrap_or(0);
        for (embedding, label) in &pairs {
            if embedding.dim() != dim {
                return Err(IndexError::DimensionMismatch { expected: dim, actual: embedding.dim() });
            }
            if embedding.values.iter().any(|v| !v.is_finite()) {
                return Err(IndexError::NonFiniteEmbedding { label: label.clone() });
            }
        }

        let vocabulary = LabelVocabulary::fit(pairs.iter().map(|(_, l)| l.as_str()));
        let entries = pairs
            .into_iter()
            .map(|(embedding, label)| {
                let label_id = vocabulary.id(&label).unwrap_or_default();
                IndexEntry { embedding, label_id }
            })
            .collect::<Vec<_>>();

        tracing::info!(
            entries = entries.len(),
            labels = vocabulary.len(),
            dim,
            k,
            "identity index built"
        );

        Ok(Self {
            entries,
            vocabulary,
            k,
            dim,
            model_version: model_version.to_string(),
            built_at: Utc::now(),
        })
    }

    /// Majority label among the `k` nearest stored embeddings.
    pub fn query(&self, vector: &Embedding, k: usize) -> Result<&str, IndexError> {
        let (label_id, _) = self.vote(vector, k)?;
        Ok(self.vocabulary.name(label_id).unwrap_or_default())
    }

    /// Vote with the index's own k and report how the decision was reached.
    pub fn predict(&self, vector: &Embedding) -> Result<Prediction, IndexError> {
        let (label_id, prediction) = self.vote(vector, self.k)?;
        tracing::trace!(label_id, votes = prediction.votes, "k-NN vote");
        Ok(prediction)
    }

    /// Linear-scan k-NN. Ties in votes go to the smaller total distance, then the smaller id.
    fn vote(&self, probe: &Embedding, k: usize) -> Result<(u32, Prediction), IndexError> {
        if self.entries.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        if k == 0 {
            return Err(IndexError::InvalidK);
        }
        if probe.dim() != self.dim {
            return Err(IndexError::DimensionMismatch { expected: self.dim, actual: probe.dim() });
        }

        let mut scored: Vec<(f32, u32)> = self
            .entries
            .iter()
            .map(|e| (probe.euclidean_distance(&e.embedding), e.label_id))
            .collect();
        // Stable sort: equal distances keep insertion order.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));

        let k = k.min(scored.len());
        let mut tally: BTreeMap<u32, (usize, f32)> = BTreeMap::new();
        for &(distance, label_id) in &scored[..k] {
            let slot = tally.entry(label_id).or_insert((0, 0.0));
            slot.0 += 1;
            slot.1 += distance;
        }

        let (label_id, (votes, total)) = tally
            .into_iter()
            .min_by(|(id_a, (votes_a, total_a)), (id_b, (votes_b, total_b))| {
                votes_b
                    .cmp(votes_a)
                    .then(total_a.total_cmp(total_b))
                    .then(id_a.cmp(id_b))
            })
            .ok_or(IndexError::EmptyIndex)?;

        let prediction = Prediction {
            label: self.vocabulary.name(label_id).unwrap_or_default().to_string(),
            votes,
            k,
            distance: total / votes as f32,
        };
        Ok((label_id, prediction))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocabulary
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Number of stored embeddings per label name, in label id order.
    pub fn label_counts(&self) -> Vec<(&str, usize)> {
        let mut counts = vec![0usize; self.vocabulary.len()];
        for entry in &self.entries {
            counts[entry.label_id as usize] += 1;
        }
        self.vocabulary
            .names()
            .iter()
            .map(String::as_str)
            .zip(counts)
            .collect()
    }

    /// Write the index atomically: a sibling temp file is written, synced, then renamed.
    pub fn persist(&self, path: &Path) -> Result<(), IndexError> {
        let io_err = |source| IndexError::Io { path: path.to_path_buf(), source };

        let mut artifact = IndexArtifact {
            magic: INDEX_MAGIC.to_string(),
            format_version: INDEX_FORMAT_VERSION,
            model_version: self.model_version.clone(),
            built_at: self.built_at,
            k: self.k,
            dim: self.dim,
            labels: self.vocabulary.names().to_vec(),
            entries: self
                .entries
                .iter()
                .map(|e| ArtifactEntry { label_id: e.label_id, embedding: e.embedding.values.clone() })
                .collect(),
            checksum: String::new(),
        };
        artifact.checksum = artifact.compute_checksum();
        let data = serde_json::to_vec(&artifact)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

        let written = std::fs::File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&data)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&tmp_path, path)
        });
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }

        tracing::info!(path = %path.display(), entries = self.entries.len(), bytes = data.len(), "identity index persisted");
        Ok(())
    }

    /// Load and fully validate a persisted index. Nothing is returned unless every check passes.
    pub fn load(path: &Path) -> Result<Self, IndexLoadError> {
        let data = std::fs::read(path).map_err(|source| IndexLoadError::Io { path: path.to_path_buf(), source })?;
        let index = Self::from_slice(&data)?;
        tracing::info!(
            path = %path.display(),
            entries = index.len(),
            labels = index.vocabulary.len(),
            model_version = %index.model_version,
            "identity index loaded"
        );
        Ok(index)
    }

    fn from_slice(data: &[u8]) -> Result<Self, IndexLoadError> {
        // Check identity and version before committing to the full schema.
        let header: ArtifactHeader = serde_json::from_slice(data)?;
        if header.magic != INDEX_MAGIC {
            return Err(IndexLoadError::BadMagic(header.magic));
        }
        if header.format_version != INDEX_FORMAT_VERSION {
            return Err(IndexLoadError::UnsupportedVersion {
                found: header.format_version,
                expected: INDEX_FORMAT_VERSION,
            });
        }

        let artifact: IndexArtifact = serde_json::from_slice(data)?;
        let computed = artifact.compute_checksum();
        if computed != artifact.checksum {
            return Err(IndexLoadError::ChecksumMismatch { stored: artifact.checksum, computed });
        }

        if artifact.k == 0 {
            return Err(IndexLoadError::Inconsistent("k is 0".into()));
        }
        let vocabulary = LabelVocabulary::from_names(artifact.labels).map_err(IndexLoadError::Inconsistent)?;

        let mut entries = Vec::with_capacity(artifact.entries.len());
        for (i, entry) in artifact.entries.into_iter().enumerate() {
            if entry.label_id as usize >= vocabulary.len() {
                return Err(IndexLoadError::Inconsistent(format!(
                    "entry {i} has label id {} but vocabulary has {} labels",
                    entry.label_id,
                    vocabulary.len()
                )));
            }
            if entry.embedding.len() != artifact.dim {
                return Err(IndexLoadError::Inconsistent(format!(
                    "entry {i} has {} dimensions, expected {}",
                    entry.embedding.len(),
                    artifact.dim
                )));
            }
            entries.push(IndexEntry { embedding: Embedding::new(entry.embedding), label_id: entry.label_id });
        }

        Ok(Self {
            entries,
            vocabulary,
            k: artifact.k,
            dim: artifact.dim,
            model_version: artifact.model_version,
            built_at: artifact.built_at,
        })
    }
}

#[derive(Deserialize)]
struct ArtifactHeader {
    magic: String,
    format_version: u32,
}

#[derive(Serialize, Deserialize)]
struct IndexArtifact {
    magic: String,
    format_version: u32,
    model_version: String,
    built_at: DateTime<Utc>,
    k: usize,
    dim: usize,
    labels: Vec<String>,
    entries: Vec<ArtifactEntry>,
    /// Hex SHA-256 over everything that affects query results.
    checksum: String,
}

#[derive(Serialize, Deserialize)]
struct ArtifactEntry {
    label_id: u32,
    embedding: Vec<f32>,
}

impl IndexArtifact {
    fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(INDEX_FORMAT_VERSION.to_le_bytes());
        hasher.update((self.model_version.len() as u64).to_le_bytes());
        hasher.update(self.model_version.as_bytes());
        hasher.update((self.k as u64).to_le_bytes());
        hasher.update((self.dim as u64).to_le_bytes());
        hasher.update((self.labels.len() as u64).to_le_bytes());
        for label in &self.labels {
            hasher.update((label.len() as u64).to_le_bytes());
            hasher.update(label.as_bytes());
        }
        hasher.update((self.entries.len() as u64).to_le_bytes());
        for entry in &self.entries {
            hasher.update(entry.label_id.to_le_bytes());
            hasher.update((entry.embedding.len() as u64).to_le_bytes());
            for v in &entry.embedding {
                hasher.update(v.to_le_bytes());
            }
        }

        hasher.finalize().iter().fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }
}

/// Shared, swappable reference to the live index.
///
/// Readers take a snapshot `Arc` and query it without holding any lock; a
/// replacement only affects snapshots taken after it.
#[derive(Debug)]
pub struct IndexHandle {
    current: RwLock<Arc<IdentityIndex>>,
}

impl IndexHandle {
    /// Wrap an index for serving. Empty indexes are refused.
    pub fn new(index: IdentityIndex) -> Result<Self, IndexError> {
        if index.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        Ok(Self { current: RwLock::new(Arc::new(index)) })
    }

    pub fn current(&self) -> Arc<IdentityIndex> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Swap in a fully built index, returning the previous one.
    pub fn replace(&self, index: IdentityIndex) -> Result<Arc<IdentityIndex>, IndexError> {
        if index.is_empty() {
            return Err(IndexError::EmptyIndex);
        }
        let next = Arc::new(index);
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, next);
        tracing::info!(
            entries = guard.len(),
            labels = guard.vocabulary().len(),
            previous_entries = previous.len(),
            "identity index swapped"
        );
        Ok(previous)
    }
}
