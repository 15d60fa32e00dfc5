//! Builds an identity index from a directory-per-label image corpus.
//!
//! Per-image problems (unreadable file, no face, degenerate box) skip that
//! image and are counted in the [`TrainingReport`]. Model failures abort the run.

use crate::detector::FaceLocalizer;
use crate::index::{IdentityIndex, IndexError, DEFAULT_K};
use crate::normalizer::NormalizeError;
use crate::pipeline::{FacePipeline, StageError};
use crate::recognizer::EmbeddingExtractor;
use crate::types::{Embedding, Sample};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("failed to read corpus directory {}: {source}", .path.display())]
    Corpus {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable face samples under {}", .0.display())]
    NoUsableSamples(PathBuf),
    #[error("failed to write face crop {}: {source}", .path.display())]
    CropExport {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    /// Neighbors consulted by the built index.
    pub k: usize,
    /// When set, every accepted face crop is written to `<crops_dir>/<label>/<file name>.png`.
    pub crops_dir: Option<PathBuf>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            crops_dir: None,
        }
    }
}

/// Counters for one pass over the corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrainingReport {
    pub labels: usize,
    pub samples: usize,
    pub embedded: usize,
    pub skipped_decode: usize,
    pub skipped_no_face: usize,
    pub skipped_degenerate: usize,
    pub crops_written: usize,
}

impl TrainingReport {
    pub fn skipped(&self) -> usize {
        self.skipped_decode + self.skipped_no_face + self.skipped_degenerate
    }
}

/// List `<root>/<label>/<file>` samples in sorted order, ignoring hidden entries.
pub fn collect_samples(corpus_root: &Path) -> Result<Vec<Sample>, TrainError> {
    let mut samples = Vec::new();
    for label_dir in sorted_entries(corpus_root)? {
        if !label_dir.is_dir() {
            continue;
        }
        let Some(label) = label_dir.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            tracing::warn!(path = %label_dir.display(), "skipping label directory with non-UTF-8 name");
            continue;
        };
        for path in sorted_entries(&label_dir)? {
            if path.is_file() {
                samples.push(Sample {
                    path,
                    label: label.clone(),
                });
            }
        }
    }
    Ok(samples)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, TrainError> {
    let corpus_err = |source| TrainError::Corpus {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(corpus_err)? {
        let entry = entry.map_err(corpus_err)?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

pub struct TrainingPipeline<'a, L, E> {
    stages: &'a FacePipeline<L, E>,
    options: TrainOptions,
}

impl<'a, L: FaceLocalizer, E: EmbeddingExtractor> TrainingPipeline<'a, L, E> {
    pub fn new(stages: &'a FacePipeline<L, E>, options: TrainOptions) -> Self {
        Self { stages, options }
    }

    /// Embed every sample and build the index in memory.
    pub fn run(&self, corpus_root: &Path) -> Result<(IdentityIndex, TrainingReport), TrainError> {
        let (pairs, report) = self.process(corpus_root, self.options.crops_dir.as_deref(), true)?;
        if pairs.is_empty() {
            return Err(TrainError::NoUsableSamples(corpus_root.to_path_buf()));
        }
        let index = IdentityIndex::build(pairs, self.options.k, self.stages.extractor().model_version())?;
        Ok((index, report))
    }

    /// [`run`](Self::run), then persist the index to `artifact`.
    pub fn train(&self, corpus_root: &Path, artifact: &Path) -> Result<(IdentityIndex, TrainingReport), TrainError> {
        let (index, report) = self.run(corpus_root)?;
        index.persist(artifact)?;
        Ok((index, report))
    }

    /// Write normalized face crops for the whole corpus without embedding them.
    pub fn export_crops(&self, corpus_root: &Path, out_dir: &Path) -> Result<TrainingReport, TrainError> {
        let (_, report) = self.process(corpus_root, Some(out_dir), false)?;
        Ok(report)
    }

    fn process(
        &self,
        corpus_root: &Path,
        crops_dir: Option<&Path>,
        embed: bool,
    ) -> Result<(Vec<(Embedding, String)>, TrainingReport), TrainError> {
        let samples = collect_samples(corpus_root)?;
        let mut report = TrainingReport {
            samples: samples.len(),
            ..TrainingReport::default()
        };
        let mut labels = std::collections::BTreeSet::new();
        let mut pairs = Vec::new();

        tracing::info!(root = %corpus_root.display(), samples = samples.len(), "processing corpus");

        for sample in samples {
            let image = match image::open(&sample.path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(path = %sample.path.display(), error = %e, "skipping unreadable image");
                    report.skipped_decode += 1;
                    continue;
                }
            };

            let Some((face, _)) = self.stages.locate(&image)? else {
                tracing::warn!(path = %sample.path.display(), label = %sample.label, "no face detected, skipping");
                report.skipped_no_face += 1;
                continue;
            };

            if let Some(dir) = crops_dir {
                match self.stages.normalizer().crop(&image, &face) {
                    Ok(crop) => {
                        // Full source name, so `shot.png` and `shot.bmp` stay distinct.
                        let name = sample.path.file_name().unwrap_or_default().to_string_lossy();
                        let out = dir.join(&sample.label).join(format!("{name}.png"));
                        if let Some(parent) = out.parent() {
                            std::fs::create_dir_all(parent).map_err(|e| TrainError::CropExport {
                                path: out.clone(),
                                source: image::ImageError::IoError(e),
                            })?;
                        }
                        crop.save(&out).map_err(|source| TrainError::CropExport { path: out.clone(), source })?;
                        report.crops_written += 1;
                    }
                    Err(NormalizeError::DegenerateRegion { .. }) => {
                        tracing::warn!(path = %sample.path.display(), ?face, "degenerate face region, skipping");
                        report.skipped_degenerate += 1;
                        continue;
                    }
                }
            }

            if embed {
                match self.stages.embed_face(&image, &face) {
                    Ok(embedding) => pairs.push((embedding, sample.label.clone())),
                    Err(StageError::Normalize(e)) => {
                        tracing::warn!(path = %sample.path.display(), error = %e, "skipping sample");
                        report.skipped_degenerate += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            labels.insert(sample.label);
            report.embedded += usize::from(embed);
        }

        report.labels = labels.len();
        tracing::info!(
            labels = report.labels,
            samples = report.samples,
            embedded = report.embedded,
            skipped = report.skipped(),
            crops = report.crops_written,
            "corpus processed"
        );
        Ok((pairs, report))
    }
}
