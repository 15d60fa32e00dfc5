use anyhow::{bail, Context, Result};
use clap::builder::FalseyValueParser;
use clap::{Parser, Subcommand};
use faceid_core::{
    IdentityIndex, IndexHandle, InferencePipeline, InputLayout, ModelPaths, OnnxPipeline, TrainOptions, TrainingPipeline,
    DEFAULT_K,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "faceid", about = "Face identification: train an identity index, classify images")]
struct Cli {
    /// Directory containing det_10g.onnx and facenet.onnx
    #[arg(long, global = true, env = "FACEID_MODEL_DIR")]
    models: Option<PathBuf>,

    /// ONNX Runtime intra-op threads per model
    #[arg(long, global = true, default_value_t = 2)]
    threads: usize,

    /// FaceNet export takes NCHW input (PyTorch) instead of NHWC
    #[arg(long, global = true, env = "FACEID_NCHW_INPUT", value_parser = FalseyValueParser::new())]
    nchw: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an identity index from a <corpus>/<label>/<image> tree
    Train {
        corpus: PathBuf,
        /// Where to write the index artifact
        #[arg(short, long, env = "FACEID_INDEX_PATH")]
        out: Option<PathBuf>,
        /// Neighbors consulted per query
        #[arg(short, long, default_value_t = DEFAULT_K)]
        k: usize,
        /// Also write every accepted face crop here
        #[arg(long)]
        crops_dir: Option<PathBuf>,
    },
    /// Classify images, printing one JSON line per image
    Classify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[arg(short, long, env = "FACEID_INDEX_PATH")]
        index: Option<PathBuf>,
    },
    /// List the labels known to an index
    Labels {
        #[arg(short, long, env = "FACEID_INDEX_PATH")]
        index: Option<PathBuf>,
    },
    /// Show index metadata and per-label entry counts
    Inspect {
        #[arg(short, long, env = "FACEID_INDEX_PATH")]
        index: Option<PathBuf>,
    },
    /// Write normalized face crops for a corpus without training
    ExportCrops { corpus: PathBuf, out: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = model_paths(&cli);

    match cli.command {
        Commands::Train {
            corpus,
            out,
            k,
            crops_dir,
        } => {
            let out = out.unwrap_or_else(faceid_core::default_index_path);
            let stages = load_models(&paths)?;
            let options = TrainOptions { k, crops_dir };
            let (index, report) = TrainingPipeline::new(&stages, options)
                .train(&corpus, &out)
                .with_context(|| format!("training from {}", corpus.display()))?;
            eprintln!(
                "wrote {} ({} entries, {} labels)",
                out.display(),
                index.len(),
                index.vocabulary().len()
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Classify { images, index } => {
            let index = load_index(index)?;
            let stages = load_models(&paths)?;
            let pipeline = InferencePipeline::new(stages, Arc::new(IndexHandle::new(index)?));

            let mut failed = 0usize;
            for path in &images {
                match pipeline.classify_path(path) {
                    Ok(result) => {
                        let mut line = serde_json::to_value(&result)?;
                        line["path"] = path.display().to_string().into();
                        println!("{line}");
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "classification failed");
                        println!(
                            "{}",
                            serde_json::json!({
                                "path": path.display().to_string(),
                                "outcome": "error",
                                "message": e.to_string(),
                            })
                        );
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} images failed", images.len());
            }
        }
        Commands::Labels { index } => {
            let index = load_index(index)?;
            for name in index.vocabulary().names() {
                println!("{name}");
            }
        }
        Commands::Inspect { index } => {
            let index = load_index(index)?;
            println!("{}", serde_json::to_string_pretty(&describe(&index))?);
        }
        Commands::ExportCrops { corpus, out } => {
            let stages = load_models(&paths)?;
            let report = TrainingPipeline::new(&stages, TrainOptions::default())
                .export_crops(&corpus, &out)
                .with_context(|| format!("exporting crops from {}", corpus.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn model_paths(cli: &Cli) -> ModelPaths {
    let dir = cli.models.clone().unwrap_or_else(faceid_core::default_model_dir);
    let mut paths = ModelPaths::in_dir(&dir);
    paths.intra_threads = cli.threads;
    if cli.nchw {
        paths.extractor_layout = InputLayout::Nchw;
    }
    paths
}

fn load_models(paths: &ModelPaths) -> Result<OnnxPipeline> {
    faceid_core::load_models(paths).with_context(|| format!("loading models from {}", paths.extractor.display()))
}

fn load_index(path: Option<PathBuf>) -> Result<IdentityIndex> {
    let path = path.unwrap_or_else(faceid_core::default_index_path);
    IdentityIndex::load(&path).with_context(|| format!("loading index {}", path.display()))
}

fn describe(index: &IdentityIndex) -> serde_json::Value {
    let labels: serde_json::Map<String, serde_json::Value> = index
        .label_counts()
        .into_iter()
        .map(|(name, count)| (name.to_string(), count.into()))
        .collect();
    serde_json::json!({
        "entries": index.len(),
        "k": index.k(),
        "dim": index.dim(),
        "model_version": index.model_version(),
        "built_at": index.built_at().to_rfc3339(),
        "labels": labels,
    })
}
