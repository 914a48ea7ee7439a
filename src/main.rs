// External crates
use anyhow::{Context, Result};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

// Local modules
use event_seq2seq::constants;
use event_seq2seq::pipeline::{PipelineConfig, Seq2SeqPipeline};
use event_seq2seq::seq2seq::step_1_dataset_provider::{
    HttpObjectStore, LocalObjectStore, ObjectStore,
};
use event_seq2seq::seq2seq::step_4_train_model::TrainingConfig;
use event_seq2seq::util::model_utils;

type BurnBackend = Autodiff<NdArray<f32>>;

/// Train the customer event sequence-to-sequence model and export it for serving
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of training epochs
    #[arg(long, default_value_t = constants::DEFAULT_EPOCHS)]
    epochs: usize,

    /// Mini-batch size
    #[arg(long = "batchsize", default_value_t = constants::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Base directory of the exported model
    #[arg(long = "modeldir", default_value = constants::DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,

    /// Bucket holding the training tensors
    #[arg(long, default_value = constants::DEFAULT_BUCKET)]
    bucket: String,

    /// Object storage endpoint, objects are fetched from `<endpoint>/<bucket>/<key>`.
    /// Requests are unsigned: the endpoint must be public, a presigning gateway,
    /// or accept `--storage-token`
    #[arg(long, default_value = constants::DEFAULT_STORAGE_ENDPOINT)]
    storage_endpoint: String,

    /// Bearer token sent as `Authorization` header to the storage endpoint
    #[arg(long)]
    storage_token: Option<String>,

    /// Read objects from `<data-dir>/<bucket>/<key>` instead of the endpoint
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for the best-model checkpoint (system temp dir by default)
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long, default_value_t = constants::LATENT_DIM)]
    latent_dim: usize,

    #[arg(long, default_value_t = constants::DEFAULT_LEARNING_RATE)]
    learning_rate: f64,

    #[arg(long, default_value_t = constants::DEFAULT_SEED)]
    seed: u64,

    /// Version segment of the export path
    #[arg(long, default_value_t = constants::DEFAULT_EXPORT_VERSION)]
    export_version: u32,

    /// Decoder token index whose likelihood is reported after training
    #[arg(long)]
    event_index: Option<usize>,
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args = Args::parse();
    info!("epochs: {}", args.epochs);
    info!("batch size: {}", args.batch_size);
    info!("model dir: {}", args.model_dir.display());

    let store: Box<dyn ObjectStore> = match &args.data_dir {
        Some(dir) => Box::new(LocalObjectStore::new(dir)),
        None => {
            let mut store = HttpObjectStore::new(args.storage_endpoint.as_str())
                .context("Failed to create storage client")?;
            if let Some(token) = &args.storage_token {
                store = store.with_bearer_token(token.as_str());
            }
            Box::new(store)
        }
    };

    let checkpoint_dir = args.checkpoint_dir.unwrap_or_else(std::env::temp_dir);
    let training = TrainingConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        seed: args.seed,
        checkpoint_path: model_utils::checkpoint_path(&checkpoint_dir, &model_utils::model_name()),
        ..Default::default()
    };
    let config = PipelineConfig {
        training,
        latent_dim: args.latent_dim,
        bucket: args.bucket,
        model_dir: args.model_dir,
        export_version: args.export_version,
        event_index: args.event_index,
    };

    let device = NdArrayDevice::Cpu;
    let outcome = Seq2SeqPipeline::<BurnBackend>::new(config, store, device)
        .run()
        .context("Training pipeline failed")?;

    match outcome.history.best_val_loss {
        Some(best) => info!(
            "Best val_loss {:.5} at epoch {}",
            best,
            outcome.history.best_epoch.unwrap_or_default()
        ),
        None => info!("No epochs were run"),
    }
    info!("Model exported to {}", outcome.export_path.display());
    Ok(())
}
