use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use chrono::Local;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{CHECKPOINT_SUFFIX, MODEL_NAME_PREFIX};
use crate::error::{PipelineError, Result};
use crate::seq2seq::step_3_seq2seq_model_arch::{Seq2SeqConfig, Seq2SeqModel, Seq2SeqModelRecord};

const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// Unique run name, e.g. `customer_event_prediction_lstm_20240131-235959_1a2b3c4d`
///
/// The random suffix keeps runs started within the same second apart.
pub fn model_name() -> String {
    format!(
        "{}_{}_{:08x}",
        MODEL_NAME_PREFIX,
        Local::now().format("%Y%m%d-%H%M%S"),
        rand::random::<u32>()
    )
}

/// Single-file checkpoint location for a run
pub fn checkpoint_path(dir: &Path, model_name: &str) -> PathBuf {
    dir.join(format!("{}{}.bin", model_name, CHECKPOINT_SUFFIX))
}

/// Versioned export directory, `<model_dir>/model/<version>`
pub fn export_path(model_dir: &Path, version: u32) -> PathBuf {
    model_dir.join("model").join(version.to_string())
}

/// Header stored in front of the weights of every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: u32,
    pub config: Seq2SeqConfig,
    pub epoch: usize,
    pub val_loss: f64,
}

#[derive(Serialize, Deserialize)]
struct CheckpointEnvelope {
    metadata: CheckpointMetadata,
    weights: Vec<u8>,
}

fn checkpoint_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Checkpoint(e.to_string())
}

/// Save a model checkpoint during training
///
/// Graph configuration and weights go into one file, replacing any previous
/// checkpoint at `path`.
pub fn save_model_checkpoint<B: Backend>(
    model: &Seq2SeqModel<B>,
    epoch: usize,
    val_loss: f64,
    path: &Path,
) -> Result<()> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let weights = BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(checkpoint_error)?;
    let envelope = CheckpointEnvelope {
        metadata: CheckpointMetadata {
            format_version: CHECKPOINT_FORMAT_VERSION,
            config: model.config(),
            epoch,
            val_loss,
        },
        weights,
    };
    let bytes = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(checkpoint_error)?;

    std::fs::write(path, bytes)?;
    debug!("Checkpoint for epoch {} written to {}", epoch, path.display());
    Ok(())
}

/// Load a checkpoint written by [`save_model_checkpoint`]
pub fn load_model_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(Seq2SeqModel<B>, CheckpointMetadata)> {
    let bytes = std::fs::read(path)?;
    let (envelope, _): (CheckpointEnvelope, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(checkpoint_error)?;

    if envelope.metadata.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(PipelineError::Checkpoint(format!(
            "unsupported checkpoint format {}",
            envelope.metadata.format_version
        )));
    }

    let record: Seq2SeqModelRecord<B> = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(envelope.weights, device)
        .map_err(checkpoint_error)?;
    // Seed is irrelevant, every parameter is overwritten by the record
    let model = envelope
        .metadata
        .config
        .init::<B>(0, device)
        .load_record(record);

    Ok((model, envelope.metadata))
}
