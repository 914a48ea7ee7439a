use std::fs;
use std::path::{Path, PathBuf};
use chrono::Local;
use serde::{Serialize, Deserialize};
use std::io::Write;

use crate::error::Result;
use crate::seq2seq::step_3_seq2seq_model_arch::Seq2SeqConfig;
use crate::seq2seq::step_4_train_model::{EpochStats, TrainedSeq2Seq};
use burn::tensor::backend::Backend;

/// Record of one training run, stored next to the exported model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub timestamp: String,
    pub model_config: Seq2SeqConfig,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub validation_split: f64,
    pub seed: u64,
    pub train_samples: usize,
    pub val_samples: usize,
    pub history: Vec<EpochStats>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub checkpoints_written: usize,
    pub checkpoint_path: Option<PathBuf>,
    pub training_time_seconds: Option<f64>,
    pub notes: String,
}

impl TrainingRun {
    pub fn from_trained<B: Backend>(trained: &TrainedSeq2Seq<B>) -> Self {
        let history = trained.history();
        let config = trained.training_config();
        let mut run = Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            model_config: trained.config(),
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            validation_split: config.validation_split,
            seed: config.seed,
            train_samples: history.train_samples,
            val_samples: history.val_samples,
            history: history.epochs.clone(),
            best_epoch: history.best_epoch,
            best_val_loss: history.best_val_loss,
            checkpoints_written: history.checkpoints_written,
            checkpoint_path: history.checkpoint_path.clone(),
            training_time_seconds: Some(history.elapsed_seconds),
            notes: "".to_string(),
        };
        run.add_note("checkpoint monitor: val_loss (lower is better)");
        if history.epochs.is_empty() {
            run.add_note("no epochs run, weights are the initial ones");
        }
        run
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    /// Write the run as pretty JSON to `path`
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(json.as_bytes())?;

        Ok(path.to_path_buf())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
