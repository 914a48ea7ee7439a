// External imports
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::ElementConversion;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

// Internal imports
use super::step_1_dataset_provider::Seq2SeqDataset;
use super::step_3_seq2seq_model_arch::{Seq2SeqConfig, Seq2SeqModel};
use crate::constants::{
    ADAM_EPSILON, DEFAULT_BATCH_SIZE, DEFAULT_EPOCHS, DEFAULT_LEARNING_RATE, DEFAULT_SEED,
    VALIDATION_SPLIT_RATIO,
};
use crate::error::{PipelineError, Result};
use crate::util::model_utils;

/// Configuration for training the model
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub batch_size: usize,
    pub epochs: usize,
    /// Fraction of samples, taken from the end of the dataset, held out for validation
    pub validation_split: f64,
    pub seed: u64,
    pub shuffle: bool,
    /// Where the best-so-far model is written
    pub checkpoint_path: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: DEFAULT_LEARNING_RATE,
            batch_size: DEFAULT_BATCH_SIZE,
            epochs: DEFAULT_EPOCHS,
            validation_split: VALIDATION_SPLIT_RATIO,
            seed: DEFAULT_SEED,
            shuffle: true,
            checkpoint_path: model_utils::checkpoint_path(
                &std::env::temp_dir(),
                &model_utils::model_name(),
            ),
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "validation split must be in (0, 1), got {}",
                self.validation_split
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Per-epoch training statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    pub total_epochs: usize,
    /// Sample-weighted mean training loss
    pub train_loss: f64,
    pub val_loss: f64,
    /// Whether `val_loss` beat every earlier epoch (and a checkpoint was written)
    pub improved: bool,
    pub elapsed_ms: u64,
}

/// Everything observed during one call to [`train_model`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochStats>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
    pub checkpoints_written: usize,
    /// Set once the first checkpoint has been written
    pub checkpoint_path: Option<PathBuf>,
    pub train_samples: usize,
    pub val_samples: usize,
    pub elapsed_seconds: f64,
}

impl TrainingHistory {
    pub fn final_train_loss(&self) -> Option<f64> {
        self.epochs.last().map(|stats| stats.train_loss)
    }

    pub fn final_val_loss(&self) -> Option<f64> {
        self.epochs.last().map(|stats| stats.val_loss)
    }
}

/// A model that went through [`train_model`], ready for export.
///
/// Only the training loop can create one, so an untrained model can never
/// reach the exporter.
#[derive(Debug, Clone)]
pub struct TrainedSeq2Seq<B: Backend> {
    model: Seq2SeqModel<B>,
    history: TrainingHistory,
    training_config: TrainingConfig,
}

impl<B: Backend> TrainedSeq2Seq<B> {
    pub fn model(&self) -> &Seq2SeqModel<B> {
        &self.model
    }

    pub fn config(&self) -> Seq2SeqConfig {
        self.model.config()
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training_config
    }

    pub fn into_model(self) -> Seq2SeqModel<B> {
        self.model
    }
}

/// Train the encoder-decoder model
///
/// # Arguments
///
/// * `model` - Freshly built model; its token counts must match `dataset`
/// * `dataset` - Aligned encoder input, decoder input and decoder target
/// * `config` - Training configuration
/// * `device` - Device to place tensors on
///
/// # Returns
///
/// The final model (on the inference backend) together with its history.
/// The best validation model is additionally persisted at
/// `config.checkpoint_path` whenever it improves.
pub fn train_model<B: AutodiffBackend>(
    mut model: Seq2SeqModel<B>,
    dataset: &Seq2SeqDataset,
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<TrainedSeq2Seq<B::InnerBackend>> {
    config.validate()?;
    model.config().check_dataset(dataset)?;
    let run_started = Instant::now();

    let (train_set, val_set) = dataset.split_validation(config.validation_split)?;
    info!(
        "Train on {} samples, validate on {} samples",
        train_set.num_samples(),
        val_set.num_samples()
    );

    let mut history = TrainingHistory {
        train_samples: train_set.num_samples(),
        val_samples: val_set.num_samples(),
        ..Default::default()
    };

    let mut optimizer = AdamConfig::new()
        .with_epsilon(ADAM_EPSILON)
        .init::<B, Seq2SeqModel<B>>();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..train_set.num_samples()).collect();

    for epoch in 1..=config.epochs {
        let started = Instant::now();
        if config.shuffle {
            order.shuffle(&mut rng);
        }

        let mut loss_sum = 0.0;
        for (batch_idx, indices) in order.chunks(config.batch_size).enumerate() {
            let batch = train_set.batch::<B>(indices, device);
            let loss = model.loss(batch.encoder_input, batch.decoder_input, batch.decoder_target);

            let loss_value = loss.clone().into_scalar().elem::<f64>();
            if !loss_value.is_finite() {
                return Err(PipelineError::OptimizationDivergence {
                    epoch,
                    batch: batch_idx + 1,
                    loss: loss_value,
                });
            }
            debug!("epoch {} batch {} loss {:.6}", epoch, batch_idx + 1, loss_value);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(config.learning_rate, model, grads);
            loss_sum += loss_value * indices.len() as f64;
        }
        let train_loss = loss_sum / train_set.num_samples() as f64;

        // Validation pass on the inner backend, no graph recorded
        let valid_model = model.valid();
        let val_loss = evaluate_loss(&valid_model, &val_set, config.batch_size, device);
        if !val_loss.is_finite() {
            // batch 0 marks the validation pass
            return Err(PipelineError::OptimizationDivergence {
                epoch,
                batch: 0,
                loss: val_loss,
            });
        }

        let improved = history.best_val_loss.map_or(true, |best| val_loss < best);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            "Epoch {}/{} - {}ms - loss: {:.4} - val_loss: {:.4}",
            epoch, config.epochs, elapsed_ms, train_loss, val_loss
        );

        if improved {
            match history.best_val_loss {
                Some(best) => info!(
                    "val_loss improved from {:.5} to {:.5}, saving model to {}",
                    best,
                    val_loss,
                    config.checkpoint_path.display()
                ),
                None => info!(
                    "val_loss improved from inf to {:.5}, saving model to {}",
                    val_loss,
                    config.checkpoint_path.display()
                ),
            }
            model_utils::save_model_checkpoint(&valid_model, epoch, val_loss, &config.checkpoint_path)?;
            history.best_val_loss = Some(val_loss);
            history.best_epoch = Some(epoch);
            history.checkpoints_written += 1;
            history.checkpoint_path = Some(config.checkpoint_path.clone());
        } else if let Some(best) = history.best_val_loss {
            info!("val_loss did not improve from {:.5}", best);
        }

        history.epochs.push(EpochStats {
            epoch,
            total_epochs: config.epochs,
            train_loss,
            val_loss,
            improved,
            elapsed_ms,
        });
    }

    history.elapsed_seconds = run_started.elapsed().as_secs_f64();
    Ok(TrainedSeq2Seq {
        model: model.valid(),
        history,
        training_config: config.clone(),
    })
}

/// Sample-weighted mean cross-entropy of `model` over `dataset`.
pub fn evaluate_loss<B: Backend>(
    model: &Seq2SeqModel<B>,
    dataset: &Seq2SeqDataset,
    batch_size: usize,
    device: &B::Device,
) -> f64 {
    let mut loss_sum = 0.0;
    for indices in dataset.batch_ranges(batch_size) {
        let batch = dataset.batch::<B>(&indices, device);
        let loss = model
            .loss(batch.encoder_input, batch.decoder_input, batch.decoder_target)
            .into_scalar()
            .elem::<f64>();
        loss_sum += loss * indices.len() as f64;
    }
    loss_sum / dataset.num_samples() as f64
}
