// External imports
use burn::tensor::backend::AutodiffBackend;
use log::{error, info};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// Internal imports
use crate::constants::{DEFAULT_BUCKET, DEFAULT_EXPORT_VERSION, DEFAULT_MODEL_DIR, LATENT_DIM};
use crate::error::PipelineError;
use crate::seq2seq::step_1_dataset_provider::{DatasetProvider, ObjectStore, Seq2SeqDataset};
use crate::seq2seq::step_3_seq2seq_model_arch::{Seq2SeqConfig, Seq2SeqModel};
use crate::seq2seq::step_4_train_model::{train_model, TrainedSeq2Seq, TrainingConfig, TrainingHistory};
use crate::seq2seq::step_5_event_likelihood::dataset_event_likelihood;
use crate::seq2seq::step_6_model_export::export_model;

/// Lifecycle of one end-to-end run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Configured,
    DataLoaded,
    ModelBuilt,
    Training,
    Trained,
    Exported,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Configured => "CONFIGURED",
            PipelineStage::DataLoaded => "DATA_LOADED",
            PipelineStage::ModelBuilt => "MODEL_BUILT",
            PipelineStage::Training => "TRAINING",
            PipelineStage::Trained => "TRAINED",
            PipelineStage::Exported => "EXPORTED",
            PipelineStage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A fatal error tagged with where it happened
#[derive(Debug, Error)]
#[error("{operation} failed in stage {stage}: {source}")]
pub struct PipelineFailure {
    pub operation: &'static str,
    pub stage: PipelineStage,
    pub source: PipelineError,
}

/// Settings for a whole run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub training: TrainingConfig,
    pub latent_dim: usize,
    pub bucket: String,
    /// Base directory, the export lands in `<model_dir>/model/<export_version>`
    pub model_dir: PathBuf,
    pub export_version: u32,
    /// Decoder token whose likelihood is reported after training
    pub event_index: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            training: TrainingConfig::default(),
            latent_dim: LATENT_DIM,
            bucket: DEFAULT_BUCKET.to_string(),
            model_dir: PathBuf::from(DEFAULT_MODEL_DIR),
            export_version: DEFAULT_EXPORT_VERSION,
            event_index: None,
        }
    }
}

/// What a successful run leaves behind
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub export_path: PathBuf,
    pub history: TrainingHistory,
    /// Mean event likelihood over the held-out samples, when requested
    pub mean_event_likelihood: Option<f64>,
}

/// Data loading, model construction, training and export, in that order.
pub struct Seq2SeqPipeline<B: AutodiffBackend> {
    config: PipelineConfig,
    provider: DatasetProvider,
    device: B::Device,
    stage: PipelineStage,
    dataset: Option<Seq2SeqDataset>,
    model: Option<Seq2SeqModel<B>>,
    trained: Option<TrainedSeq2Seq<B::InnerBackend>>,
    export_path: Option<PathBuf>,
}

impl<B: AutodiffBackend> Seq2SeqPipeline<B> {
    pub fn new(config: PipelineConfig, store: Box<dyn ObjectStore>, device: B::Device) -> Self {
        let provider = DatasetProvider::new(store, config.bucket.clone());
        Self {
            config,
            provider,
            device,
            stage: PipelineStage::Configured,
            dataset: None,
            model: None,
            trained: None,
            export_path: None,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn dataset(&self) -> Option<&Seq2SeqDataset> {
        self.dataset.as_ref()
    }

    pub fn model(&self) -> Option<&Seq2SeqModel<B>> {
        self.model.as_ref()
    }

    pub fn trained(&self) -> Option<&TrainedSeq2Seq<B::InnerBackend>> {
        self.trained.as_ref()
    }

    pub fn export_path(&self) -> Option<&PathBuf> {
        self.export_path.as_ref()
    }

    fn fail(&mut self, operation: &'static str, source: PipelineError) -> PipelineFailure {
        let stage = self.stage;
        self.stage = PipelineStage::Failed;
        error!("{} failed in stage {}: {}", operation, stage, source);
        PipelineFailure {
            operation,
            stage,
            source,
        }
    }

    /// Fail with `error_kind` unless the pipeline is in `expected`
    fn require(
        &mut self,
        operation: &'static str,
        expected: PipelineStage,
        error_kind: fn(String) -> PipelineError,
    ) -> Result<(), PipelineFailure> {
        if self.stage == expected {
            return Ok(());
        }
        let message = format!("{} requires stage {}, pipeline is {}", operation, expected, self.stage);
        Err(self.fail(operation, error_kind(message)))
    }

    /// CONFIGURED -> DATA_LOADED
    pub fn load_data(&mut self) -> Result<&Seq2SeqDataset, PipelineFailure> {
        self.require("load_data", PipelineStage::Configured, PipelineError::InvalidState)?;
        let dataset = self
            .provider
            .load_training_set()
            .map_err(|e| self.fail("load_data", e))?;

        info!(
            "Dataset: {} samples, encoder {}x{}, decoder {}x{}",
            dataset.num_samples(),
            dataset.encoder_timesteps(),
            dataset.num_encoder_tokens(),
            dataset.decoder_timesteps(),
            dataset.num_decoder_tokens()
        );
        self.stage = PipelineStage::DataLoaded;
        Ok(self.dataset.insert(dataset))
    }

    /// DATA_LOADED -> MODEL_BUILT
    pub fn build_model(&mut self) -> Result<&Seq2SeqModel<B>, PipelineFailure> {
        self.require("build_model", PipelineStage::DataLoaded, PipelineError::InvalidState)?;
        if self.config.latent_dim == 0 {
            let source = PipelineError::InvalidConfig("latent dimension must be positive".into());
            return Err(self.fail("build_model", source));
        }

        let latent_dim = self.config.latent_dim;
        let model_config = match self
            .dataset
            .as_ref()
            .map(|dataset| Seq2SeqConfig::from_dataset(dataset, latent_dim))
        {
            Some(model_config) => model_config,
            None => {
                let source = PipelineError::InvalidState("no dataset loaded".into());
                return Err(self.fail("build_model", source));
            }
        };
        // Event index must fit the decoder vocabulary
        if let Some(event_index) = self.config.event_index {
            if event_index >= model_config.num_decoder_tokens {
                let source = PipelineError::ShapeMismatch(format!(
                    "event index {} outside decoder vocabulary of {} tokens",
                    event_index, model_config.num_decoder_tokens
                ));
                return Err(self.fail("build_model", source));
            }
        }
        let model = model_config.init::<B>(self.config.training.seed, &self.device);
        info!("Model summary:\n{}", model.summary());

        self.stage = PipelineStage::ModelBuilt;
        Ok(self.model.insert(model))
    }

    /// MODEL_BUILT -> TRAINING -> TRAINED
    pub fn train(&mut self) -> Result<&TrainingHistory, PipelineFailure> {
        self.require("train", PipelineStage::ModelBuilt, PipelineError::InvalidState)?;
        let (model, dataset) = match (self.model.take(), self.dataset.take()) {
            (Some(model), Some(dataset)) => (model, dataset),
            _ => {
                let source = PipelineError::InvalidState("model or dataset missing".into());
                return Err(self.fail("train", source));
            }
        };

        self.stage = PipelineStage::Training;
        let result = train_model(model, &dataset, &self.config.training, &self.device);
        self.dataset = Some(dataset);
        let trained = result.map_err(|e| self.fail("train", e))?;

        self.stage = PipelineStage::Trained;
        Ok(self.trained.insert(trained).history())
    }

    /// TRAINED -> EXPORTED
    pub fn export(&mut self) -> Result<PathBuf, PipelineFailure> {
        self.require("export", PipelineStage::Trained, PipelineError::ExportError)?;
        let Some(trained) = self.trained.take() else {
            let source = PipelineError::ExportError("model has not been trained".into());
            return Err(self.fail("export", source));
        };

        let result = export_model(
            &trained,
            &self.config.model_dir,
            self.config.export_version,
            &self.device,
        );
        self.trained = Some(trained);
        let path = result.map_err(|e| self.fail("export", e))?;

        self.stage = PipelineStage::Exported;
        self.export_path = Some(path.clone());
        Ok(path)
    }

    /// Mean likelihood of `event_index` over the held-out validation samples
    pub fn validation_event_likelihood(&self, event_index: usize) -> Result<f64, PipelineError> {
        let (Some(trained), Some(dataset)) = (self.trained.as_ref(), self.dataset.as_ref()) else {
            return Err(PipelineError::InvalidState(
                "event likelihood needs a trained model".into(),
            ));
        };

        let (_, val_set) = dataset.split_validation(self.config.training.validation_split)?;
        let likelihoods = dataset_event_likelihood(
            trained.model(),
            &val_set,
            event_index,
            self.config.training.batch_size,
            &self.device,
        )?;
        let total: f64 = likelihoods.iter().map(|&p| p as f64).sum();
        Ok(total / likelihoods.len() as f64)
    }

    /// Run every stage to completion
    pub fn run(mut self) -> Result<PipelineOutcome, PipelineFailure> {
        self.load_data()?;
        self.build_model()?;
        self.train()?;

        let mean_event_likelihood = match self.config.event_index {
            Some(event_index) => {
                let likelihood = self
                    .validation_event_likelihood(event_index)
                    .map_err(|e| self.fail("event_likelihood", e))?;
                info!(
                    "Mean likelihood of event {} on validation samples: {:.4}",
                    event_index, likelihood
                );
                Some(likelihood)
            }
            None => None,
        };

        let export_path = self.export()?;
        let history = match self.trained.take() {
            Some(trained) => trained.history().clone(),
            None => TrainingHistory::default(),
        };

        Ok(PipelineOutcome {
            export_path,
            history,
            mean_event_likelihood,
        })
    }
}
