// External imports
use anyhow::Result;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use std::path::Path;
use tempfile::tempdir;

// Internal imports
use crate::constants::{DECODER_OUTPUT_NAME, DECODER_INPUT_NAME, ENCODER_INPUT_NAME};
use crate::error::PipelineError;
use crate::pipeline::{PipelineConfig, PipelineStage, Seq2SeqPipeline};
use crate::seq2seq::step_1_dataset_provider::LocalObjectStore;
use crate::seq2seq::step_4_train_model::TrainingConfig;
use crate::seq2seq::step_6_model_export::load_exported_model;
use crate::util::test_utils::{generate_test_dataset, write_dataset_to_store};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

const BUCKET: &str = "pipeline-bucket";

fn pipeline_config(dir: &Path, epochs: usize, batch_size: usize, latent_dim: usize) -> PipelineConfig {
    PipelineConfig {
        training: TrainingConfig {
            epochs,
            batch_size,
            checkpoint_path: dir.join("checkpoints").join("pipeline_ckpt.bin"),
            ..Default::default()
        },
        latent_dim,
        bucket: BUCKET.to_string(),
        model_dir: dir.join("ml"),
        ..Default::default()
    }
}

fn new_pipeline(root: &Path, config: PipelineConfig) -> Seq2SeqPipeline<TestAutodiffBackend> {
    Seq2SeqPipeline::new(config, Box::new(LocalObjectStore::new(root)), NdArrayDevice::Cpu)
}

#[test]
fn test_end_to_end_run() -> Result<()> {
    let dir = tempdir()?;
    let store_root = dir.path().join("store");
    let dataset = generate_test_dataset(100, (10, 20), (8, 15), 1)?;
    write_dataset_to_store(&store_root, BUCKET, &dataset)?;

    let mut config = pipeline_config(dir.path(), 2, 16, 32);
    config.event_index = Some(3);
    let outcome = new_pipeline(&store_root, config.clone()).run()?;

    assert_eq!(outcome.export_path, dir.path().join("ml").join("model").join("1"));
    assert_eq!(outcome.history.epochs.len(), 2);
    assert_eq!(outcome.history.train_samples, 80);
    assert_eq!(outcome.history.val_samples, 20);

    let improvements = outcome.history.epochs.iter().filter(|s| s.improved).count();
    assert_eq!(outcome.history.checkpoints_written, improvements);
    assert!(config.training.checkpoint_path.is_file());

    let likelihood = outcome.mean_event_likelihood.unwrap();
    assert!((0.0..=1.0).contains(&likelihood));

    let (model, manifest) = load_exported_model::<TestBackend>(&outcome.export_path, &NdArrayDevice::Cpu)?;
    assert!(manifest.signature.inputs.contains_key(ENCODER_INPUT_NAME));
    assert!(manifest.signature.inputs.contains_key(DECODER_INPUT_NAME));
    assert!(manifest.signature.outputs.contains_key(DECODER_OUTPUT_NAME));
    assert_eq!(model.num_encoder_tokens(), 20);
    assert_eq!(model.num_decoder_tokens(), 15);
    assert_eq!(model.latent_dim(), 32);
    Ok(())
}

#[test]
fn test_stages_advance_in_order() -> Result<()> {
    let dir = tempdir()?;
    let store_root = dir.path().join("store");
    write_dataset_to_store(&store_root, BUCKET, &generate_test_dataset(10, (3, 4), (3, 5), 2)?)?;

    let mut pipeline = new_pipeline(&store_root, pipeline_config(dir.path(), 1, 4, 8));
    assert_eq!(pipeline.stage(), PipelineStage::Configured);

    pipeline.load_data()?;
    assert_eq!(pipeline.stage(), PipelineStage::DataLoaded);
    assert_eq!(pipeline.dataset().map(|d| d.num_samples()), Some(10));

    pipeline.build_model()?;
    assert_eq!(pipeline.stage(), PipelineStage::ModelBuilt);
    assert_eq!(pipeline.model().map(|m| m.num_decoder_tokens()), Some(5));

    pipeline.train()?;
    assert_eq!(pipeline.stage(), PipelineStage::Trained);
    assert!(pipeline.trained().is_some());

    let path = pipeline.export()?;
    assert_eq!(pipeline.stage(), PipelineStage::Exported);
    assert_eq!(pipeline.export_path(), Some(&path));
    Ok(())
}

#[test]
fn test_export_before_training_fails() -> Result<()> {
    let dir = tempdir()?;
    let store_root = dir.path().join("store");
    write_dataset_to_store(&store_root, BUCKET, &generate_test_dataset(10, (3, 4), (3, 5), 3)?)?;

    let mut pipeline = new_pipeline(&store_root, pipeline_config(dir.path(), 1, 4, 8));
    pipeline.load_data()?;
    pipeline.build_model()?;

    let failure = pipeline.export().unwrap_err();
    assert_eq!(failure.operation, "export");
    assert_eq!(failure.stage, PipelineStage::ModelBuilt);
    assert!(matches!(failure.source, PipelineError::ExportError(_)));
    assert_eq!(pipeline.stage(), PipelineStage::Failed);
    assert!(!dir.path().join("ml").join("model").exists());
    Ok(())
}

#[test]
fn test_missing_data_fails_while_loading() -> Result<()> {
    let dir = tempdir()?;
    let failure = new_pipeline(&dir.path().join("empty"), pipeline_config(dir.path(), 1, 4, 8))
        .run()
        .unwrap_err();

    assert_eq!(failure.operation, "load_data");
    assert_eq!(failure.stage, PipelineStage::Configured);
    assert!(matches!(failure.source, PipelineError::ResourceNotFound { .. }));
    Ok(())
}

#[test]
fn test_zero_latent_dim_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store_root = dir.path().join("store");
    write_dataset_to_store(&store_root, BUCKET, &generate_test_dataset(10, (3, 4), (3, 5), 4)?)?;

    let failure = new_pipeline(&store_root, pipeline_config(dir.path(), 1, 4, 0))
        .run()
        .unwrap_err();
    assert_eq!(failure.operation, "build_model");
    assert!(matches!(failure.source, PipelineError::InvalidConfig(_)));
    Ok(())
}

#[test]
fn test_bad_event_index_fails_before_training() -> Result<()> {
    let dir = tempdir()?;
    let store_root = dir.path().join("store");
    write_dataset_to_store(&store_root, BUCKET, &generate_test_dataset(20, (3, 4), (3, 5), 5)?)?;

    let mut config = pipeline_config(dir.path(), 3, 4, 8);
    config.event_index = Some(99);
    let checkpoint_path = config.training.checkpoint_path.clone();
    let mut pipeline = new_pipeline(&store_root, config);
    pipeline.load_data()?;

    let failure = pipeline.build_model().unwrap_err();
    assert_eq!(failure.operation, "build_model");
    assert_eq!(failure.stage, PipelineStage::DataLoaded);
    assert!(matches!(failure.source, PipelineError::ShapeMismatch(_)));
    assert_eq!(pipeline.stage(), PipelineStage::Failed);
    assert!(pipeline.trained().is_none());
    assert!(!checkpoint_path.exists());

    // The last valid index passes the same check
    let mut config = pipeline_config(dir.path(), 1, 4, 8);
    config.event_index = Some(4);
    let mut pipeline = new_pipeline(&store_root, config);
    pipeline.load_data()?;
    assert!(pipeline.build_model().is_ok());
    Ok(())
}

#[test]
fn test_out_of_order_stage_is_invalid_state() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = new_pipeline(&dir.path().join("store"), pipeline_config(dir.path(), 1, 4, 8));

    let failure = pipeline.train().unwrap_err();
    assert_eq!(failure.operation, "train");
    assert_eq!(failure.stage, PipelineStage::Configured);
    assert!(matches!(failure.source, PipelineError::InvalidState(_)));
    assert_eq!(pipeline.stage(), PipelineStage::Failed);

    // A failed pipeline accepts no further stage
    let failure = pipeline.load_data().unwrap_err();
    assert!(matches!(failure.source, PipelineError::InvalidState(_)));
    Ok(())
}
