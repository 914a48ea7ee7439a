use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use super::step_3_seq2seq_model_arch::{LayerSummary, ModelSignature, Seq2SeqConfig, Seq2SeqModel};
use super::step_4_train_model::TrainedSeq2Seq;
use crate::built_info;
use crate::constants::{
    DECODER_INPUT_NAME, DECODER_OUTPUT_NAME, ENCODER_INPUT_NAME, MANIFEST_FILE_NAME,
    RUN_SUMMARY_FILE_NAME, VARIABLES_DIR_NAME, VARIABLES_FILE_NAME,
};
use crate::error::{PipelineError, Result};
use crate::util::model_logger::TrainingRun;
use crate::util::model_utils;

const EXPORT_FORMAT_VERSION: u32 = 1;

/// Description of an exported model, stored as `saved_model.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub format_version: u32,
    pub signature: ModelSignature,
    /// Layers in execution order
    pub graph: Vec<LayerSummary>,
    pub config: Seq2SeqConfig,
    pub crate_version: String,
    pub rustc_version: String,
    pub target: String,
    pub exported_at: String,
}

impl ExportManifest {
    pub fn new(config: &Seq2SeqConfig) -> Self {
        Self {
            format_version: EXPORT_FORMAT_VERSION,
            signature: ModelSignature::for_config(config),
            graph: config.layers(),
            config: *config,
            crate_version: built_info::PKG_VERSION.to_string(),
            rustc_version: built_info::RUSTC_VERSION.to_string(),
            target: built_info::TARGET.to_string(),
            exported_at: Utc::now().to_rfc3339(),
        }
    }
}

fn export_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::ExportError(e.to_string())
}

fn weights_path(dir: &Path) -> PathBuf {
    dir.join(VARIABLES_DIR_NAME)
        .join(VARIABLES_FILE_NAME)
        .with_extension("bin")
}

/// Execution context for one export.
///
/// Files are written into a private staging directory next to the target and
/// only become visible under the target path on [`ExportSession::commit`].
/// Dropping a session without committing removes everything it staged.
pub struct ExportSession<'a, B: Backend> {
    device: &'a B::Device,
    staging: TempDir,
    target: PathBuf,
}

impl<'a, B: Backend> ExportSession<'a, B> {
    /// Open a session that will publish to `target`
    pub fn open(target: &Path, device: &'a B::Device) -> Result<Self> {
        if target.exists() {
            return Err(PipelineError::ExportError(format!(
                "{} already exists",
                target.display()
            )));
        }
        let parent = target.parent().ok_or_else(|| {
            PipelineError::ExportError(format!("{} has no parent directory", target.display()))
        })?;
        fs::create_dir_all(parent).map_err(export_error)?;

        let staging = tempfile::Builder::new()
            .prefix(".export-")
            .tempdir_in(parent)
            .map_err(export_error)?;

        Ok(Self {
            device,
            staging,
            target: target.to_path_buf(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    /// Write weights and manifest, then read them back to make sure the
    /// staged artifact is loadable.
    pub fn write_model(&self, model: &Seq2SeqModel<B>) -> Result<ExportManifest> {
        let weights = weights_path(self.staging_dir());
        if let Some(parent) = weights.parent() {
            fs::create_dir_all(parent).map_err(export_error)?;
        }
        model
            .clone()
            .save_file::<BinFileRecorder<FullPrecisionSettings>, _>(&weights, &Default::default())
            .map_err(export_error)?;

        let manifest = ExportManifest::new(&model.config());
        let manifest_json = serde_json::to_string_pretty(&manifest).map_err(export_error)?;
        fs::write(self.staging_dir().join(MANIFEST_FILE_NAME), manifest_json)
            .map_err(export_error)?;

        let (_, reloaded) = load_exported_model::<B>(self.staging_dir(), self.device)?;
        if reloaded.config != manifest.config {
            return Err(PipelineError::ExportError(
                "staged model does not match the trained configuration".to_string(),
            ));
        }
        Ok(manifest)
    }

    pub fn write_run_summary(&self, run: &TrainingRun) -> Result<()> {
        run.save(&self.staging_dir().join(RUN_SUMMARY_FILE_NAME))
            .map_err(export_error)?;
        Ok(())
    }

    /// Publish the staged directory under the target path
    pub fn commit(self) -> Result<PathBuf> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.staging_dir(), fs::Permissions::from_mode(0o755))
                .map_err(export_error)?;
        }

        fs::rename(self.staging_dir(), &self.target).map_err(export_error)?;
        // `staging` drops here; its path is gone, so nothing else is removed
        Ok(self.target)
    }
}

/// Export a trained model for serving
///
/// # Arguments
///
/// * `trained` - Output of the training loop
/// * `model_dir` - Base model directory
/// * `version` - Version segment, the model lands in `<model_dir>/model/<version>`
/// * `device` - Device used to verify the staged artifact
///
/// # Returns
///
/// Path of the published export directory
pub fn export_model<B: Backend>(
    trained: &TrainedSeq2Seq<B>,
    model_dir: &Path,
    version: u32,
    device: &B::Device,
) -> Result<PathBuf> {
    let target = model_utils::export_path(model_dir, version);
    info!("Exporting model to {}", target.display());

    let session = ExportSession::<B>::open(&target, device)?;
    let manifest = session.write_model(trained.model())?;
    session.write_run_summary(&TrainingRun::from_trained(trained))?;
    let path = session.commit()?;

    info!(
        "Exported signature inputs {:?} -> outputs {:?}",
        manifest.signature.inputs.keys().collect::<Vec<_>>(),
        manifest.signature.outputs.keys().collect::<Vec<_>>()
    );
    Ok(path)
}

/// Load an exported model together with its manifest
pub fn load_exported_model<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> Result<(Seq2SeqModel<B>, ExportManifest)> {
    let manifest_json = fs::read_to_string(dir.join(MANIFEST_FILE_NAME)).map_err(export_error)?;
    let manifest: ExportManifest = serde_json::from_str(&manifest_json).map_err(export_error)?;

    if manifest.format_version != EXPORT_FORMAT_VERSION {
        return Err(PipelineError::ExportError(format!(
            "unsupported export format {}",
            manifest.format_version
        )));
    }
    let signature = &manifest.signature;
    if !signature.inputs.contains_key(ENCODER_INPUT_NAME)
        || !signature.inputs.contains_key(DECODER_INPUT_NAME)
        || !signature.outputs.contains_key(DECODER_OUTPUT_NAME)
    {
        return Err(PipelineError::ExportError(
            "manifest signature is missing required tensors".to_string(),
        ));
    }

    // Seed is irrelevant, every parameter is overwritten from disk
    let model = manifest
        .config
        .init::<B>(0, device)
        .load_file::<BinFileRecorder<FullPrecisionSettings>, _>(
            weights_path(dir),
            &Default::default(),
            device,
        )
        .map_err(export_error)?;

    Ok((model, manifest))
}
