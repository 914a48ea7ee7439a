// External imports
use burn::module::Module;
use burn::nn::Linear;
use burn::tensor::{activation, backend::Backend, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

// Internal imports
use super::step_1_dataset_provider::Seq2SeqDataset;
use super::step_2_lstm_cell::{glorot_linear, LstmState, LSTM};
use crate::constants::{DECODER_INPUT_NAME, DECODER_OUTPUT_NAME, ENCODER_INPUT_NAME};
use crate::error::{PipelineError, Result};

/// Sizes needed to build a [`Seq2SeqModel`].
///
/// Token counts are never configured by hand; they come from the tensors
/// the model will be trained on (see [`Seq2SeqConfig::from_dataset`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    pub num_encoder_tokens: usize,
    pub num_decoder_tokens: usize,
    pub latent_dim: usize,
}

impl Seq2SeqConfig {
    pub fn new(num_encoder_tokens: usize, num_decoder_tokens: usize, latent_dim: usize) -> Self {
        Self {
            num_encoder_tokens,
            num_decoder_tokens,
            latent_dim,
        }
    }

    /// Derive the vocabulary sizes from the last axis of the loaded tensors
    pub fn from_dataset(dataset: &Seq2SeqDataset, latent_dim: usize) -> Self {
        Self::new(
            dataset.num_encoder_tokens(),
            dataset.num_decoder_tokens(),
            latent_dim,
        )
    }

    /// Fail if `dataset` was encoded with different vocabularies than this config.
    pub fn check_dataset(&self, dataset: &Seq2SeqDataset) -> Result<()> {
        if dataset.num_encoder_tokens() != self.num_encoder_tokens
            || dataset.num_decoder_tokens() != self.num_decoder_tokens
        {
            return Err(PipelineError::ShapeMismatch(format!(
                "model expects {} encoder / {} decoder tokens, data has {} / {}",
                self.num_encoder_tokens,
                self.num_decoder_tokens,
                dataset.num_encoder_tokens(),
                dataset.num_decoder_tokens()
            )));
        }
        Ok(())
    }

    /// Initialize a model from this configuration
    ///
    /// # Arguments
    ///
    /// * `seed` - Seed for the weight initialization
    /// * `device` - Device to place tensors on
    pub fn init<B: Backend>(&self, seed: u64, device: &B::Device) -> Seq2SeqModel<B> {
        Seq2SeqModel::new(self, seed, device)
    }

    /// Ordered layer description, shared by `summary` and the exported graph
    pub fn layers(&self) -> Vec<LayerSummary> {
        let latent = self.latent_dim;
        vec![
            LayerSummary::new(
                ENCODER_INPUT_NAME,
                "InputLayer",
                vec![None, None, Some(self.num_encoder_tokens)],
                0,
            ),
            LayerSummary::new(
                DECODER_INPUT_NAME,
                "InputLayer",
                vec![None, None, Some(self.num_decoder_tokens)],
                0,
            ),
            LayerSummary::new(
                "encoder_lstm",
                "LSTM",
                vec![None, Some(latent)],
                4 * latent * (self.num_encoder_tokens + latent + 1),
            ),
            LayerSummary::new(
                "decoder_lstm",
                "LSTM",
                vec![None, None, Some(latent)],
                4 * latent * (self.num_decoder_tokens + latent + 1),
            ),
            LayerSummary::new(
                "decoder_dense",
                "Dense(softmax)",
                vec![None, None, Some(self.num_decoder_tokens)],
                latent * self.num_decoder_tokens + self.num_decoder_tokens,
            ),
        ]
    }
}

/// One row of the model summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub kind: String,
    /// `None` marks a dimension fixed only at call time (batch, timesteps)
    pub output_shape: Vec<Option<usize>>,
    pub params: usize,
}

impl LayerSummary {
    fn new(name: &str, kind: &str, output_shape: Vec<Option<usize>>, params: usize) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            output_shape,
            params,
        }
    }
}

/// Name, shape and dtype of one tensor in the serving interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<Option<usize>>,
    pub dtype: String,
}

/// Named inputs and outputs of the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    pub inputs: BTreeMap<String, TensorSpec>,
    pub outputs: BTreeMap<String, TensorSpec>,
}

impl ModelSignature {
    /// The two-input / one-output signature of a model built from `config`.
    pub fn for_config(config: &Seq2SeqConfig) -> Self {
        let spec = |name: &str, tokens: usize| TensorSpec {
            name: name.to_string(),
            shape: vec![None, None, Some(tokens)],
            dtype: "float32".to_string(),
        };

        let inputs = BTreeMap::from([
            (
                ENCODER_INPUT_NAME.to_string(),
                spec(ENCODER_INPUT_NAME, config.num_encoder_tokens),
            ),
            (
                DECODER_INPUT_NAME.to_string(),
                spec(DECODER_INPUT_NAME, config.num_decoder_tokens),
            ),
        ]);
        let outputs = BTreeMap::from([(
            DECODER_OUTPUT_NAME.to_string(),
            spec(DECODER_OUTPUT_NAME, config.num_decoder_tokens),
        )]);

        Self { inputs, outputs }
    }
}

/// Encoder-decoder LSTM predicting the next sequence of customer events
#[derive(Module, Debug)]
pub struct Seq2SeqModel<B: Backend> {
    encoder: LSTM<B>,
    decoder: LSTM<B>,
    decoder_dense: Linear<B>,
}

impl<B: Backend> Seq2SeqModel<B> {
    /// Create a new model
    ///
    /// # Arguments
    ///
    /// * `config` - Vocabulary sizes and latent dimension
    /// * `seed` - Seed for the weight initialization
    /// * `device` - Device to place tensors on
    pub fn new(config: &Seq2SeqConfig, seed: u64, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let encoder = LSTM::new(config.num_encoder_tokens, config.latent_dim, &mut rng, device);
        let decoder = LSTM::new(config.num_decoder_tokens, config.latent_dim, &mut rng, device);
        let decoder_dense = glorot_linear(
            config.latent_dim,
            config.num_decoder_tokens,
            Some(vec![0.0; config.num_decoder_tokens]),
            &mut rng,
            device,
        );

        Self {
            encoder,
            decoder,
            decoder_dense,
        }
    }

    /// Encoder input width of the built weights
    pub fn num_encoder_tokens(&self) -> usize {
        self.encoder.input_size()
    }

    /// Decoder input width of the built weights
    pub fn num_decoder_tokens(&self) -> usize {
        self.decoder.input_size()
    }

    pub fn latent_dim(&self) -> usize {
        self.encoder.hidden_size()
    }

    /// Configuration reconstructed from the layer shapes
    pub fn config(&self) -> Seq2SeqConfig {
        Seq2SeqConfig::new(
            self.num_encoder_tokens(),
            self.num_decoder_tokens(),
            self.latent_dim(),
        )
    }

    pub fn signature(&self) -> ModelSignature {
        ModelSignature::for_config(&self.config())
    }

    /// Compress the encoder input into the final (hidden, cell) state.
    /// Per-step encoder outputs are never materialized.
    pub fn encode(&self, encoder_input: Tensor<B, 3>) -> LstmState<B> {
        self.encoder.forward_final(encoder_input, None)
    }

    /// Pre-softmax scores of shape [batch_size, decoder_timesteps, num_decoder_tokens]
    pub fn forward_logits(
        &self,
        encoder_input: Tensor<B, 3>,
        decoder_input: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let state = self.encode(encoder_input);
        let (sequence, _) = self.decoder.forward_sequence(decoder_input, Some(state));
        self.decoder_dense.forward(sequence)
    }

    /// Forward pass: one probability distribution over the decoder vocabulary per timestep
    pub fn forward(&self, encoder_input: Tensor<B, 3>, decoder_input: Tensor<B, 3>) -> Tensor<B, 3> {
        activation::softmax(self.forward_logits(encoder_input, decoder_input), 2)
    }

    /// Categorical cross-entropy of the model output against `decoder_target`
    pub fn loss(
        &self,
        encoder_input: Tensor<B, 3>,
        decoder_input: Tensor<B, 3>,
        decoder_target: Tensor<B, 3>,
    ) -> Tensor<B, 1> {
        categorical_cross_entropy(self.forward_logits(encoder_input, decoder_input), decoder_target)
    }

    /// Keras-style layer table
    pub fn summary(&self) -> String {
        let layers = self.config().layers();
        let mut out = String::new();

        let _ = writeln!(out, "{:<34}{:<22}{:>12}", "Layer (type)", "Output Shape", "Param #");
        let _ = writeln!(out, "{}", "=".repeat(68));
        for layer in &layers {
            let _ = writeln!(
                out,
                "{:<34}{:<22}{:>12}",
                format!("{} ({})", layer.name, layer.kind),
                format_shape(&layer.output_shape),
                layer.params
            );
        }
        let _ = writeln!(out, "{}", "=".repeat(68));
        let total: usize = layers.iter().map(|layer| layer.params).sum();
        let _ = write!(out, "Total params: {}", total);
        out
    }
}

/// Mean over samples and timesteps of `-sum(target * log(softmax(logits)))`.
///
/// All-zero target rows (padding) contribute nothing to the sum.
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 3>,
    targets: Tensor<B, 3>,
) -> Tensor<B, 1> {
    let log_probs = activation::log_softmax(logits, 2);
    (targets * log_probs).sum_dim(2).neg().mean()
}

fn format_shape(shape: &[Option<usize>]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|dim| match dim {
            Some(size) => size.to_string(),
            None => "None".to_string(),
        })
        .collect();
    format!("({})", dims.join(", "))
}
