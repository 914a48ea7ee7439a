// External imports
use burn::tensor::{backend::Backend, Tensor};

// Internal imports
use super::step_1_dataset_provider::Seq2SeqDataset;
use super::step_3_seq2seq_model_arch::Seq2SeqModel;
use crate::error::{PipelineError, Result};

/// Probability assigned to `event_index` at every decoder step.
///
/// The decoder is driven by `decoder_input` (teacher forcing), so this is a
/// single forward pass rather than a step-by-step generation loop.
///
/// # Returns
///
/// Tensor of shape [batch_size, decoder_timesteps]
pub fn event_step_probabilities<B: Backend>(
    model: &Seq2SeqModel<B>,
    encoder_input: Tensor<B, 3>,
    decoder_input: Tensor<B, 3>,
    event_index: usize,
) -> Result<Tensor<B, 2>> {
    let num_tokens = model.num_decoder_tokens();
    if event_index >= num_tokens {
        return Err(PipelineError::ShapeMismatch(format!(
            "event index {} outside decoder vocabulary of {} tokens",
            event_index, num_tokens
        )));
    }

    let probabilities = model.forward(encoder_input, decoder_input);
    let [batch_size, steps, _] = probabilities.dims();
    Ok(probabilities
        .narrow(2, event_index, 1)
        .reshape([batch_size, steps]))
}

/// Per-sample probability that the event shows up at least once in the
/// predicted continuation, `1 - prod_t (1 - p_t)`.
///
/// # Returns
///
/// Tensor of shape [batch_size]
pub fn event_likelihood<B: Backend>(
    model: &Seq2SeqModel<B>,
    encoder_input: Tensor<B, 3>,
    decoder_input: Tensor<B, 3>,
    event_index: usize,
) -> Result<Tensor<B, 1>> {
    let steps = event_step_probabilities(model, encoder_input, decoder_input, event_index)?;
    let [batch_size, _] = steps.dims();

    // Product taken in log space
    let log_miss = steps
        .neg()
        .add_scalar(1.0)
        .clamp_min(1e-12)
        .log()
        .sum_dim(1);
    Ok(log_miss.exp().neg().add_scalar(1.0).reshape([batch_size]))
}

/// [`event_likelihood`] over a whole dataset, batch by batch.
pub fn dataset_event_likelihood<B: Backend>(
    model: &Seq2SeqModel<B>,
    dataset: &Seq2SeqDataset,
    event_index: usize,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<f32>> {
    let mut likelihoods = Vec::with_capacity(dataset.num_samples());
    for indices in dataset.batch_ranges(batch_size) {
        let batch = dataset.batch::<B>(&indices, device);
        let values = event_likelihood(model, batch.encoder_input, batch.decoder_input, event_index)?
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| PipelineError::TensorDecode {
                key: "event_likelihood".to_string(),
                reason: format!("{:?}", e),
            })?;
        likelihoods.extend(values);
    }
    Ok(likelihoods)
}
