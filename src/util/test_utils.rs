// External imports
use anyhow::Result;
use ndarray::{s, Array3};
use ndarray_npy::WriteNpyExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

// Internal imports
use crate::constants::{DECODER_INPUT_KEY, DECODER_TARGET_KEY, ENCODER_INPUT_KEY};
use crate::seq2seq::step_1_dataset_provider::Seq2SeqDataset;

/// Random one-hot sequences, one active token per timestep
pub fn one_hot_sequences(
    rng: &mut StdRng,
    num_samples: usize,
    timesteps: usize,
    num_tokens: usize,
) -> Array3<f32> {
    let mut array = Array3::<f32>::zeros((num_samples, timesteps, num_tokens));
    for sample in 0..num_samples {
        for step in 0..timesteps {
            let token = rng.random_range(0..num_tokens);
            array[[sample, step, token]] = 1.0;
        }
    }
    array
}

/// Generate a synthetic event dataset
///
/// The decoder target is the decoder input shifted one step to the left, the
/// last target step is left as zero padding.
pub fn generate_test_dataset(
    num_samples: usize,
    encoder_shape: (usize, usize),
    decoder_shape: (usize, usize),
    seed: u64,
) -> Result<Seq2SeqDataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (encoder_timesteps, num_encoder_tokens) = encoder_shape;
    let (decoder_timesteps, num_decoder_tokens) = decoder_shape;

    let encoder_input =
        one_hot_sequences(&mut rng, num_samples, encoder_timesteps, num_encoder_tokens);
    let decoder_input =
        one_hot_sequences(&mut rng, num_samples, decoder_timesteps, num_decoder_tokens);

    let mut decoder_target = Array3::<f32>::zeros(decoder_input.raw_dim());
    if decoder_timesteps > 1 {
        decoder_target
            .slice_mut(s![.., ..decoder_timesteps - 1, ..])
            .assign(&decoder_input.slice(s![.., 1.., ..]));
    }

    Ok(Seq2SeqDataset::new(encoder_input, decoder_input, decoder_target)?)
}

/// Write one array as `.npy`, creating parent directories
pub fn write_npy_file(path: &Path, array: &Array3<f32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    array.write_npy(writer)?;
    Ok(())
}

/// Lay the dataset out as `<root>/<bucket>/<key>` for a `LocalObjectStore`
pub fn write_dataset_to_store(root: &Path, bucket: &str, dataset: &Seq2SeqDataset) -> Result<()> {
    let bucket_dir = root.join(bucket);
    write_npy_file(&bucket_dir.join(ENCODER_INPUT_KEY), dataset.encoder_input())?;
    write_npy_file(&bucket_dir.join(DECODER_INPUT_KEY), dataset.decoder_input())?;
    write_npy_file(&bucket_dir.join(DECODER_TARGET_KEY), dataset.decoder_target())?;
    Ok(())
}
