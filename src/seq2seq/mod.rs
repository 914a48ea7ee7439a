/// # Sequence-to-Sequence Module
///
/// Encoder-decoder LSTM that reads a past sequence of customer events and
/// learns to emit the sequence that follows it.
///
/// ## Module Structure:
///
/// 1. **step_1_dataset_provider**: Fetches the three aligned training tensors from object storage
/// 2. **step_2_lstm_cell**: LSTM layer with explicit initial state
/// 3. **step_3_seq2seq_model_arch**: Encoder, decoder and per-timestep softmax projection
/// 4. **step_4_train_model**: Training loop with validation split and best-model checkpoints
/// 5. **step_5_event_likelihood**: Likelihood of a given event in the predicted continuation
/// 6. **step_6_model_export**: Versioned export for a serving process
///
pub mod step_1_dataset_provider;
pub mod step_2_lstm_cell;
pub mod step_3_seq2seq_model_arch;
pub mod step_4_train_model;
pub mod step_5_event_likelihood;
pub mod step_6_model_export;
