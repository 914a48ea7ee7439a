/// Test modules for the customer event sequence model
///
/// * `test_dataset_provider` - Object store access, tensor decoding and dataset alignment
/// * `test_seq2seq_model` - Shape contract, parameter counts and the loss function
/// * `test_train_model` - Training loop, checkpointing and divergence handling
/// * `test_model_export` - Export layout, reload and event likelihood scoring
/// * `test_pipeline` - Stage ordering and end-to-end runs
pub mod test_dataset_provider;
pub mod test_pipeline;
