// Remote storage layout
pub const DEFAULT_BUCKET: &str = "555360056434-sagemaker-us-east-1";
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const ENCODER_INPUT_KEY: &str = "train/train_encoder_input_data.npy";
pub const DECODER_INPUT_KEY: &str = "train/train_decoder_input_data.npy";
pub const DECODER_TARGET_KEY: &str = "train/train_decoder_target_data.npy";

// Model parameters
pub const LATENT_DIM: usize = 256; // Hidden units in both encoder and decoder
pub const FORGET_GATE_BIAS: f32 = 1.0;

// Training defaults
pub const DEFAULT_EPOCHS: usize = 10;
pub const DEFAULT_BATCH_SIZE: usize = 128;
pub const DEFAULT_LEARNING_RATE: f64 = 0.001;
pub const ADAM_EPSILON: f32 = 1e-7;
pub const VALIDATION_SPLIT_RATIO: f64 = 0.2; // 20% of samples held out for validation
pub const DEFAULT_SEED: u64 = 42;

// Serving signature
pub const ENCODER_INPUT_NAME: &str = "encoder_input_data";
pub const DECODER_INPUT_NAME: &str = "decoder_input_data";
pub const DECODER_OUTPUT_NAME: &str = "decoder_output";

// Model paths
pub const DEFAULT_MODEL_DIR: &str = "/opt/ml/model";
pub const MODEL_NAME_PREFIX: &str = "customer_event_prediction_lstm";
pub const CHECKPOINT_SUFFIX: &str = "_ckpt";
pub const DEFAULT_EXPORT_VERSION: u32 = 1;
pub const MANIFEST_FILE_NAME: &str = "saved_model.json";
pub const VARIABLES_DIR_NAME: &str = "variables";
pub const VARIABLES_FILE_NAME: &str = "variables";
pub const RUN_SUMMARY_FILE_NAME: &str = "run_summary.json";
