// External imports
use burn::tensor::{backend::Backend, Tensor, TensorData};
use log::{debug, info};
use ndarray::{s, Array3, Axis};
use ndarray_npy::{ReadNpyError, ReadNpyExt, ReadableElement};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;

// Internal imports
use crate::constants::{DECODER_INPUT_KEY, DECODER_TARGET_KEY, ENCODER_INPUT_KEY};
use crate::error::{PipelineError, Result};

/// Durable storage holding the pre-encoded training tensors.
pub trait ObjectStore {
    /// Copy the object at `bucket/key` into the local file `dest`.
    fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;

    /// Human readable location used in log lines
    fn describe(&self) -> String;
}

/// Object store reached over plain HTTP(S) using path-style URLs
/// (`<endpoint>/<bucket>/<key>`).
///
/// Requests are not signed. The endpoint must serve the objects publicly, be a
/// presigning gateway, or accept the bearer token set with
/// [`HttpObjectStore::with_bearer_token`]. A private bucket answers 403, which
/// surfaces as `StorageUnavailable`.
pub struct HttpObjectStore {
    endpoint: String,
    client: reqwest::blocking::Client,
    bearer_token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        // Large tensors can take a while, the fetch blocks until done or failed
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| PipelineError::StorageUnavailable {
                key: "<client>".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::with_client(endpoint, client))
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots, timeouts)
    pub fn with_client(endpoint: impl Into<String>, client: reqwest::blocking::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            bearer_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Build the URL of an object
    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            bucket,
            key.trim_start_matches('/')
        )
    }
}

impl ObjectStore for HttpObjectStore {
    fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let url = self.object_url(bucket, key);
        debug!("GET {}", url);

        let unavailable = |reason: String| PipelineError::StorageUnavailable {
            key: key.to_string(),
            reason,
        };

        let mut request = self.client.get(&url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PipelineError::ResourceNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(unavailable(format!("HTTP {}", status)));
        }

        let mut file = File::create(dest)?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| unavailable(e.to_string()))?;
        debug!("Downloaded {} bytes from {}", bytes, url);
        Ok(())
    }

    fn describe(&self) -> String {
        self.endpoint.clone()
    }
}

/// Object store backed by a local directory laid out as `<root>/<bucket>/<key>`.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ObjectStore for LocalObjectStore {
    fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let source = self.root.join(bucket).join(key);
        if !source.is_file() {
            return Err(PipelineError::ResourceNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        fs::copy(&source, dest).map_err(|e| PipelineError::StorageUnavailable {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Read `path` as an array of `T`, `None` when the file stores another dtype
fn try_read_npy<T: ReadableElement>(path: &Path, key: &str) -> Result<Option<Array3<T>>> {
    let reader = BufReader::new(File::open(path)?);
    match Array3::<T>::read_npy(reader) {
        Ok(array) => Ok(Some(array)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(PipelineError::TensorDecode {
            key: key.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Decode a rank-3 `.npy` file into `f32`.
///
/// Float (`f4`, `f8`), integer (`u1`, `i4`, `i8`) and bool payloads are
/// accepted and cast element-wise; the shape is kept as stored.
pub fn read_npy_tensor(path: &Path, key: &str) -> Result<Array3<f32>> {
    if let Some(array) = try_read_npy::<f32>(path, key)? {
        return Ok(array);
    }
    if let Some(array) = try_read_npy::<f64>(path, key)? {
        return Ok(array.mapv(|v| v as f32));
    }
    if let Some(array) = try_read_npy::<u8>(path, key)? {
        return Ok(array.mapv(f32::from));
    }
    if let Some(array) = try_read_npy::<i32>(path, key)? {
        return Ok(array.mapv(|v| v as f32));
    }
    if let Some(array) = try_read_npy::<i64>(path, key)? {
        return Ok(array.mapv(|v| v as f32));
    }
    if let Some(array) = try_read_npy::<bool>(path, key)? {
        return Ok(array.mapv(|v| if v { 1.0 } else { 0.0 }));
    }

    Err(PipelineError::TensorDecode {
        key: key.to_string(),
        reason: "unsupported element type, expected float, integer or bool".to_string(),
    })
}

/// Fetches the named training tensors from an [`ObjectStore`].
pub struct DatasetProvider {
    store: Box<dyn ObjectStore>,
    bucket: String,
}

impl DatasetProvider {
    pub fn new(store: Box<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Retrieve one tensor, going through a temporary local copy.
    ///
    /// # Arguments
    ///
    /// * `key` - Object key under the provider's bucket
    ///
    /// # Returns
    ///
    /// The array exactly as stored (dtype widened or narrowed to `f32` only)
    pub fn fetch_tensor(&self, key: &str) -> Result<Array3<f32>> {
        info!(
            "Fetching {}/{} from {}",
            self.bucket,
            key,
            self.store.describe()
        );

        // Removed when `local_copy` drops
        let local_copy = NamedTempFile::new()?;
        self.store.download_to(&self.bucket, key, local_copy.path())?;

        let array = read_npy_tensor(local_copy.path(), key)?;
        info!("Loaded {} with shape {:?}", key, array.shape());
        Ok(array)
    }

    /// Retrieve the encoder input, decoder input and decoder target tensors.
    pub fn load_training_set(&self) -> Result<Seq2SeqDataset> {
        let encoder_input = self.fetch_tensor(ENCODER_INPUT_KEY)?;
        let decoder_input = self.fetch_tensor(DECODER_INPUT_KEY)?;
        let decoder_target = self.fetch_tensor(DECODER_TARGET_KEY)?;
        Seq2SeqDataset::new(encoder_input, decoder_input, decoder_target)
    }
}

/// The three sample-aligned training tensors.
#[derive(Debug, Clone)]
pub struct Seq2SeqDataset {
    encoder_input: Array3<f32>,
    decoder_input: Array3<f32>,
    decoder_target: Array3<f32>,
}

/// One mini-batch materialized on a device.
#[derive(Debug, Clone)]
pub struct Seq2SeqBatch<B: Backend> {
    /// Shape [batch_size, encoder_timesteps, num_encoder_tokens]
    pub encoder_input: Tensor<B, 3>,
    /// Shape [batch_size, decoder_timesteps, num_decoder_tokens]
    pub decoder_input: Tensor<B, 3>,
    /// Same shape as `decoder_input`
    pub decoder_target: Tensor<B, 3>,
}

impl Seq2SeqDataset {
    /// Assemble a dataset, rejecting tensors that are not sample-aligned.
    pub fn new(
        encoder_input: Array3<f32>,
        decoder_input: Array3<f32>,
        decoder_target: Array3<f32>,
    ) -> Result<Self> {
        let enc = encoder_input.shape();
        let dec_in = decoder_input.shape();
        let dec_tgt = decoder_target.shape();

        if enc[0] != dec_in[0] || enc[0] != dec_tgt[0] {
            return Err(PipelineError::ShapeMismatch(format!(
                "sample counts differ: encoder input {}, decoder input {}, decoder target {}",
                enc[0], dec_in[0], dec_tgt[0]
            )));
        }
        if dec_in != dec_tgt {
            return Err(PipelineError::ShapeMismatch(format!(
                "decoder input {:?} and decoder target {:?} must have the same shape",
                dec_in, dec_tgt
            )));
        }
        if enc.contains(&0) || dec_in.contains(&0) {
            return Err(PipelineError::ShapeMismatch(format!(
                "empty axis in encoder input {:?} or decoder input {:?}",
                enc, dec_in
            )));
        }

        Ok(Self {
            encoder_input,
            decoder_input,
            decoder_target,
        })
    }

    pub fn num_samples(&self) -> usize {
        self.encoder_input.shape()[0]
    }

    pub fn encoder_timesteps(&self) -> usize {
        self.encoder_input.shape()[1]
    }

    pub fn decoder_timesteps(&self) -> usize {
        self.decoder_input.shape()[1]
    }

    /// Encoder vocabulary size, read off the last tensor axis
    pub fn num_encoder_tokens(&self) -> usize {
        self.encoder_input.shape()[2]
    }

    /// Decoder vocabulary size, read off the last tensor axis
    pub fn num_decoder_tokens(&self) -> usize {
        self.decoder_input.shape()[2]
    }

    pub fn encoder_input(&self) -> &Array3<f32> {
        &self.encoder_input
    }

    pub fn decoder_input(&self) -> &Array3<f32> {
        &self.decoder_input
    }

    pub fn decoder_target(&self) -> &Array3<f32> {
        &self.decoder_target
    }

    /// Split off the last `validation_split` fraction of samples.
    ///
    /// Samples are not shuffled before the split, so the held-out set is
    /// always the tail of the dataset.
    pub fn split_validation(&self, validation_split: f64) -> Result<(Self, Self)> {
        let num_samples = self.num_samples();
        let split_at = (num_samples as f64 * (1.0 - validation_split)).floor() as usize;

        if split_at == 0 || split_at >= num_samples {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} samples cannot be split into non-empty training and validation sets (split {})",
                num_samples, validation_split
            )));
        }

        let head = Self {
            encoder_input: self.encoder_input.slice(s![..split_at, .., ..]).to_owned(),
            decoder_input: self.decoder_input.slice(s![..split_at, .., ..]).to_owned(),
            decoder_target: self.decoder_target.slice(s![..split_at, .., ..]).to_owned(),
        };
        let tail = Self {
            encoder_input: self.encoder_input.slice(s![split_at.., .., ..]).to_owned(),
            decoder_input: self.decoder_input.slice(s![split_at.., .., ..]).to_owned(),
            decoder_target: self.decoder_target.slice(s![split_at.., .., ..]).to_owned(),
        };
        Ok((head, tail))
    }

    /// Gather the given samples into a batch on `device`.
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Seq2SeqBatch<B> {
        Seq2SeqBatch {
            encoder_input: array_to_tensor(&self.encoder_input.select(Axis(0), indices), device),
            decoder_input: array_to_tensor(&self.decoder_input.select(Axis(0), indices), device),
            decoder_target: array_to_tensor(&self.decoder_target.select(Axis(0), indices), device),
        }
    }

    /// Consecutive index windows of at most `batch_size` samples.
    pub fn batch_ranges(&self, batch_size: usize) -> Vec<Vec<usize>> {
        (0..self.num_samples())
            .collect::<Vec<_>>()
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

/// Copy an ndarray into a Burn tensor of the same shape
pub fn array_to_tensor<B: Backend>(array: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let shape = array.shape().to_vec();
    let values: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, shape), device)
}
