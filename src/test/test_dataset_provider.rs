// External imports
use anyhow::Result;
use ndarray::{s, Array3};
use ndarray_npy::{WritableElement, WriteNpyExt};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread::{self, JoinHandle};
use tempfile::tempdir;

// Internal imports
use crate::constants::{DECODER_INPUT_KEY, ENCODER_INPUT_KEY};
use crate::error::PipelineError;
use crate::seq2seq::step_1_dataset_provider::{
    read_npy_tensor, DatasetProvider, HttpObjectStore, LocalObjectStore, ObjectStore,
    Seq2SeqDataset,
};
use crate::util::test_utils::{generate_test_dataset, write_dataset_to_store};

const BUCKET: &str = "test-bucket";

/// Answer a single HTTP request on a loopback port with `status` and `body`.
///
/// The join handle yields the raw request head that was received.
fn serve_once(status: &'static str, body: Vec<u8>) -> Result<(String, JoinHandle<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let endpoint = format!("http://{}", listener.local_addr()?);

    let handle = thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return String::new();
        };
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        let head = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status,
            body.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(&body);
        String::from_utf8_lossy(&request).into_owned()
    });
    Ok((endpoint, handle))
}

/// Loopback requests must not be routed through a proxy from the environment
fn loopback_store(endpoint: &str) -> Result<HttpObjectStore> {
    let client = reqwest::blocking::Client::builder().no_proxy().build()?;
    Ok(HttpObjectStore::with_client(endpoint, client))
}

/// Store whose backend is always down
struct UnreachableStore;

impl ObjectStore for UnreachableStore {
    fn download_to(&self, _bucket: &str, key: &str, _dest: &Path) -> crate::error::Result<()> {
        Err(PipelineError::StorageUnavailable {
            key: key.to_string(),
            reason: "connection refused".to_string(),
        })
    }

    fn describe(&self) -> String {
        "unreachable".to_string()
    }
}

#[test]
fn test_load_training_set_from_local_store() -> Result<()> {
    let root = tempdir()?;
    let dataset = generate_test_dataset(12, (6, 9), (4, 7), 1)?;
    write_dataset_to_store(root.path(), BUCKET, &dataset)?;

    let provider = DatasetProvider::new(Box::new(LocalObjectStore::new(root.path())), BUCKET);
    let loaded = provider.load_training_set()?;

    assert_eq!(loaded.num_samples(), 12);
    assert_eq!(loaded.encoder_timesteps(), 6);
    assert_eq!(loaded.num_encoder_tokens(), 9);
    assert_eq!(loaded.decoder_timesteps(), 4);
    assert_eq!(loaded.num_decoder_tokens(), 7);
    assert_eq!(loaded.encoder_input(), dataset.encoder_input());
    assert_eq!(loaded.decoder_input(), dataset.decoder_input());
    assert_eq!(loaded.decoder_target(), dataset.decoder_target());
    Ok(())
}

#[test]
fn test_missing_object_is_resource_not_found() -> Result<()> {
    let root = tempdir()?;
    let provider = DatasetProvider::new(Box::new(LocalObjectStore::new(root.path())), BUCKET);

    match provider.load_training_set() {
        Err(PipelineError::ResourceNotFound { bucket, key }) => {
            assert_eq!(bucket, BUCKET);
            assert_eq!(key, ENCODER_INPUT_KEY);
        }
        other => panic!("expected ResourceNotFound, got {:?}", other.map(|d| d.num_samples())),
    }
    Ok(())
}

#[test]
fn test_partial_upload_reports_missing_key() -> Result<()> {
    let root = tempdir()?;
    let dataset = generate_test_dataset(4, (3, 5), (3, 5), 2)?;
    write_dataset_to_store(root.path(), BUCKET, &dataset)?;
    std::fs::remove_file(root.path().join(BUCKET).join(DECODER_INPUT_KEY))?;

    let provider = DatasetProvider::new(Box::new(LocalObjectStore::new(root.path())), BUCKET);
    let result = provider.load_training_set();
    assert!(matches!(
        result,
        Err(PipelineError::ResourceNotFound { ref key, .. }) if key == DECODER_INPUT_KEY
    ));
    Ok(())
}

#[test]
fn test_unreachable_store_is_storage_unavailable() {
    let provider = DatasetProvider::new(Box::new(UnreachableStore), BUCKET);
    let result = provider.fetch_tensor(ENCODER_INPUT_KEY);
    assert!(matches!(result, Err(PipelineError::StorageUnavailable { .. })));
}

#[test]
fn test_f64_payload_is_narrowed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("wide.npy");
    let wide = Array3::<f64>::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64 * 0.5);
    wide.write_npy(BufWriter::new(File::create(&path)?))?;

    let narrowed = read_npy_tensor(&path, "wide.npy")?;
    assert_eq!(narrowed.shape(), &[2, 3, 4]);
    assert_eq!(narrowed[[1, 2, 3]], 11.5);
    Ok(())
}

#[test]
fn test_corrupt_payload_is_decode_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("corrupt.npy");
    std::fs::write(&path, b"definitely not numpy")?;

    let result = read_npy_tensor(&path, "corrupt.npy");
    assert!(matches!(result, Err(PipelineError::TensorDecode { ref key, .. }) if key == "corrupt.npy"));
    Ok(())
}

#[test]
fn test_mismatched_sample_counts() {
    let result = Seq2SeqDataset::new(
        Array3::zeros((10, 4, 5)),
        Array3::zeros((9, 3, 6)),
        Array3::zeros((9, 3, 6)),
    );
    assert!(matches!(result, Err(PipelineError::ShapeMismatch(_))));
}

#[test]
fn test_decoder_input_and_target_must_agree() {
    let result = Seq2SeqDataset::new(
        Array3::zeros((10, 4, 5)),
        Array3::zeros((10, 3, 6)),
        Array3::zeros((10, 3, 7)),
    );
    assert!(matches!(result, Err(PipelineError::ShapeMismatch(_))));

    let empty_axis = Seq2SeqDataset::new(
        Array3::zeros((10, 0, 5)),
        Array3::zeros((10, 3, 6)),
        Array3::zeros((10, 3, 6)),
    );
    assert!(matches!(empty_axis, Err(PipelineError::ShapeMismatch(_))));
}

#[test]
fn test_split_validation_takes_tail() -> Result<()> {
    let dataset = generate_test_dataset(10, (3, 4), (2, 4), 3)?;
    let (train, val) = dataset.split_validation(0.2)?;

    assert_eq!(train.num_samples(), 8);
    assert_eq!(val.num_samples(), 2);
    assert_eq!(
        val.encoder_input(),
        &dataset.encoder_input().slice(s![8.., .., ..]).to_owned()
    );
    assert_eq!(
        train.decoder_target(),
        &dataset.decoder_target().slice(s![..8, .., ..]).to_owned()
    );
    Ok(())
}

#[test]
fn test_split_validation_rejects_single_sample() -> Result<()> {
    let dataset = generate_test_dataset(1, (3, 4), (2, 4), 4)?;
    assert!(matches!(
        dataset.split_validation(0.2),
        Err(PipelineError::ShapeMismatch(_))
    ));
    Ok(())
}

#[test]
fn test_batch_ranges_cover_every_sample() -> Result<()> {
    let dataset = generate_test_dataset(10, (2, 3), (2, 3), 5)?;
    let ranges = dataset.batch_ranges(4);

    let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    let flat: Vec<usize> = ranges.into_iter().flatten().collect();
    assert_eq!(flat, (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_object_url_is_path_style() -> Result<()> {
    let store = HttpObjectStore::new("https://s3.amazonaws.com/")?;
    assert_eq!(
        store.object_url("my-bucket", "/train/encoder_input_data.npy"),
        "https://s3.amazonaws.com/my-bucket/train/encoder_input_data.npy"
    );
    Ok(())
}

#[test]
fn test_http_status_mapping() -> Result<()> {
    let dir = tempdir()?;
    let dest = dir.path().join("download.npy");

    let (endpoint, server) = serve_once("404 Not Found", Vec::new())?;
    let result = loopback_store(&endpoint)?.download_to(BUCKET, ENCODER_INPUT_KEY, &dest);
    assert!(matches!(
        result,
        Err(PipelineError::ResourceNotFound { ref bucket, ref key })
            if bucket == BUCKET && key == ENCODER_INPUT_KEY
    ));
    let request = server.join().unwrap();
    assert!(request.starts_with(&format!("GET /{}/{} ", BUCKET, ENCODER_INPUT_KEY)));

    for status in ["403 Forbidden", "500 Internal Server Error"] {
        let (endpoint, server) = serve_once(status, Vec::new())?;
        let result = loopback_store(&endpoint)?.download_to(BUCKET, ENCODER_INPUT_KEY, &dest);
        assert!(
            matches!(result, Err(PipelineError::StorageUnavailable { ref key, .. }) if key == ENCODER_INPUT_KEY),
            "status {} mapped to {:?}",
            status,
            result
        );
        server.join().unwrap();
    }
    Ok(())
}

#[test]
fn test_http_fetch_decodes_payload() -> Result<()> {
    let expected = Array3::<f32>::from_shape_fn((2, 3, 4), |(i, j, k)| (i + j + k) as f32);
    let mut payload = Vec::new();
    expected.write_npy(&mut payload)?;

    let (endpoint, server) = serve_once("200 OK", payload)?;
    let store = loopback_store(&endpoint)?.with_bearer_token("secret-token");
    let provider = DatasetProvider::new(Box::new(store), BUCKET);
    let fetched = provider.fetch_tensor(ENCODER_INPUT_KEY)?;
    assert_eq!(fetched, expected);

    let request = server.join().unwrap().to_ascii_lowercase();
    assert!(request.contains("authorization: bearer secret-token"));
    Ok(())
}

fn write_and_read<T: WritableElement>(dir: &Path, name: &str, array: &Array3<T>) -> Result<Array3<f32>> {
    let path = dir.join(name);
    array.write_npy(BufWriter::new(File::create(&path)?))?;
    Ok(read_npy_tensor(&path, name)?)
}

#[test]
fn test_integer_and_bool_payloads_are_cast() -> Result<()> {
    let dir = tempdir()?;
    let shape = (2, 3, 4);
    let one_hot = |(i, j, k): (usize, usize, usize)| (i + j) % 4 == k;
    let expected = Array3::<f32>::from_shape_fn(shape, |idx| if one_hot(idx) { 1.0 } else { 0.0 });

    let as_u8 = Array3::<u8>::from_shape_fn(shape, |idx| one_hot(idx) as u8);
    let as_i32 = Array3::<i32>::from_shape_fn(shape, |idx| one_hot(idx) as i32);
    let as_i64 = Array3::<i64>::from_shape_fn(shape, |idx| one_hot(idx) as i64);
    let as_bool = Array3::<bool>::from_shape_fn(shape, one_hot);

    assert_eq!(write_and_read(dir.path(), "u8.npy", &as_u8)?, expected);
    assert_eq!(write_and_read(dir.path(), "i32.npy", &as_i32)?, expected);
    assert_eq!(write_and_read(dir.path(), "i64.npy", &as_i64)?, expected);
    assert_eq!(write_and_read(dir.path(), "bool.npy", &as_bool)?, expected);

    // Values beyond 0/1 keep their magnitude
    let counts = write_and_read(dir.path(), "counts.npy", &Array3::<i64>::from_elem((1, 1, 2), -7))?;
    assert_eq!(counts[[0, 0, 1]], -7.0);
    Ok(())
}

#[test]
fn test_unsupported_dtype_is_decode_error() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("i16.npy");
    Array3::<i16>::zeros((1, 2, 3)).write_npy(BufWriter::new(File::create(&path)?))?;

    let result = read_npy_tensor(&path, "i16.npy");
    assert!(matches!(result, Err(PipelineError::TensorDecode { ref key, .. }) if key == "i16.npy"));
    Ok(())
}
