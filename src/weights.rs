// src/weights.rs
//
// Header-only inspection of .safetensors files. Tensor data is never read
// here; candle memory-maps the files when the model is built.

use safetensors::Dtype;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Same ceiling the safetensors crate applies to headers.
const MAX_HEADER_SIZE: u64 = 100_000_000;

#[derive(Deserialize, Debug, Clone)]
pub struct TensorMetadata {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data_offsets: (usize, usize),
}

#[derive(Deserialize, Debug)]
struct WeightsIndex {
    weight_map: HashMap<String, String>,
}

#[derive(Debug)]
pub enum WeightsError {
    Io(PathBuf, io::Error),
    Json(PathBuf, serde_json::Error),
    InvalidHeader(PathBuf, String),
}

impl std::fmt::Display for WeightsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightsError::Io(path, e) => write!(f, "IO error on {}: {}", path.display(), e),
            WeightsError::Json(path, e) => write!(f, "Bad JSON in {}: {}", path.display(), e),
            WeightsError::InvalidHeader(path, s) => {
                write!(f, "Invalid safetensors header in {}: {}", path.display(), s)
            }
        }
    }
}

impl std::error::Error for WeightsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WeightsError::Io(_, e) => Some(e),
            WeightsError::Json(_, e) => Some(e),
            WeightsError::InvalidHeader(..) => None,
        }
    }
}

/// Shard file names listed in a `model.safetensors.index.json`, sorted and
/// de-duplicated.
pub fn shard_names_from_index(index_path: &Path) -> Result<Vec<String>, WeightsError> {
    let file = File::open(index_path).map_err(|e| WeightsError::Io(index_path.to_path_buf(), e))?;
    let index: WeightsIndex = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| WeightsError::Json(index_path.to_path_buf(), e))?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

pub fn read_header(path: &Path) -> Result<BTreeMap<String, TensorMetadata>, WeightsError> {
    let io_err = |e| WeightsError::Io(path.to_path_buf(), e);
    let file = File::open(path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    let mut reader = BufReader::new(file);

    // 1. u64 little-endian header length
    let mut header_len_bytes = [0u8; 8];
    reader.read_exact(&mut header_len_bytes).map_err(io_err)?;
    let header_length = u64::from_le_bytes(header_len_bytes);

    if header_length == 0 || header_length > MAX_HEADER_SIZE || header_length + 8 > file_len {
        return Err(WeightsError::InvalidHeader(
            path.to_path_buf(),
            format!("header length {} for a file of {} bytes", header_length, file_len),
        ));
    }

    // 2. JSON header
    let mut json_header_bytes = vec![0u8; header_length as usize];
    reader.read_exact(&mut json_header_bytes).map_err(io_err)?;
    let raw: HashMap<String, serde_json::Value> = serde_json::from_slice(&json_header_bytes)
        .map_err(|e| WeightsError::Json(path.to_path_buf(), e))?;

    let mut tensors = BTreeMap::new();
    for (name, value) in raw {
        if name == "__metadata__" {
            continue;
        }
        let metadata: TensorMetadata = serde_json::from_value(value)
            .map_err(|e| WeightsError::Json(path.to_path_buf(), e))?;
        tensors.insert(name, metadata);
    }
    Ok(tensors)
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct WeightsSummary {
    pub files: usize,
    pub tensors: usize,
    pub parameters: u64,
    /// Parameter count per stored dtype, keyed by the safetensors name (e.g. "BF16").
    pub dtypes: BTreeMap<String, u64>,
}

impl WeightsSummary {
    pub fn collect(paths: &[PathBuf]) -> Result<Self, WeightsError> {
        let mut summary = WeightsSummary::default();
        for path in paths {
            let header = read_header(path)?;
            summary.files += 1;
            summary.tensors += header.len();
            for metadata in header.values() {
                let count: u64 = metadata.shape.iter().map(|&d| d as u64).product();
                summary.parameters += count;
                *summary.dtypes.entry(format!("{:?}", metadata.dtype)).or_insert(0) += count;
            }
        }
        Ok(summary)
    }

    /// Bytes the weights occupy once converted to a dtype of `bytes_per_param`.
    pub fn estimated_bytes(&self, bytes_per_param: usize) -> u64 {
        self.parameters * bytes_per_param as u64
    }
}
