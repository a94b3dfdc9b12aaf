// src/model.rs
//
// The forward pass belongs to candle-transformers. This module only wires
// a loaded network behind `CausalLm` so decoding can drive any of them.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{bigcode, llama, qwen2};
use hf_hub::api::sync::{ApiBuilder, ApiError};
use hf_hub::{Cache, Repo, RepoType};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::config::{Architecture, ConfigError, ModelConfig};
use crate::weights::{self, WeightsError, SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE};

#[derive(Debug)]
pub enum ModelError {
    Candle(candle_core::Error),
    Hub(ApiError),
    Config(ConfigError),
    Weights(WeightsError),
    Json(serde_json::Error),
    MissingFile(PathBuf),
    UnsupportedDtype(String),
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Candle(e) => write!(f, "Candle error: {}", e),
            ModelError::Hub(e) => write!(f, "Hugging Face hub error: {}", e),
            ModelError::Config(e) => write!(f, "Model config error: {}", e),
            ModelError::Weights(e) => write!(f, "Weights error: {}", e),
            ModelError::Json(e) => write!(f, "Model config JSON error: {}", e),
            ModelError::MissingFile(path) => write!(f, "Model file not found: {}", path.display()),
            ModelError::UnsupportedDtype(s) => {
                write!(f, "Unsupported dtype '{}'. Use one of f32, f16, bf16", s)
            }
        }
    }
}

impl std::error::Error for ModelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModelError::Candle(e) => Some(e),
            ModelError::Hub(e) => Some(e),
            ModelError::Config(e) => Some(e),
            ModelError::Weights(e) => Some(e),
            ModelError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for ModelError {
    fn from(err: candle_core::Error) -> Self {
        ModelError::Candle(err)
    }
}

impl From<ApiError> for ModelError {
    fn from(err: ApiError) -> Self {
        ModelError::Hub(err)
    }
}

impl From<ConfigError> for ModelError {
    fn from(err: ConfigError) -> Self {
        ModelError::Config(err)
    }
}

impl From<WeightsError> for ModelError {
    fn from(err: WeightsError) -> Self {
        ModelError::Weights(err)
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::Json(err)
    }
}

/// A causal language model that yields next-token logits.
///
/// `forward` receives only the tokens not yet fed since the last `reset`;
/// `seqlen_offset` is how many tokens were fed before them. Callers that
/// switch to an unrelated sequence must call `reset` first.
pub trait CausalLm {
    fn forward(&mut self, tokens: &[u32], seqlen_offset: usize) -> Result<Vec<f32>, ModelError>;
    fn reset(&mut self) -> Result<(), ModelError>;
}

// Logits come back as (1, vocab) or (1, 1, vocab) depending on the model.
fn last_logits(logits: &Tensor) -> Result<Vec<f32>, ModelError> {
    Ok(logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

pub struct LlamaLm {
    model: llama::Llama,
    config: llama::Config,
    cache: llama::Cache,
    dtype: DType,
    device: Device,
}

impl CausalLm for LlamaLm {
    fn forward(&mut self, tokens: &[u32], seqlen_offset: usize) -> Result<Vec<f32>, ModelError> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, seqlen_offset, &mut self.cache)?;
        last_logits(&logits)
    }

    fn reset(&mut self) -> Result<(), ModelError> {
        self.cache = llama::Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(())
    }
}

pub struct Qwen2Lm {
    model: qwen2::ModelForCausalLM,
    device: Device,
}

impl CausalLm for Qwen2Lm {
    fn forward(&mut self, tokens: &[u32], seqlen_offset: usize) -> Result<Vec<f32>, ModelError> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, seqlen_offset)?;
        last_logits(&logits)
    }

    fn reset(&mut self) -> Result<(), ModelError> {
        self.model.clear_kv_cache();
        Ok(())
    }
}

/// GPT-BigCode is built without its kv cache, so every call re-runs the
/// whole sequence kept in `history`.
pub struct BigCodeLm {
    model: bigcode::GPTBigCode,
    history: Vec<u32>,
    device: Device,
}

impl CausalLm for BigCodeLm {
    fn forward(&mut self, tokens: &[u32], seqlen_offset: usize) -> Result<Vec<f32>, ModelError> {
        self.history.truncate(seqlen_offset);
        self.history.extend_from_slice(tokens);
        let input = Tensor::new(self.history.as_slice(), &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?;
        last_logits(&logits)
    }

    fn reset(&mut self) -> Result<(), ModelError> {
        self.history.clear();
        Ok(())
    }
}

pub fn bigcode_config(config: &ModelConfig) -> Result<bigcode::Config, ConfigError> {
    Ok(bigcode::Config {
        vocab_size: config.vocab_size.ok_or(ConfigError::MissingField("vocab_size"))?,
        max_position_embeddings: config.max_positions()?,
        num_hidden_layers: config.num_layers()?,
        hidden_size: config.hidden_size()?,
        layer_norm_epsilon: config.layer_norm_epsilon.unwrap_or(1e-5),
        n_inner: config.n_inner,
        num_attention_heads: config.num_heads()?,
        multi_query: config.multi_query.unwrap_or(true),
        use_cache: false,
    })
}

/// Local paths of everything needed to build a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

impl ModelFiles {
    /// A local directory is used as-is; anything else is treated as a hub
    /// repository id and fetched (or read from the hub cache).
    pub fn resolve(base_model: &str, revision: &str, auth_token: Option<&str>) -> Result<Self, ModelError> {
        let local = Path::new(base_model);
        if local.is_dir() {
            info!("Loading model from local directory {}", local.display());
            return Self::from_dir(local);
        }
        Self::from_hub(base_model, revision, auth_token)
    }

    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let require = |name: &str| {
            let path = dir.join(name);
            if path.exists() { Ok(path) } else { Err(ModelError::MissingFile(path)) }
        };
        let config = require("config.json")?;
        let tokenizer = require("tokenizer.json")?;
        let weights = if dir.join(SINGLE_WEIGHTS_FILE).exists() {
            vec![dir.join(SINGLE_WEIGHTS_FILE)]
        } else {
            let index = require(WEIGHTS_INDEX_FILE)?;
            weights::shard_names_from_index(&index)?
                .iter()
                .map(|name| require(name.as_str()))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self { config, tokenizer, weights })
    }

    fn from_hub(repo_id: &str, revision: &str, auth_token: Option<&str>) -> Result<Self, ModelError> {
        info!("Fetching {} (revision {}) from the Hugging Face hub", repo_id, revision);
        let cache = Cache::default();
        let token = hub_token(auth_token, &cache);
        let api = ApiBuilder::from_cache(cache).with_token(token).build()?;
        let repo = api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        let config = repo.get("config.json")?;
        let tokenizer = repo.get("tokenizer.json")?;
        let weights = match repo.get(SINGLE_WEIGHTS_FILE) {
            Ok(path) => vec![path],
            Err(e) => {
                debug!("No single weights file ({}), trying {}", e, WEIGHTS_INDEX_FILE);
                let index = repo.get(WEIGHTS_INDEX_FILE)?;
                weights::shard_names_from_index(&index)?
                    .iter()
                    .map(|name| repo.get(name))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(Self { config, tokenizer, weights })
    }
}

/// An explicit token wins; otherwise the one saved by `huggingface-cli login`.
fn hub_token(auth_token: Option<&str>, cache: &Cache) -> Option<String> {
    auth_token.map(str::to_string).or_else(|| cache.token())
}

/// CUDA, then Metal, then CPU. `force_cpu` skips the accelerators.
pub fn select_device(force_cpu: bool) -> Result<Device, ModelError> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

/// Explicit `requested` dtype, otherwise f16 on accelerators and f32 on CPU.
pub fn select_dtype(requested: Option<&str>, device: &Device) -> Result<DType, ModelError> {
    match requested {
        Some("f32") => Ok(DType::F32),
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some(other) => Err(ModelError::UnsupportedDtype(other.to_string())),
        None if device.is_cpu() => Ok(DType::F32),
        None => Ok(DType::F16),
    }
}

/// Builds the network described by `config` from the memory-mapped weights.
///
/// `raw_config` is the original `config.json` bytes, re-read into the
/// architecture's own config type.
pub fn load_model(
    files: &ModelFiles,
    config: &ModelConfig,
    raw_config: &[u8],
    device: &Device,
    dtype: DType,
) -> Result<Box<dyn CausalLm>, ModelError> {
    let architecture = config.architecture()?;
    info!("Building {:?} model on {:?} as {:?}", architecture, device, dtype);
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };

    let model: Box<dyn CausalLm> = match architecture {
        Architecture::Llama => {
            let llama_config: llama::LlamaConfig = serde_json::from_slice(raw_config)?;
            let llama_config = llama_config.into_config(false);
            let model = llama::Llama::load(vb, &llama_config)?;
            let cache = llama::Cache::new(true, dtype, &llama_config, device)?;
            Box::new(LlamaLm { model, config: llama_config, cache, dtype, device: device.clone() })
        }
        Architecture::Qwen2 => {
            let qwen_config: qwen2::Config = serde_json::from_slice(raw_config)?;
            let model = qwen2::ModelForCausalLM::new(&qwen_config, vb)?;
            Box::new(Qwen2Lm { model, device: device.clone() })
        }
        Architecture::GptBigCode => {
            let model = bigcode::GPTBigCode::load(vb, bigcode_config(config)?)?;
            Box::new(BigCodeLm { model, history: Vec::new(), device: device.clone() })
        }
    };
    Ok(model)
}
