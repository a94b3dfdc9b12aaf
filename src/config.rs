use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io(String, std::io::Error),
    Json(String, serde_json::Error),
    UnsupportedArchitecture(String),
    MissingField(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Failed to read config file {}: {}", path, e),
            ConfigError::Json(path, e) => write!(f, "Failed to deserialize JSON from {}: {}", path, e),
            ConfigError::UnsupportedArchitecture(name) => write!(
                f,
                "Unsupported model architecture '{}'. Supported: llama, mistral, qwen2, gpt_bigcode",
                name
            ),
            ConfigError::MissingField(field) => write!(f, "Model config is missing '{}'", field),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Json(_, e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Llama,
    Qwen2,
    GptBigCode,
}

/// `eos_token_id` appears as either an integer or a list.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::Single(id) => vec![*id],
            TokenIds::Multiple(ids) => ids.clone(),
        }
    }
}

/// The subset of a Hugging Face `config.json` needed to pick and build a
/// model. Llama and Qwen2 re-read the same file into their own config types;
/// GPT-BigCode is built from the GPT-2 style fields kept here.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct ModelConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub n_embd: Option<usize>,
    #[serde(default)]
    pub hidden_size: Option<usize>,
    #[serde(default)]
    pub n_layer: Option<usize>,
    #[serde(default)]
    pub num_hidden_layers: Option<usize>,
    #[serde(default)]
    pub n_head: Option<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<usize>,
    #[serde(default)]
    pub n_positions: Option<usize>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default)]
    pub layer_norm_epsilon: Option<f64>,
    #[serde(default)]
    pub multi_query: Option<bool>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
}

impl ModelConfig {
    pub fn load(config_path: &Path) -> Result<(Self, Vec<u8>), ConfigError> {
        let display = config_path.display().to_string();
        let bytes = fs::read(config_path).map_err(|e| ConfigError::Io(display.clone(), e))?;
        let config = Self::from_slice(&display, &bytes)?;
        Ok((config, bytes))
    }

    pub fn from_slice(source: &str, bytes: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(bytes).map_err(|e| ConfigError::Json(source.to_string(), e))
    }

    pub fn architecture(&self) -> Result<Architecture, ConfigError> {
        let from_name = |name: &str| match name.to_ascii_lowercase().as_str() {
            "llama" | "mistral" | "llamaforcausallm" | "mistralforcausallm" => Some(Architecture::Llama),
            "qwen2" | "qwen2forcausallm" => Some(Architecture::Qwen2),
            "gpt_bigcode" | "starcoder" | "gptbigcodeforcausallm" => Some(Architecture::GptBigCode),
            _ => None,
        };
        if let Some(model_type) = &self.model_type {
            return from_name(model_type)
                .ok_or_else(|| ConfigError::UnsupportedArchitecture(model_type.clone()));
        }
        self.architectures
            .iter()
            .find_map(|name| from_name(name))
            .ok_or_else(|| {
                ConfigError::UnsupportedArchitecture(
                    self.architectures.first().cloned().unwrap_or_else(|| "<unknown>".to_string()),
                )
            })
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        self.eos_token_id.as_ref().map(TokenIds::to_vec).unwrap_or_default()
    }

    pub fn hidden_size(&self) -> Result<usize, ConfigError> {
        self.hidden_size.or(self.n_embd).ok_or(ConfigError::MissingField("n_embd"))
    }

    pub fn num_layers(&self) -> Result<usize, ConfigError> {
        self.num_hidden_layers.or(self.n_layer).ok_or(ConfigError::MissingField("n_layer"))
    }

    pub fn num_heads(&self) -> Result<usize, ConfigError> {
        self.num_attention_heads.or(self.n_head).ok_or(ConfigError::MissingField("n_head"))
    }

    pub fn max_positions(&self) -> Result<usize, ConfigError> {
        self.max_position_embeddings
            .or(self.n_positions)
            .ok_or(ConfigError::MissingField("n_positions"))
    }
}
