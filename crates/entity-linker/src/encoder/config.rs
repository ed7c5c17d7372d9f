//! BERT architecture configuration parsed from `config.json`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LinkerError, LinkerResult};

/// BERT model configuration parsed from config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    /// Vocabulary size (e.g., 30522 for BERT).
    pub vocab_size: usize,
    /// Hidden layer size (e.g., 768 for BERT-base).
    pub hidden_size: usize,
    /// Number of hidden layers.
    pub num_hidden_layers: usize,
    /// Number of attention heads.
    pub num_attention_heads: usize,
    /// Intermediate FFN size (usually 4x hidden_size).
    pub intermediate_size: usize,
    /// Hidden activation function (gelu, gelu_new, relu).
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    /// Dropout probability for hidden layers.
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    /// Dropout probability for attention.
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    /// Maximum sequence length.
    #[serde(default = "default_max_position")]
    pub max_position_embeddings: usize,
    /// Segment-type vocabulary size (usually 2).
    #[serde(default = "default_type_vocab")]
    pub type_vocab_size: usize,
    /// Standard deviation of the normal weight initializer.
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
    /// Layer normalization epsilon.
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// Padding token ID.
    #[serde(default)]
    pub pad_token_id: usize,
    /// Model type string.
    #[serde(default = "default_model_type")]
    pub model_type: String,
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

fn default_dropout() -> f64 {
    0.1
}

fn default_max_position() -> usize {
    512
}

fn default_type_vocab() -> usize {
    2
}

fn default_initializer_range() -> f64 {
    0.02
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_model_type() -> String {
    "bert".to_string()
}

impl BertConfig {
    /// Load and validate `config.json` from a model directory.
    pub fn from_model_dir(model_dir: &Path) -> LinkerResult<Self> {
        let config_path = model_dir.join("config.json");
        let path = config_path.display().to_string();

        if !config_path.exists() {
            return Err(LinkerError::ModelConfigError {
                path,
                message: "config.json not found".to_string(),
            });
        }

        let content =
            std::fs::read_to_string(&config_path).map_err(|e| LinkerError::ModelConfigError {
                path: path.clone(),
                message: e.to_string(),
            })?;

        let config: BertConfig =
            serde_json::from_str(&content).map_err(|e| LinkerError::ModelConfigError {
                path: path.clone(),
                message: e.to_string(),
            })?;

        config.validate().map_err(|e| LinkerError::ModelConfigError {
            path,
            message: e.to_string(),
        })?;

        tracing::info!(
            "Loaded config for {} model: hidden_size={}, layers={}, heads={}, type_vocab_size={}",
            config.model_type,
            config.hidden_size,
            config.num_hidden_layers,
            config.num_attention_heads,
            config.type_vocab_size
        );

        Ok(config)
    }

    /// Check dimensions the encoder relies on.
    pub fn validate(&self) -> LinkerResult<()> {
        if self.hidden_size == 0 || self.num_attention_heads == 0 {
            return Err(LinkerError::ConfigError {
                message: "hidden_size and num_attention_heads must be > 0".to_string(),
            });
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(LinkerError::ConfigError {
                message: format!(
                    "hidden_size ({}) must be divisible by num_attention_heads ({})",
                    self.hidden_size, self.num_attention_heads
                ),
            });
        }
        if self.type_vocab_size == 0 {
            return Err(LinkerError::ConfigError {
                message: "type_vocab_size must be > 0".to_string(),
            });
        }
        for (name, p) in [
            ("hidden_dropout_prob", self.hidden_dropout_prob),
            ("attention_probs_dropout_prob", self.attention_probs_dropout_prob),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(LinkerError::ConfigError {
                    message: format!("{} must be in [0.0, 1.0), got {}", name, p),
                });
            }
        }
        Activation::from_name(&self.hidden_act)?;
        Ok(())
    }

    /// Size of one attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn activation(&self) -> LinkerResult<Activation> {
        Activation::from_name(&self.hidden_act)
    }
}

/// FFN activation named by `hidden_act`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Exact (erf) GELU, BERT's "gelu".
    Gelu,
    /// Tanh-approximated GELU.
    GeluTanh,
    Relu,
}

impl Activation {
    pub fn from_name(name: &str) -> LinkerResult<Self> {
        match name {
            "gelu" => Ok(Activation::Gelu),
            "gelu_new" | "gelu_pytorch_tanh" | "gelu_fast" => Ok(Activation::GeluTanh),
            "relu" => Ok(Activation::Relu),
            other => Err(LinkerError::ConfigError {
                message: format!("Unsupported hidden_act: {}", other),
            }),
        }
    }
}
