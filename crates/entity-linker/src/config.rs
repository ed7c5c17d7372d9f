//! Linker configuration.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use entity_linker::LinkerConfig;
//!
//! let config = LinkerConfig::from_file("linker.toml")?.with_env_overrides();
//! config.validate()?;
//! let linker = entity_linker::EntityLinker::from_config(&config)?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! pretrained_model_path = "pretrained"
//! pooling = "mean"
//! additive_margin = 0.02
//! inv_temperature = 0.05
//! mention_type_vocab_size = 3
//! checkpoint_prefix = ""
//! device = "cpu"
//! ```

use std::env;
use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{LinkerError, LinkerResult};
use crate::model::{ADDITIVE_MARGIN, INV_TEMPERATURE, MENTION_TYPE_VOCAB_SIZE};
use crate::pooling::Pooling;

/// Where tensors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
}

impl DeviceSpec {
    /// Accepts `cpu`, `cuda` (ordinal 0) and `cuda:N`.
    pub fn parse(value: &str) -> LinkerResult<Self> {
        let value = value.trim().to_ascii_lowercase();
        match value.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|ordinal| ordinal.parse::<usize>().ok())
                .map(DeviceSpec::Cuda)
                .ok_or_else(|| LinkerError::ConfigError {
                    message: format!("device must be cpu, cuda or cuda:N, got '{}'", value),
                }),
        }
    }

    /// Open the device. A CUDA device that cannot be opened is an error.
    pub fn open(self) -> LinkerResult<Device> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(ordinal) => Device::new_cuda(ordinal).map_err(|e| LinkerError::ConfigError {
                message: format!("CUDA device {} unavailable: {}", ordinal, e),
            }),
        }
    }
}

fn default_model_path() -> String {
    "pretrained".to_string()
}

fn default_margin() -> f64 {
    ADDITIVE_MARGIN
}

fn default_inv_temperature() -> f64 {
    INV_TEMPERATURE
}

fn default_mention_types() -> usize {
    MENTION_TYPE_VOCAB_SIZE
}

fn default_device() -> String {
    "cpu".to_string()
}

/// Top-level linker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkerConfig {
    /// Directory holding `config.json` and the pretrained weights.
    #[serde(default = "default_model_path")]
    pub pretrained_model_path: String,

    /// Pooling applied by both encoders.
    #[serde(default)]
    pub pooling: Pooling,

    /// Subtracted from gold cosines in training mode.
    #[serde(default = "default_margin")]
    pub additive_margin: f64,

    /// Multiplier applied to every cosine before softmax.
    #[serde(default = "default_inv_temperature")]
    pub inv_temperature: f64,

    /// Rows of the mention encoder's segment-type table.
    #[serde(default = "default_mention_types")]
    pub mention_type_vocab_size: usize,

    /// Model prefix stripped from checkpoint keys after `module.` (e.g. `bert.`).
    #[serde(default)]
    pub checkpoint_prefix: String,

    #[serde(default = "default_device")]
    pub device: String,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            pretrained_model_path: default_model_path(),
            pooling: Pooling::default(),
            additive_margin: default_margin(),
            inv_temperature: default_inv_temperature(),
            mention_type_vocab_size: default_mention_types(),
            checkpoint_prefix: String::new(),
            device: default_device(),
        }
    }
}

impl LinkerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `LinkerError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> LinkerResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| LinkerError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| LinkerError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    pub fn from_toml_str(toml: &str) -> LinkerResult<Self> {
        toml::from_str(toml).map_err(|e| LinkerError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    pub fn to_toml_string(&self) -> LinkerResult<String> {
        toml::to_string_pretty(self).map_err(|e| LinkerError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Check every value, returning the first problem found.
    pub fn validate(&self) -> LinkerResult<()> {
        let fail = |message: String| {
            tracing::error!("Invalid linker configuration: {}", message);
            Err(LinkerError::ConfigError { message })
        };

        if self.pretrained_model_path.trim().is_empty() {
            return fail("pretrained_model_path must not be empty".to_string());
        }
        if !self.additive_margin.is_finite() || self.additive_margin < 0.0 {
            return fail(format!(
                "additive_margin must be finite and >= 0, got {}",
                self.additive_margin
            ));
        }
        if !self.inv_temperature.is_finite() || self.inv_temperature <= 0.0 {
            return fail(format!(
                "inv_temperature must be finite and > 0, got {}",
                self.inv_temperature
            ));
        }
        if self.mention_type_vocab_size == 0 {
            return fail("mention_type_vocab_size must be >= 1".to_string());
        }
        DeviceSpec::parse(&self.device)?;
        Ok(())
    }

    pub fn device(&self) -> LinkerResult<Device> {
        DeviceSpec::parse(&self.device)?.open()
    }

    /// Apply environment overrides. Prefix: `LINKER_`
    ///
    /// | Variable | Field | Type |
    /// |----------|-------|------|
    /// | `LINKER_PRETRAINED_MODEL_PATH` | `pretrained_model_path` | String |
    /// | `LINKER_POOLING` | `pooling` | cls/max/mean |
    /// | `LINKER_ADDITIVE_MARGIN` | `additive_margin` | f64 |
    /// | `LINKER_INV_TEMPERATURE` | `inv_temperature` | f64 |
    /// | `LINKER_CHECKPOINT_PREFIX` | `checkpoint_prefix` | String |
    /// | `LINKER_DEVICE` | `device` | String |
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("LINKER_PRETRAINED_MODEL_PATH") {
            self.pretrained_model_path = val;
        }
        if let Ok(val) = env::var("LINKER_POOLING") {
            if let Ok(pooling) = val.parse::<Pooling>() {
                self.pooling = pooling;
            }
        }
        if let Ok(val) = env::var("LINKER_ADDITIVE_MARGIN") {
            if let Ok(v) = val.parse::<f64>() {
                self.additive_margin = v;
            }
        }
        if let Ok(val) = env::var("LINKER_INV_TEMPERATURE") {
            if let Ok(v) = val.parse::<f64>() {
                self.inv_temperature = v;
            }
        }
        if let Ok(val) = env::var("LINKER_CHECKPOINT_PREFIX") {
            self.checkpoint_prefix = val;
        }
        if let Ok(val) = env::var("LINKER_DEVICE") {
            self.device = val;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pooling, Pooling::Mean);
        assert_eq!(config.additive_margin, 0.02);
        assert_eq!(config.inv_temperature, 0.05);
        assert_eq!(config.mention_type_vocab_size, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = LinkerConfig::from_toml_str("pooling = \"cls\"\ndevice = \"cuda:1\"").unwrap();
        assert_eq!(config.pooling, Pooling::Cls);
        assert_eq!(config.additive_margin, 0.02);
        assert_eq!(DeviceSpec::parse(&config.device).unwrap(), DeviceSpec::Cuda(1));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = LinkerConfig::default();
        config.pooling = Pooling::Max;
        config.checkpoint_prefix = "bert.".to_string();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("pooling = \"max\""));
        assert_eq!(LinkerConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_unknown_pooling_rejected_at_parse() {
        assert!(LinkerConfig::from_toml_str("pooling = \"sum\"").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<Box<dyn Fn(&mut LinkerConfig)>> = vec![
            Box::new(|c| c.pretrained_model_path = " ".to_string()),
            Box::new(|c| c.additive_margin = -0.1),
            Box::new(|c| c.additive_margin = f64::NAN),
            Box::new(|c| c.inv_temperature = 0.0),
            Box::new(|c| c.inv_temperature = f64::INFINITY),
            Box::new(|c| c.mention_type_vocab_size = 0),
            Box::new(|c| c.device = "tpu".to_string()),
        ];
        for mutate in cases {
            let mut config = LinkerConfig::default();
            mutate(&mut config);
            assert!(matches!(config.validate(), Err(LinkerError::ConfigError { .. })));
        }
    }

    #[test]
    fn test_device_spec_parse() {
        assert_eq!(DeviceSpec::parse("CPU").unwrap(), DeviceSpec::Cpu);
        assert_eq!(DeviceSpec::parse("cuda").unwrap(), DeviceSpec::Cuda(0));
        assert_eq!(DeviceSpec::parse("cuda:3").unwrap(), DeviceSpec::Cuda(3));
        assert!(DeviceSpec::parse("cuda:x").is_err());
        assert!(matches!(DeviceSpec::Cpu.open().unwrap(), Device::Cpu));
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "pretrained_model_path = \"/models/bert\"\ninv_temperature = 0.1").unwrap();
        let config = LinkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pretrained_model_path, "/models/bert");
        assert_eq!(config.inv_temperature, 0.1);
    }

    #[test]
    fn test_from_missing_file() {
        let err = LinkerConfig::from_file("/nonexistent/linker.toml").unwrap_err();
        assert!(matches!(err, LinkerError::ConfigError { .. }));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("LINKER_POOLING", "max");
        env::set_var("LINKER_ADDITIVE_MARGIN", "0.05");
        env::set_var("LINKER_INV_TEMPERATURE", "not-a-number");
        let config = LinkerConfig::default().with_env_overrides();
        env::remove_var("LINKER_POOLING");
        env::remove_var("LINKER_ADDITIVE_MARGIN");
        env::remove_var("LINKER_INV_TEMPERATURE");

        assert_eq!(config.pooling, Pooling::Max);
        assert_eq!(config.additive_margin, 0.05);
        assert_eq!(config.inv_temperature, 0.05);
    }
}
