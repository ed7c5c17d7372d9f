//! Trainable BERT encoder backed by a candle `VarMap`.
//!
//! The encoder owns its parameters: every weight lives in the `VarMap` under
//! its Hugging Face name, layers hold tensors that alias those variables, and
//! gradients computed through [`BertEncoder::forward`] land on
//! [`BertEncoder::trainable_vars`].
//!
//! Two encoders never share storage. [`BertEncoder::deep_copy`] duplicates
//! every variable, which is how the mention encoder is forked from the
//! checkpoint-loaded entity encoder.

mod config;
mod layers;
mod surgery;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::batch::EncoderInput;
use crate::checkpoint::{self, MergeReport};
use crate::error::{LinkerError, LinkerResult};
use crate::mode::Mode;

pub use config::{Activation, BertConfig};
pub use layers::{extended_attention_mask, BertEmbeddings, BertLayer, LayerNormWeights};
pub use surgery::TOKEN_TYPE_TABLE;

/// BERT encoder producing (B, L, H) hidden states.
pub struct BertEncoder {
    config: BertConfig,
    varmap: VarMap,
    embeddings: BertEmbeddings,
    layers: Vec<BertLayer>,
    device: Device,
}

impl std::fmt::Debug for BertEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BertEncoder")
            .field("hidden_size", &self.config.hidden_size)
            .field("num_hidden_layers", &self.config.num_hidden_layers)
            .field("type_vocab_size", &self.config.type_vocab_size)
            .field("device", &self.device)
            .finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> LinkerResult<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| LinkerError::InternalError {
        message: format!("VarMap lock poisoned: {}", e),
    })
}

impl BertEncoder {
    /// Freshly initialized encoder.
    pub fn new(config: BertConfig, device: &Device) -> LinkerResult<Self> {
        config.validate()?;
        Self::build(config, VarMap::new(), device)
    }

    /// Wire layers onto `varmap`, creating any variable it does not hold yet.
    pub(crate) fn build(config: BertConfig, varmap: VarMap, device: &Device) -> LinkerResult<Self> {
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), &config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| BertLayer::load(vb.pp(format!("encoder.layer.{}", i)), &config))
            .collect::<LinkerResult<Vec<_>>>()?;

        Ok(Self {
            config,
            varmap,
            embeddings,
            layers,
            device: device.clone(),
        })
    }

    /// Run the encoder on a tokenized batch.
    ///
    /// Returns (B, L, H) hidden states of the last layer.
    pub fn forward(&self, input: &EncoderInput, mode: Mode) -> LinkerResult<Tensor> {
        self.check_input(input)?;

        let mut hidden = self
            .embeddings
            .forward(&input.input_ids, &input.token_type_ids, mode)?;
        let extended_mask = extended_attention_mask(&input.attention_mask)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &extended_mask, mode)?;
        }

        Ok(hidden)
    }

    fn check_input(&self, input: &EncoderInput) -> LinkerResult<()> {
        let seq_len = input.seq_len();
        if seq_len > self.config.max_position_embeddings {
            return Err(LinkerError::PreconditionViolation {
                message: format!(
                    "sequence length {} exceeds max_position_embeddings {}",
                    seq_len, self.config.max_position_embeddings
                ),
            });
        }
        if input.batch_size() == 0 || seq_len == 0 {
            return Ok(());
        }

        let max_token = input.input_ids.max_all()?.to_dtype(DType::U32)?.to_scalar::<u32>()?;
        if max_token as usize >= self.config.vocab_size {
            return Err(LinkerError::PreconditionViolation {
                message: format!(
                    "token id {} out of range for vocab_size {}",
                    max_token, self.config.vocab_size
                ),
            });
        }
        let max_type = input
            .token_type_ids
            .max_all()?
            .to_dtype(DType::U32)?
            .to_scalar::<u32>()?;
        if max_type as usize >= self.config.type_vocab_size {
            return Err(LinkerError::PreconditionViolation {
                message: format!(
                    "token type id {} out of range for type_vocab_size {}",
                    max_type, self.config.type_vocab_size
                ),
            });
        }
        Ok(())
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// Every parameter of this encoder, for an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn param_count(&self) -> LinkerResult<usize> {
        let data = lock(self.varmap.data())?;
        Ok(data.values().map(|v| v.elem_count()).sum())
    }

    /// Sorted parameter names.
    pub fn parameter_names(&self) -> LinkerResult<Vec<String>> {
        let data = lock(self.varmap.data())?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Live view of one parameter.
    pub fn parameter(&self, name: &str) -> LinkerResult<Option<Tensor>> {
        let data = lock(self.varmap.data())?;
        Ok(data.get(name).map(|v| v.as_tensor().clone()))
    }

    /// The segment-type embedding table currently wired into the embeddings.
    pub fn token_type_table(&self) -> &Tensor {
        self.embeddings.token_type_table()
    }

    /// Snapshot of every parameter, decoupled from later updates.
    pub fn state_dict(&self) -> LinkerResult<HashMap<String, Tensor>> {
        let data = lock(self.varmap.data())?;
        data.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
            .collect()
    }

    /// Shape check of named tensors against this encoder's parameters.
    pub fn check_state(&self, state: &HashMap<String, Tensor>) -> LinkerResult<()> {
        checkpoint::check_shapes(&self.varmap, state)
    }

    /// Tolerant merge of named tensors into this encoder's parameters.
    pub fn load_state(&self, state: &HashMap<String, Tensor>) -> LinkerResult<MergeReport> {
        checkpoint::merge_into(&self.varmap, state)
    }

    pub(crate) fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}
