//! Dual-encoder entity linker.
//!
//! A mention encoder and an entity encoder start from the same pretrained
//! BERT weights and are trained jointly. Mentions and entities are pooled
//! into unit vectors, so every score is a cosine similarity. Training scores
//! each mention against every entity of the batch (in-batch negatives) and,
//! optionally, against its own hard-negative candidates; the gold entity of
//! row `i` is always column `i`.
//!
//! # Construction
//!
//! 1. The entity encoder is built from `config.json` and the checkpoint is
//!    merged into it (`module.` prefixes stripped, missing keys tolerated).
//! 2. The mention encoder is a deep copy of the loaded entity encoder.
//! 3. The mention encoder's segment-type table grows to three rows; type 2
//!    marks the mention span.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor, Var};

use crate::batch::{candidate_cardinality, EncoderInput};
use crate::checkpoint::{self, MergeReport};
use crate::config::LinkerConfig;
use crate::encoder::{BertConfig, BertEncoder};
use crate::error::{tensor_op, LinkerError, LinkerResult};
use crate::metrics::{compute_metric, RankingMetrics};
use crate::mode::Mode;
use crate::pooling::{PoolFn, Pooling};

/// Subtracted from the gold cosine in training mode.
pub const ADDITIVE_MARGIN: f64 = 0.02;

/// Multiplier applied to cosines before softmax.
pub const INV_TEMPERATURE: f64 = 0.05;

/// Segment types of the mention encoder: 0/1 as pretrained, 2 for the mention span.
pub const MENTION_TYPE_VOCAB_SIZE: usize = 3;

/// Key prefixes used by [`EntityLinker::save`].
pub const MENTION_ENCODER_PREFIX: &str = "mention_encoder.";
pub const ENTITY_ENCODER_PREFIX: &str = "entity_encoder.";

/// Scoring and pooling hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkerOptions {
    pub pooling: Pooling,
    pub additive_margin: f64,
    pub inv_temperature: f64,
    pub mention_type_vocab_size: usize,
}

impl Default for LinkerOptions {
    fn default() -> Self {
        Self {
            pooling: Pooling::default(),
            additive_margin: ADDITIVE_MARGIN,
            inv_temperature: INV_TEMPERATURE,
            mention_type_vocab_size: MENTION_TYPE_VOCAB_SIZE,
        }
    }
}

impl From<&LinkerConfig> for LinkerOptions {
    fn from(config: &LinkerConfig) -> Self {
        Self {
            pooling: config.pooling,
            additive_margin: config.additive_margin,
            inv_temperature: config.inv_temperature,
            mention_type_vocab_size: config.mention_type_vocab_size,
        }
    }
}

/// Pooled vectors backing a contrastive forward.
#[derive(Debug, Clone)]
pub struct DeepEmbeddings {
    /// (B, H) mention vectors.
    pub mention_vectors: Tensor,
    /// (B, H) gold entity vectors.
    pub entity_vectors: Tensor,
    /// (B, C, H) hard-negative vectors; `None` when C = 0.
    pub candidate_vectors: Option<Tensor>,
}

/// Result of a contrastive forward.
#[derive(Debug, Clone)]
pub struct LinkerOutput {
    /// (B, B + C) scaled scores.
    pub logits: Tensor,
    /// (B,) gold column per row: `[0, 1, ..., B-1]`.
    pub labels: Tensor,
    pub embeddings: DeepEmbeddings,
}

/// What [`EntityLinker::forward`] produced.
#[derive(Debug, Clone)]
pub enum LinkerForward {
    /// Entity-only inference: (B, H) detached unit vectors.
    Entities(Tensor),
    Contrastive(LinkerOutput),
}

/// Mention encoder, entity encoder and the pooling they share.
pub struct EntityLinker {
    mention_encoder: BertEncoder,
    entity_encoder: BertEncoder,
    pooling: Pooling,
    pool: PoolFn,
    additive_margin: f64,
    inv_temperature: f64,
}

impl std::fmt::Debug for EntityLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityLinker")
            .field("pooling", &self.pooling)
            .field("additive_margin", &self.additive_margin)
            .field("inv_temperature", &self.inv_temperature)
            .field("mention_encoder", &self.mention_encoder)
            .field("entity_encoder", &self.entity_encoder)
            .finish()
    }
}

impl EntityLinker {
    /// Build from a validated [`LinkerConfig`].
    pub fn from_config(config: &LinkerConfig) -> LinkerResult<Self> {
        config.validate()?;
        let device = config.device()?;
        Self::from_pretrained(
            Path::new(&config.pretrained_model_path),
            LinkerOptions::from(config),
            &config.checkpoint_prefix,
            &device,
        )
    }

    /// Load both encoders from a pretrained model directory.
    ///
    /// `checkpoint_prefix` is stripped from checkpoint keys after `module.`;
    /// pass `""` for checkpoints saved from a bare BERT.
    pub fn from_pretrained(
        model_dir: &Path,
        options: LinkerOptions,
        checkpoint_prefix: &str,
        device: &Device,
    ) -> LinkerResult<Self> {
        let weights_path = checkpoint::locate(model_dir)?;
        let bert_config = BertConfig::from_model_dir(model_dir)?;

        let entity_encoder = BertEncoder::new(bert_config, device)?;
        let state = checkpoint::normalize(checkpoint::read(&weights_path, device)?, checkpoint_prefix);
        let report = entity_encoder.load_state(&state)?;
        if report.loaded.is_empty() {
            tracing::warn!(
                "No checkpoint tensor matched an encoder parameter in {}",
                weights_path.display()
            );
        }

        Self::new(entity_encoder, options)
    }

    /// Fork the mention encoder off `entity_encoder` and assemble the linker.
    pub fn new(entity_encoder: BertEncoder, options: LinkerOptions) -> LinkerResult<Self> {
        if !options.inv_temperature.is_finite() || options.inv_temperature <= 0.0 {
            return Err(LinkerError::ConfigError {
                message: format!("inv_temperature must be > 0, got {}", options.inv_temperature),
            });
        }
        if !options.additive_margin.is_finite() {
            return Err(LinkerError::ConfigError {
                message: format!("additive_margin must be finite, got {}", options.additive_margin),
            });
        }

        let mention_encoder = entity_encoder
            .deep_copy()?
            .migrate_token_type_table(options.mention_type_vocab_size)?;

        tracing::info!(
            "Entity linker ready: pooling={}, margin={}, inv_temperature={}, hidden_size={}",
            options.pooling,
            options.additive_margin,
            options.inv_temperature,
            entity_encoder.hidden_size()
        );

        Ok(Self {
            mention_encoder,
            entity_encoder,
            pooling: options.pooling,
            pool: options.pooling.pool_fn(),
            additive_margin: options.additive_margin,
            inv_temperature: options.inv_temperature,
        })
    }

    pub fn pooling(&self) -> Pooling {
        self.pooling
    }

    pub fn mention_encoder(&self) -> &BertEncoder {
        &self.mention_encoder
    }

    pub fn entity_encoder(&self) -> &BertEncoder {
        &self.entity_encoder
    }

    pub fn device(&self) -> &Device {
        self.entity_encoder.device()
    }

    fn hidden_size(&self) -> usize {
        self.entity_encoder.hidden_size()
    }

    /// Parameters of both encoders, for an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.mention_encoder.trainable_vars();
        vars.extend(self.entity_encoder.trainable_vars());
        vars
    }

    /// (N, H) unit vectors from the mention encoder.
    pub fn encode_mentions(&self, input: &EncoderInput, mode: Mode) -> LinkerResult<Tensor> {
        let hidden = self.mention_encoder.forward(input, mode)?;
        (self.pool)(&hidden, &input.attention_mask)
    }

    /// (N, H) unit vectors from the entity encoder.
    pub fn encode_entities(&self, input: &EncoderInput, mode: Mode) -> LinkerResult<Tensor> {
        let hidden = self.entity_encoder.forward(input, mode)?;
        (self.pool)(&hidden, &input.attention_mask)
    }

    /// Dispatch on the inputs supplied.
    ///
    /// With `mentions` absent this is entity-only inference: `mode` must be
    /// `Eval` and `candidates` must be absent. Otherwise it is the contrastive
    /// forward; `None` candidates means C = 0.
    pub fn forward(
        &self,
        entities: &EncoderInput,
        mentions: Option<&EncoderInput>,
        candidates: Option<&[EncoderInput]>,
        mode: Mode,
    ) -> LinkerResult<LinkerForward> {
        match mentions {
            None => {
                if candidates.is_some() {
                    return Err(LinkerError::PreconditionViolation {
                        message: "entity-only inference does not take candidate sets".to_string(),
                    });
                }
                self.embed_entities(entities, mode).map(LinkerForward::Entities)
            }
            Some(mentions) => self
                .contrastive(mentions, entities, candidates.unwrap_or(&[]), mode)
                .map(LinkerForward::Contrastive),
        }
    }

    /// Entity-only inference: detached (B, H) unit vectors.
    pub fn embed_entities(&self, entities: &EncoderInput, mode: Mode) -> LinkerResult<Tensor> {
        if mode.is_training() {
            return Err(LinkerError::PreconditionViolation {
                message: "entity-only inference requires eval mode".to_string(),
            });
        }
        Ok(self.encode_entities(entities, Mode::Eval)?.detach())
    }

    /// Contrastive forward: (B, B + C) logits with gold on the diagonal.
    pub fn contrastive(
        &self,
        mentions: &EncoderInput,
        entities: &EncoderInput,
        candidates: &[EncoderInput],
        mode: Mode,
    ) -> LinkerResult<LinkerOutput> {
        let batch_size = mentions.batch_size();
        if entities.batch_size() != batch_size {
            return Err(LinkerError::PreconditionViolation {
                message: format!(
                    "{} mentions but {} gold entities",
                    batch_size,
                    entities.batch_size()
                ),
            });
        }
        let num_candidates = if candidates.is_empty() {
            0
        } else {
            candidate_cardinality(candidates, batch_size)?
        };

        let mention_vectors = self.encode_mentions(mentions, mode)?;
        let entity_vectors = self.encode_entities(entities, mode)?;

        let mut cosine = mention_vectors
            .matmul(&entity_vectors.t()?)
            .map_err(tensor_op("in-batch scores"))?;
        if mode.is_training() && self.additive_margin != 0.0 {
            let margin = diagonal(batch_size, self.additive_margin, cosine.device())?;
            cosine = cosine.sub(&margin)?;
        }

        let candidate_vectors = if num_candidates > 0 {
            let flat = self.encode_entities(&EncoderInput::concat(candidates)?, mode)?;
            Some(flat.reshape((batch_size, num_candidates, self.hidden_size()))?)
        } else {
            None
        };

        let scores = match &candidate_vectors {
            Some(cands) => {
                let negatives = batched_scores(&mention_vectors, cands)?;
                Tensor::cat(&[&cosine, &negatives], 1).map_err(tensor_op("join negative scores"))?
            }
            None => cosine,
        };
        let logits = scores.affine(self.inv_temperature, 0.0)?;
        let labels = Tensor::arange(0u32, batch_size as u32, logits.device())?;

        Ok(LinkerOutput {
            logits,
            labels,
            embeddings: DeepEmbeddings {
                mention_vectors,
                entity_vectors,
                candidate_vectors,
            },
        })
    }

    /// Score mentions against per-sample candidate pools.
    ///
    /// Returns detached (B, C) cosine scores and ranking metrics for the gold
    /// indices in `labels`.
    pub fn predict(
        &self,
        mentions: &EncoderInput,
        candidate_pools: &[EncoderInput],
        labels: &Tensor,
    ) -> LinkerResult<(Tensor, RankingMetrics)> {
        let batch_size = mentions.batch_size();
        let num_candidates = candidate_cardinality(candidate_pools, batch_size)?;
        if num_candidates == 0 {
            return Err(LinkerError::PreconditionViolation {
                message: "prediction needs at least one candidate per mention".to_string(),
            });
        }

        let mention_vectors = self.encode_mentions(mentions, Mode::Eval)?.detach();
        let pool_vectors = self
            .encode_entities(&EncoderInput::concat(candidate_pools)?, Mode::Eval)?
            .detach()
            .reshape((batch_size, num_candidates, self.hidden_size()))?;

        let scores = batched_scores(&mention_vectors, &pool_vectors)?;
        let metrics = compute_metric(&scores, labels)?;
        tracing::debug!("Predicted {} mentions: {}", batch_size, metrics.summary());
        Ok((scores, metrics))
    }

    /// Save both encoders to one safetensors file.
    pub fn save(&self, path: &Path) -> LinkerResult<()> {
        let mut state: HashMap<String, Tensor> = HashMap::new();
        for (prefix, encoder) in [
            (MENTION_ENCODER_PREFIX, &self.mention_encoder),
            (ENTITY_ENCODER_PREFIX, &self.entity_encoder),
        ] {
            for (name, tensor) in encoder.state_dict()? {
                state.insert(format!("{}{}", prefix, name), tensor);
            }
        }
        candle_core::safetensors::save(&state, path).map_err(|e| LinkerError::SerializationError {
            message: format!("failed to save {}: {}", path.display(), e),
        })?;
        tracing::info!("Saved {} tensors to {}", state.len(), path.display());
        Ok(())
    }

    /// Restore both encoders from a file written by [`EntityLinker::save`].
    ///
    /// Both encoders are shape-checked before either is written, so a failed
    /// restore leaves the model unchanged. Returns the (mention, entity) merge
    /// reports.
    pub fn restore(&self, path: &Path) -> LinkerResult<(MergeReport, MergeReport)> {
        let state = checkpoint::read(path, self.device())?;
        let mention_state = checkpoint::select_prefixed(&state, MENTION_ENCODER_PREFIX);
        let entity_state = checkpoint::select_prefixed(&state, ENTITY_ENCODER_PREFIX);
        self.mention_encoder.check_state(&mention_state)?;
        self.entity_encoder.check_state(&entity_state)?;

        let mention = self.mention_encoder.load_state(&mention_state)?;
        let entity = self.entity_encoder.load_state(&entity_state)?;
        Ok((mention, entity))
    }
}

/// (n, n) matrix with `value` on the diagonal.
fn diagonal(n: usize, value: f64, device: &Device) -> LinkerResult<Tensor> {
    let mut data = vec![0f32; n * n];
    for i in 0..n {
        data[i * n + i] = value as f32;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

/// (B, H) x (B, C, H) → (B, C) row-wise dot products.
fn batched_scores(queries: &Tensor, candidates: &Tensor) -> LinkerResult<Tensor> {
    let keys = candidates.transpose(1, 2)?.contiguous()?;
    Ok(queries
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .matmul(&keys.to_dtype(DType::F32)?)
        .map_err(tensor_op("candidate scores"))?
        .squeeze(1)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagonal() {
        let d: Vec<Vec<f32>> = diagonal(3, 0.02, &Device::Cpu).unwrap().to_vec2().unwrap();
        for (i, row) in d.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 0.02 } else { 0.0 };
                assert_eq!(*v, expected);
            }
        }
    }

    #[test]
    fn test_batched_scores_matches_manual_dot() {
        let q = Tensor::from_vec(vec![1.0f32, 0.0, 0.0, 1.0], (2, 2), &Device::Cpu).unwrap();
        let c = Tensor::from_vec(
            vec![0.5f32, 0.5, -1.0, 0.0, 0.25, 0.75, 0.0, -2.0],
            (2, 2, 2),
            &Device::Cpu,
        )
        .unwrap();
        let s: Vec<Vec<f32>> = batched_scores(&q, &c).unwrap().to_vec2().unwrap();
        assert_eq!(s, vec![vec![0.5, -1.0], vec![0.75, -2.0]]);
    }

    #[test]
    fn test_default_options() {
        let options = LinkerOptions::default();
        assert_eq!(options.pooling, Pooling::Mean);
        assert_eq!(options.additive_margin, 0.02);
        assert_eq!(options.inv_temperature, 0.05);
        assert_eq!(options.mention_type_vocab_size, 3);
    }
}
