//! BERT building blocks: embeddings, self-attention, feed-forward, encoder layer.
//!
//! Parameters are created through a `VarBuilder` backed by the encoder's
//! `VarMap`, under Hugging Face BERT names (`embeddings.word_embeddings.weight`,
//! `encoder.layer.{i}.attention.self.query.weight`, ...), so a pretrained
//! checkpoint merges by name. Fresh parameters follow BERT's initialization:
//! weights ~ N(0, initializer_range), biases 0, LayerNorm weight 1 / bias 0.

use candle_core::{DType, Tensor, D};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder};

use crate::error::LinkerResult;
use crate::mode::Mode;

use super::config::{Activation, BertConfig};

/// Additive attention bias for padded key positions.
const MASKED_ATTENTION_BIAS: f64 = -10000.0;

/// LayerNorm parameters.
#[derive(Debug, Clone)]
pub struct LayerNormWeights {
    pub weight: Tensor,
    pub bias: Tensor,
    pub eps: f64,
}

impl LayerNormWeights {
    fn load(vb: VarBuilder, size: usize, eps: f64) -> LinkerResult<Self> {
        Ok(Self {
            weight: vb.get_with_hints(size, "weight", Init::Const(1.0))?,
            bias: vb.get_with_hints(size, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    /// LayerNorm over the last dimension.
    pub fn forward(&self, x: &Tensor) -> LinkerResult<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normalized = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        Ok(normalized.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

fn dense(vb: VarBuilder, in_dim: usize, out_dim: usize, init_std: f64) -> LinkerResult<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

fn embedding(vb: VarBuilder, rows: usize, hidden: usize, init_std: f64) -> LinkerResult<Embedding> {
    let table = vb.get_with_hints(
        (rows, hidden),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )?;
    Ok(Embedding::new(table, hidden))
}

/// Dropout active only in training mode.
pub(crate) fn dropout(x: &Tensor, p: f64, mode: Mode) -> LinkerResult<Tensor> {
    if mode.is_training() && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p as f32)?)
    } else {
        Ok(x.clone())
    }
}

/// (B, L) 0/1 mask → (B, 1, 1, L) additive bias: 0 for real tokens, -10000 for padding.
pub fn extended_attention_mask(attention_mask: &Tensor) -> LinkerResult<Tensor> {
    let (batch, seq_len) = attention_mask.dims2()?;
    Ok(attention_mask
        .to_dtype(DType::F32)?
        .affine(-MASKED_ATTENTION_BIAS, MASKED_ATTENTION_BIAS)?
        .reshape((batch, 1, 1, seq_len))?)
}

/// Word + position + segment-type embeddings, then LayerNorm.
#[derive(Debug, Clone)]
pub struct BertEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNormWeights,
    dropout_prob: f64,
}

impl BertEmbeddings {
    pub fn load(vb: VarBuilder, config: &BertConfig) -> LinkerResult<Self> {
        let std = config.initializer_range;
        Ok(Self {
            word_embeddings: embedding(
                vb.pp("word_embeddings"),
                config.vocab_size,
                config.hidden_size,
                std,
            )?,
            position_embeddings: embedding(
                vb.pp("position_embeddings"),
                config.max_position_embeddings,
                config.hidden_size,
                std,
            )?,
            token_type_embeddings: embedding(
                vb.pp("token_type_embeddings"),
                config.type_vocab_size,
                config.hidden_size,
                std,
            )?,
            layer_norm: LayerNormWeights::load(
                vb.pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
            dropout_prob: config.hidden_dropout_prob,
        })
    }

    pub fn forward(&self, input_ids: &Tensor, token_type_ids: &Tensor, mode: Mode) -> LinkerResult<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        let types = self.token_type_embeddings.forward(token_type_ids)?;

        let embeddings = words.broadcast_add(&positions)?.add(&types)?;
        let embeddings = self.layer_norm.forward(&embeddings)?;
        dropout(&embeddings, self.dropout_prob, mode)
    }

    pub fn token_type_table(&self) -> &Tensor {
        self.token_type_embeddings.embeddings()
    }
}

/// Multi-head self-attention with output projection and Add & Norm.
#[derive(Debug, Clone)]
pub struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    layer_norm: LayerNormWeights,
    num_heads: usize,
    head_dim: usize,
    attention_dropout: f64,
    hidden_dropout: f64,
}

impl BertSelfAttention {
    pub fn load(vb: VarBuilder, config: &BertConfig) -> LinkerResult<Self> {
        let hidden = config.hidden_size;
        let std = config.initializer_range;
        let self_vb = vb.pp("self");
        let output_vb = vb.pp("output");
        Ok(Self {
            query: dense(self_vb.pp("query"), hidden, hidden, std)?,
            key: dense(self_vb.pp("key"), hidden, hidden, std)?,
            value: dense(self_vb.pp("value"), hidden, hidden, std)?,
            output: dense(output_vb.pp("dense"), hidden, hidden, std)?,
            layer_norm: LayerNormWeights::load(output_vb.pp("LayerNorm"), hidden, config.layer_norm_eps)?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
            attention_dropout: config.attention_probs_dropout_prob,
            hidden_dropout: config.hidden_dropout_prob,
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> LinkerResult<Tensor> {
        Ok(x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    pub fn forward(&self, hidden_states: &Tensor, extended_mask: &Tensor, mode: Mode) -> LinkerResult<Tensor> {
        let (batch, seq_len, hidden) = hidden_states.dims3()?;

        let query = self.split_heads(&self.query.forward(hidden_states)?, batch, seq_len)?;
        let key = self.split_heads(&self.key.forward(hidden_states)?, batch, seq_len)?;
        let value = self.split_heads(&self.value.forward(hidden_states)?, batch, seq_len)?;

        // Q @ K^T / sqrt(d)
        let scores = query
            .matmul(&key.t()?)?
            .affine(1.0 / (self.head_dim as f64).sqrt(), 0.0)?
            .broadcast_add(extended_mask)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let probs = dropout(&probs, self.attention_dropout, mode)?;

        let context = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .reshape((batch, seq_len, hidden))?;

        let projected = dropout(&self.output.forward(&context)?, self.hidden_dropout, mode)?;
        self.layer_norm.forward(&(projected + hidden_states)?)
    }
}

/// Intermediate projection, activation, output projection and Add & Norm.
#[derive(Debug, Clone)]
pub struct BertFeedForward {
    intermediate: Linear,
    output: Linear,
    layer_norm: LayerNormWeights,
    activation: Activation,
    hidden_dropout: f64,
}

impl BertFeedForward {
    pub fn load(vb: VarBuilder, config: &BertConfig) -> LinkerResult<Self> {
        let std = config.initializer_range;
        let output_vb = vb.pp("output");
        Ok(Self {
            intermediate: dense(
                vb.pp("intermediate").pp("dense"),
                config.hidden_size,
                config.intermediate_size,
                std,
            )?,
            output: dense(
                output_vb.pp("dense"),
                config.intermediate_size,
                config.hidden_size,
                std,
            )?,
            layer_norm: LayerNormWeights::load(
                output_vb.pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
            activation: config.activation()?,
            hidden_dropout: config.hidden_dropout_prob,
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, mode: Mode) -> LinkerResult<Tensor> {
        let intermediate = self.intermediate.forward(hidden_states)?;
        let activated = match self.activation {
            Activation::Gelu => intermediate.gelu_erf()?,
            Activation::GeluTanh => intermediate.gelu()?,
            Activation::Relu => intermediate.relu()?,
        };
        let output = dropout(&self.output.forward(&activated)?, self.hidden_dropout, mode)?;
        self.layer_norm.forward(&(output + hidden_states)?)
    }
}

/// One post-LN transformer layer.
#[derive(Debug, Clone)]
pub struct BertLayer {
    attention: BertSelfAttention,
    feed_forward: BertFeedForward,
}

impl BertLayer {
    pub fn load(vb: VarBuilder, config: &BertConfig) -> LinkerResult<Self> {
        Ok(Self {
            attention: BertSelfAttention::load(vb.pp("attention"), config)?,
            feed_forward: BertFeedForward::load(vb.clone(), config)?,
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, extended_mask: &Tensor, mode: Mode) -> LinkerResult<Tensor> {
        let attended = self.attention.forward(hidden_states, extended_mask, mode)?;
        self.feed_forward.forward(&attended, mode)
    }
}
