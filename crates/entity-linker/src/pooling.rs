//! Sequence pooling: (B, L, H) hidden states + (B, L) mask → (B, H) unit vectors.
//!
//! | Mode | Reduction | Mask use |
//! |------|-----------|----------|
//! | `cls` | position 0 | ignored |
//! | `max` | element-wise max over L | padding overwritten with [`MAX_POOL_SENTINEL`] |
//! | `mean` | masked sum / token count | count floored at [`MEAN_POOL_MIN_COUNT`] |
//!
//! Every pooled vector is L2-normalized before it leaves this module, so a dot
//! product of two pooled vectors is their cosine similarity.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{LinkerError, LinkerResult};

/// Value written into padded positions before max pooling.
pub const MAX_POOL_SENTINEL: f64 = -100.0;

/// Floor for the real-token count in mean pooling.
pub const MEAN_POOL_MIN_COUNT: f64 = 1e-4;

/// Floor for the L2 norm divisor.
pub const NORMALIZE_EPS: f64 = 1e-12;

/// Pooling function selected once at model construction.
pub type PoolFn = fn(&Tensor, &Tensor) -> LinkerResult<Tensor>;

/// Pooling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Pooling {
    /// First token ([CLS]).
    Cls,
    /// Element-wise maximum over real tokens.
    Max,
    /// Average over real tokens.
    #[default]
    Mean,
}

impl Pooling {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pooling::Cls => "cls",
            Pooling::Max => "max",
            Pooling::Mean => "mean",
        }
    }

    /// The pure pooling function for this mode.
    pub fn pool_fn(self) -> PoolFn {
        match self {
            Pooling::Cls => cls_pool,
            Pooling::Max => max_pool,
            Pooling::Mean => mean_pool,
        }
    }

    /// Pool and normalize.
    pub fn pool(self, hidden_states: &Tensor, attention_mask: &Tensor) -> LinkerResult<Tensor> {
        (self.pool_fn())(hidden_states, attention_mask)
    }
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pooling {
    type Err = LinkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cls" => Ok(Pooling::Cls),
            "max" => Ok(Pooling::Max),
            "mean" => Ok(Pooling::Mean),
            _ => {
                tracing::error!("Unknown pooling mode: {}", s);
                Err(LinkerError::UnknownPooling {
                    mode: s.to_string(),
                })
            }
        }
    }
}

impl TryFrom<String> for Pooling {
    type Error = LinkerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Pooling> for String {
    fn from(value: Pooling) -> Self {
        value.as_str().to_string()
    }
}

/// Take the vector at position 0.
pub fn cls_pool(hidden_states: &Tensor, _attention_mask: &Tensor) -> LinkerResult<Tensor> {
    let first = hidden_states.narrow(1, 0, 1)?.squeeze(1)?;
    l2_normalize(&first)
}

/// Overwrite padding with the sentinel, then take the max over the sequence.
pub fn max_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> LinkerResult<Tensor> {
    let (batch, seq_len, hidden) = hidden_states.dims3()?;
    let mask = attention_mask
        .to_dtype(DType::U32)?
        .unsqueeze(2)?
        .broadcast_as((batch, seq_len, hidden))?
        .contiguous()?;
    let sentinel = hidden_states.zeros_like()?.affine(1.0, MAX_POOL_SENTINEL)?;
    let filled = mask.where_cond(hidden_states, &sentinel)?;
    l2_normalize(&filled.max(1)?)
}

/// Masked average over real tokens.
pub fn mean_pool(hidden_states: &Tensor, attention_mask: &Tensor) -> LinkerResult<Tensor> {
    let mask = attention_mask
        .to_dtype(hidden_states.dtype())?
        .unsqueeze(2)?
        .broadcast_as(hidden_states.shape())?;
    let summed = hidden_states.mul(&mask)?.sum(1)?;
    let counts = floor_at(&mask.sum(1)?, MEAN_POOL_MIN_COUNT)?;
    l2_normalize(&summed.div(&counts)?)
}

/// L2-normalize along the last dimension.
pub fn l2_normalize(x: &Tensor) -> LinkerResult<Tensor> {
    let norm = x.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(x.broadcast_div(&floor_at(&norm, NORMALIZE_EPS)?)?)
}

/// Element-wise `max(t, min)` with a floor tensor matching `t`'s dtype and device.
fn floor_at(t: &Tensor, min: f64) -> LinkerResult<Tensor> {
    let floor = t.zeros_like()?.affine(1.0, min)?;
    Ok(t.maximum(&floor)?)
}
