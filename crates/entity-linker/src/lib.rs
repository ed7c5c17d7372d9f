//! Zero-shot entity linking with a dual-encoder contrastive model.
//!
//! A mention (with its context) and a knowledge-base entity description are
//! encoded by two BERT towers into a shared space of unit vectors. Training
//! pulls each mention toward its gold entity against in-batch negatives and
//! optional hard-negative candidates; evaluation ranks candidate pools by
//! cosine similarity.
//!
//! # Architecture
//!
//! - **BertEncoder**: trainable BERT over a candle `VarMap`
//! - **Pooling**: cls / max / mean reduction to L2-normalized vectors
//! - **EntityLinker**: both towers, contrastive logits, prediction
//! - **checkpoint**: pretrained weight discovery and tolerant merge
//! - **metrics**: mean rank, MRR and hit@k
//!
//! Tokenization, dataset loading and the training loop are left to the
//! caller, which feeds [`EncoderInput`] batches and consumes
//! [`LinkerOutput`] / [`RankingMetrics`].
//!
//! # Example
//!
//! ```rust
//! use entity_linker::{compute_metric, Pooling};
//! use candle_core::{Device, Tensor};
//!
//! assert_eq!("max".parse::<Pooling>().unwrap(), Pooling::Max);
//!
//! let scores = Tensor::new(&[[0.1f32, 0.9]], &Device::Cpu).unwrap();
//! let labels = Tensor::new(&[0u32], &Device::Cpu).unwrap();
//! let metrics = compute_metric(&scores, &labels).unwrap();
//! assert_eq!(metrics.mean_rank, 2.0);
//! assert_eq!(metrics.mrr, 0.5);
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod mode;
pub mod model;
pub mod pooling;

pub use batch::{candidate_cardinality, EncoderInput};
pub use checkpoint::MergeReport;
pub use config::{DeviceSpec, LinkerConfig};
pub use encoder::{BertConfig, BertEncoder};
pub use error::{LinkerError, LinkerResult};
pub use loss::{contrastive_loss, LossComponents};
pub use metrics::{compute_metric, MetricAccumulator, RankingMetrics};
pub use mode::Mode;
pub use model::{
    DeepEmbeddings, EntityLinker, LinkerForward, LinkerOptions, LinkerOutput, ADDITIVE_MARGIN,
    INV_TEMPERATURE, MENTION_TYPE_VOCAB_SIZE,
};
pub use pooling::{l2_normalize, Pooling};
