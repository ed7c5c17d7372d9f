//! Ranking metrics for scored candidate lists.
//!
//! Each row of a (B, C) score matrix is sorted in descending order (stable,
//! so ties keep their original order) and the 1-based position of the gold
//! candidate is its rank. NaN scores rank last. Batch metrics are means over rows, rounded to four
//! decimals.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{LinkerError, LinkerResult};

/// Batch-averaged ranking metrics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RankingMetrics {
    pub mean_rank: f64,
    pub mrr: f64,
    pub hit1: f64,
    pub hit3: f64,
    pub hit10: f64,
}

impl RankingMetrics {
    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "mean_rank={:.4}, mrr={:.4}, hit@1={:.4}, hit@3={:.4}, hit@10={:.4}",
            self.mean_rank, self.mrr, self.hit1, self.hit3, self.hit10
        )
    }

    fn from_ranks(ranks: &[usize]) -> Self {
        let mut sums = RankSums::default();
        sums.add(ranks);
        sums.metrics()
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Running totals over ranks.
#[derive(Debug, Clone, Default)]
struct RankSums {
    rank: f64,
    reciprocal_rank: f64,
    hit1: usize,
    hit3: usize,
    hit10: usize,
    count: usize,
}

impl RankSums {
    fn add(&mut self, ranks: &[usize]) {
        for &rank in ranks {
            self.rank += rank as f64;
            self.reciprocal_rank += 1.0 / rank as f64;
            self.hit1 += usize::from(rank <= 1);
            self.hit3 += usize::from(rank <= 3);
            self.hit10 += usize::from(rank <= 10);
            self.count += 1;
        }
    }

    fn metrics(&self) -> RankingMetrics {
        if self.count == 0 {
            return RankingMetrics::default();
        }
        let n = self.count as f64;
        RankingMetrics {
            mean_rank: round4(self.rank / n),
            mrr: round4(self.reciprocal_rank / n),
            hit1: round4(self.hit1 as f64 / n),
            hit3: round4(self.hit3 as f64 / n),
            hit10: round4(self.hit10 as f64 / n),
        }
    }
}

/// NaN scores rank below every real score.
fn sort_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}

/// 1-based rank of each row's gold candidate.
pub fn target_ranks(scores: &[Vec<f32>], labels: &[i64]) -> LinkerResult<Vec<usize>> {
    if scores.len() != labels.len() {
        return Err(LinkerError::PreconditionViolation {
            message: format!("{} score rows but {} labels", scores.len(), labels.len()),
        });
    }

    scores
        .iter()
        .zip(labels.iter())
        .enumerate()
        .map(|(row, (row_scores, &label))| {
            let num_candidates = row_scores.len();
            let broken = || LinkerError::RankInvariant {
                row,
                label,
                num_candidates,
            };
            let gold = usize::try_from(label).map_err(|_| broken())?;
            if gold >= num_candidates {
                return Err(broken());
            }

            let mut order: Vec<usize> = (0..num_candidates).collect();
            order.sort_by(|&a, &b| sort_key(row_scores[b]).total_cmp(&sort_key(row_scores[a])));
            order
                .iter()
                .position(|&idx| idx == gold)
                .map(|pos| pos + 1)
                .ok_or_else(broken)
        })
        .collect()
}

/// Metrics over plain score rows.
pub fn rank_metrics(scores: &[Vec<f32>], labels: &[i64]) -> LinkerResult<RankingMetrics> {
    if scores.is_empty() {
        return Err(LinkerError::PreconditionViolation {
            message: "cannot rank an empty batch".to_string(),
        });
    }
    Ok(RankingMetrics::from_ranks(&target_ranks(scores, labels)?))
}

/// Metrics for a (B, C) score tensor and (B,) integer gold indices.
pub fn compute_metric(scores: &Tensor, labels: &Tensor) -> LinkerResult<RankingMetrics> {
    let rows: Vec<Vec<f32>> = scores.to_dtype(DType::F32)?.to_vec2()?;
    let labels: Vec<i64> = labels.to_dtype(DType::I64)?.to_vec1()?;
    rank_metrics(&rows, &labels)
}

/// Accumulates ranks across batches so the final metrics weight every
/// sample equally regardless of batch size.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    sums: RankSums,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rank one batch, fold it into the totals, and return the batch metrics.
    pub fn update(&mut self, scores: &Tensor, labels: &Tensor) -> LinkerResult<RankingMetrics> {
        let rows: Vec<Vec<f32>> = scores.to_dtype(DType::F32)?.to_vec2()?;
        let labels: Vec<i64> = labels.to_dtype(DType::I64)?.to_vec1()?;
        let ranks = target_ranks(&rows, &labels)?;
        self.sums.add(&ranks);
        Ok(RankingMetrics::from_ranks(&ranks))
    }

    pub fn num_samples(&self) -> usize {
        self.sums.count
    }

    pub fn metrics(&self) -> RankingMetrics {
        self.sums.metrics()
    }
}
