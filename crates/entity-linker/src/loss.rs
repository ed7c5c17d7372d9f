//! Contrastive objective over [`LinkerOutput`] logits.

use candle_core::{DType, Tensor};

use crate::error::{tensor_op, LinkerResult};
use crate::model::LinkerOutput;

/// Loss and in-batch accuracy of one step, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossComponents {
    /// Cross-entropy of the gold column.
    pub contrastive: f32,
    /// Fraction of rows whose gold column has the highest logit.
    pub accuracy: f32,
}

/// Mean cross-entropy of the gold column over the B × (B + C) logits.
pub fn contrastive_loss(output: &LinkerOutput) -> LinkerResult<Tensor> {
    candle_nn::loss::cross_entropy(&output.logits, &output.labels).map_err(tensor_op("cross entropy"))
}

/// Fraction of rows where argmax equals the label.
pub fn in_batch_accuracy(output: &LinkerOutput) -> LinkerResult<f32> {
    let batch_size = output.labels.dims1()?;
    if batch_size == 0 {
        return Ok(0.0);
    }
    let predicted = output.logits.argmax(1)?.to_dtype(DType::U32)?;
    let correct = predicted
        .eq(&output.labels.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(correct / batch_size as f32)
}

/// Loss tensor for backprop plus scalar components.
pub fn compute(output: &LinkerOutput) -> LinkerResult<(Tensor, LossComponents)> {
    let loss = contrastive_loss(output)?;
    let components = LossComponents {
        contrastive: loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        accuracy: in_batch_accuracy(output)?,
    };
    Ok((loss, components))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeepEmbeddings;
    use candle_core::Device;

    fn output(logits: Vec<f32>, b: usize, cols: usize) -> LinkerOutput {
        let zeros = Tensor::zeros((b, 2), DType::F32, &Device::Cpu).unwrap();
        LinkerOutput {
            logits: Tensor::from_vec(logits, (b, cols), &Device::Cpu).unwrap(),
            labels: Tensor::arange(0u32, b as u32, &Device::Cpu).unwrap(),
            embeddings: DeepEmbeddings {
                mention_vectors: zeros.clone(),
                entity_vectors: zeros,
                candidate_vectors: None,
            },
        }
    }

    #[test]
    fn test_uniform_logits_give_log_columns() {
        let out = output(vec![0.0; 2 * 3], 2, 3);
        let loss = contrastive_loss(&out).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 3.0f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_confident_diagonal_has_low_loss_and_full_accuracy() {
        let out = output(vec![10.0, 0.0, 0.0, 0.0, 10.0, 0.0], 2, 3);
        let (loss, components) = compute(&out).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() < 1e-3);
        assert_eq!(components.accuracy, 1.0);
    }

    #[test]
    fn test_accuracy_counts_misses() {
        let out = output(vec![0.0, 5.0, 0.0, 5.0], 2, 2);
        assert_eq!(in_batch_accuracy(&out).unwrap(), 0.0);
    }
}
