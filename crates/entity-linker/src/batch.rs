//! Tokenized encoder inputs and candidate-set bookkeeping.

use candle_core::{Device, Tensor};

use crate::error::{tensor_op, LinkerError, LinkerResult};

/// One tokenized batch: three (N, L) integer tensors of identical shape.
#[derive(Debug, Clone)]
pub struct EncoderInput {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub token_type_ids: Tensor,
}

impl EncoderInput {
    pub fn new(input_ids: Tensor, attention_mask: Tensor, token_type_ids: Tensor) -> LinkerResult<Self> {
        let dims = input_ids.dims2()?;
        for (name, t) in [("attention_mask", &attention_mask), ("token_type_ids", &token_type_ids)] {
            if t.dims2()? != dims {
                return Err(LinkerError::PreconditionViolation {
                    message: format!(
                        "{} has shape {:?}, input_ids has shape {:?}",
                        name,
                        t.dims(),
                        input_ids.dims()
                    ),
                });
            }
        }
        Ok(Self {
            input_ids,
            attention_mask,
            token_type_ids,
        })
    }

    /// Build from padded rows. Every row must have the same length.
    pub fn from_rows(
        input_ids: &[Vec<u32>],
        attention_mask: &[Vec<u32>],
        token_type_ids: &[Vec<u32>],
        device: &Device,
    ) -> LinkerResult<Self> {
        let seq_len = input_ids.first().map(|r| r.len()).unwrap_or(0);
        let to_tensor = |name: &str, rows: &[Vec<u32>]| -> LinkerResult<Tensor> {
            if rows.len() != input_ids.len() || rows.iter().any(|r| r.len() != seq_len) {
                return Err(LinkerError::PreconditionViolation {
                    message: format!("{} rows must be {} x {}", name, input_ids.len(), seq_len),
                });
            }
            let flat: Vec<u32> = rows.iter().flatten().copied().collect();
            Ok(Tensor::from_vec(flat, (rows.len(), seq_len), device)?)
        };
        Self::new(
            to_tensor("input_ids", input_ids)?,
            to_tensor("attention_mask", attention_mask)?,
            to_tensor("token_type_ids", token_type_ids)?,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims().get(1).copied().unwrap_or(0)
    }

    pub fn device(&self) -> &Device {
        self.input_ids.device()
    }

    /// Stack batches along the row axis. Sequence lengths must agree.
    pub fn concat(inputs: &[EncoderInput]) -> LinkerResult<Self> {
        if inputs.is_empty() {
            return Err(LinkerError::PreconditionViolation {
                message: "cannot concatenate zero inputs".to_string(),
            });
        }
        let stack = |pick: fn(&EncoderInput) -> &Tensor| -> LinkerResult<Tensor> {
            let parts: Vec<&Tensor> = inputs.iter().map(pick).collect();
            Tensor::cat(&parts, 0).map_err(tensor_op("concatenate candidate sets"))
        };
        Self::new(
            stack(|i| &i.input_ids)?,
            stack(|i| &i.attention_mask)?,
            stack(|i| &i.token_type_ids)?,
        )
    }
}

/// Validate per-sample candidate sets and return their shared cardinality C.
///
/// Expects exactly one set per sample; every set must hold the same, nonzero
/// number of rows.
pub fn candidate_cardinality(sets: &[EncoderInput], batch_size: usize) -> LinkerResult<usize> {
    if sets.len() != batch_size {
        return Err(LinkerError::PreconditionViolation {
            message: format!("{} candidate sets for batch of {}", sets.len(), batch_size),
        });
    }
    let expected = match sets.first() {
        Some(first) => first.batch_size(),
        None => return Ok(0),
    };
    if expected == 0 {
        return Err(LinkerError::PreconditionViolation {
            message: "candidate sets must not be empty".to_string(),
        });
    }
    for (index, set) in sets.iter().enumerate() {
        if set.batch_size() != expected {
            return Err(LinkerError::CandidateSetMismatch {
                index,
                expected,
                actual: set.batch_size(),
            });
        }
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn rows(n: usize, len: usize) -> EncoderInput {
        let ids = vec![vec![1u32; len]; n];
        EncoderInput::from_rows(&ids, &ids, &vec![vec![0u32; len]; n], &Device::Cpu).unwrap()
    }

    #[test]
    fn test_from_rows_shapes() {
        let input = rows(3, 4);
        assert_eq!(input.batch_size(), 3);
        assert_eq!(input.seq_len(), 4);
        assert_eq!(input.input_ids.dtype(), DType::U32);
    }

    #[test]
    fn test_from_rows_rejects_ragged() {
        let err = EncoderInput::from_rows(
            &[vec![1, 2], vec![1]],
            &[vec![1, 1], vec![1]],
            &[vec![0, 0], vec![0]],
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, LinkerError::PreconditionViolation { .. }));
    }

    #[test]
    fn test_new_rejects_mismatched_mask() {
        let ids = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        let mask = Tensor::zeros((2, 4), DType::U32, &Device::Cpu).unwrap();
        assert!(EncoderInput::new(ids.clone(), mask, ids).is_err());
    }

    #[test]
    fn test_concat_stacks_rows() {
        let joined = EncoderInput::concat(&[rows(2, 5), rows(3, 5)]).unwrap();
        assert_eq!(joined.batch_size(), 5);
        assert_eq!(joined.seq_len(), 5);
    }

    #[test]
    fn test_cardinality_uniform() {
        assert_eq!(candidate_cardinality(&[rows(2, 4), rows(2, 4)], 2).unwrap(), 2);
        assert_eq!(candidate_cardinality(&[], 0).unwrap(), 0);
    }

    #[test]
    fn test_cardinality_mismatch_names_offending_set() {
        let err = candidate_cardinality(&[rows(2, 4), rows(2, 4), rows(3, 4)], 3).unwrap_err();
        assert!(matches!(
            err,
            LinkerError::CandidateSetMismatch { index: 2, expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn test_cardinality_requires_one_set_per_sample() {
        let err = candidate_cardinality(&[rows(2, 4)], 2).unwrap_err();
        assert!(matches!(err, LinkerError::PreconditionViolation { .. }));
    }
}
