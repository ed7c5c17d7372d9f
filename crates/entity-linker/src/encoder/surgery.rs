//! Structural edits on an encoder: forking and segment-type table growth.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{tensor_op, LinkerError, LinkerResult};

use super::{lock, BertEncoder};

/// Name of the segment-type embedding table.
pub const TOKEN_TYPE_TABLE: &str = "embeddings.token_type_embeddings.weight";

impl BertEncoder {
    /// Independent copy: same values, separate storage for every parameter.
    pub fn deep_copy(&self) -> LinkerResult<Self> {
        let copied = VarMap::new();
        {
            let source = lock(self.varmap.data())?;
            let mut target = lock(copied.data())?;
            for (name, var) in source.iter() {
                let values = var.as_tensor().detach().copy().map_err(tensor_op("copy parameter"))?;
                target.insert(name.clone(), Var::from_tensor(&values)?);
            }
        }
        Self::build(self.config.clone(), copied, &self.device)
    }

    /// Grow the segment-type table to `num_types` rows.
    ///
    /// Existing rows are kept bit-identical; appended rows are drawn from
    /// N(0, initializer_range). The table is replaced by a new variable, so
    /// any tensor previously handed out for it keeps its old shape. A table
    /// that already has `num_types` rows or more is left untouched.
    pub fn migrate_token_type_table(self, num_types: usize) -> LinkerResult<Self> {
        let current = self.config.type_vocab_size;
        if num_types <= current {
            tracing::debug!(
                "Token-type table already has {} rows (requested {}), leaving it unchanged",
                current,
                num_types
            );
            return Ok(self);
        }

        let hidden = self.config.hidden_size;
        let old_table = self
            .parameter(TOKEN_TYPE_TABLE)?
            .ok_or_else(|| LinkerError::InternalError {
                message: format!("{} missing from encoder", TOKEN_TYPE_TABLE),
            })?;
        let appended = Tensor::randn(
            0f32,
            self.config.initializer_range as f32,
            (num_types - current, hidden),
            &self.device,
        )?
        .to_dtype(old_table.dtype())?;
        let table = Tensor::cat(&[&old_table.detach(), &appended], 0).map_err(tensor_op("grow token-type table"))?;

        {
            let mut data = lock(self.varmap.data())?;
            data.insert(TOKEN_TYPE_TABLE.to_string(), Var::from_tensor(&table)?);
        }

        let mut config = self.config.clone();
        config.type_vocab_size = num_types;
        tracing::info!(
            "Grew token-type table from {} to {} rows (hidden_size={})",
            current,
            num_types,
            hidden
        );

        Self::build(config, self.varmap, &self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tests::{tiny_config, tiny_input};
    use crate::mode::Mode;
    use candle_core::{DType, Device};

    #[test]
    fn test_deep_copy_matches_then_diverges() {
        let original = BertEncoder::new(tiny_config(), &Device::Cpu).unwrap();
        let copy = original.deep_copy().unwrap();

        let a = original.forward(&tiny_input(1), Mode::Eval).unwrap().to_vec3::<f32>().unwrap();
        let b = copy.forward(&tiny_input(1), Mode::Eval).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(a, b);

        let name = "embeddings.word_embeddings.weight";
        let before: Vec<Vec<f32>> = original.parameter(name).unwrap().unwrap().to_vec2().unwrap();
        let zeros = Tensor::zeros((24, 8), DType::F32, &Device::Cpu).unwrap();
        {
            let data = copy.varmap().data().lock().unwrap();
            data[name].set(&zeros).unwrap();
        }
        let after: Vec<Vec<f32>> = original.parameter(name).unwrap().unwrap().to_vec2().unwrap();
        assert_eq!(before, after);
        let copied: Vec<Vec<f32>> = copy.parameter(name).unwrap().unwrap().to_vec2().unwrap();
        assert!(copied.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn test_migration_preserves_existing_rows() {
        let encoder = BertEncoder::new(tiny_config(), &Device::Cpu).unwrap();
        let original_rows: Vec<Vec<f32>> = encoder.token_type_table().to_vec2().unwrap();

        let migrated = encoder.migrate_token_type_table(3).unwrap();
        assert_eq!(migrated.config().type_vocab_size, 3);

        let table = migrated.token_type_table();
        assert_eq!(table.dims(), &[3, 8]);
        let rows: Vec<Vec<f32>> = table.to_vec2().unwrap();
        assert_eq!(rows[0], original_rows[0]);
        assert_eq!(rows[1], original_rows[1]);

        let stored = migrated.parameter(TOKEN_TYPE_TABLE).unwrap().unwrap();
        assert_eq!(stored.dims(), &[3, 8]);
    }

    #[test]
    fn test_migrated_encoder_accepts_type_two() {
        let encoder = BertEncoder::new(tiny_config(), &Device::Cpu)
            .unwrap()
            .migrate_token_type_table(3)
            .unwrap();
        let hidden = encoder.forward(&tiny_input(2), Mode::Eval).unwrap();
        assert_eq!(hidden.dims(), &[2, 5, 8]);
    }

    #[test]
    fn test_migration_is_noop_when_table_is_large_enough() {
        let mut config = tiny_config();
        config.type_vocab_size = 4;
        let encoder = BertEncoder::new(config, &Device::Cpu).unwrap();
        let before: Vec<Vec<f32>> = encoder.token_type_table().to_vec2().unwrap();
        let migrated = encoder.migrate_token_type_table(3).unwrap();
        assert_eq!(migrated.config().type_vocab_size, 4);
        assert_eq!(migrated.token_type_table().to_vec2::<f32>().unwrap(), before);
    }

    #[test]
    fn test_appended_row_is_trainable() {
        let encoder = BertEncoder::new(tiny_config(), &Device::Cpu)
            .unwrap()
            .migrate_token_type_table(3)
            .unwrap();
        let table = encoder.parameter(TOKEN_TYPE_TABLE).unwrap().unwrap();
        let hidden = encoder.forward(&tiny_input(2), Mode::Train).unwrap();
        // A full sum is constant under the final LayerNorm; check one feature.
        let grads = hidden.narrow(2, 0, 1).unwrap().sum_all().unwrap().backward().unwrap();
        let grad = grads.get(&table).expect("token-type table received no gradient");
        let rows: Vec<Vec<f32>> = grad.to_vec2().unwrap();
        assert!(rows[2].iter().any(|g| *g != 0.0));
    }
}
