//! Shared fixtures: a tiny BERT written to a temp model directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use entity_linker::{BertConfig, BertEncoder, EncoderInput};
use tempfile::TempDir;

pub const HIDDEN: usize = 8;

pub fn tiny_config() -> BertConfig {
    BertConfig {
        vocab_size: 32,
        hidden_size: HIDDEN,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        intermediate_size: 16,
        hidden_act: "gelu".to_string(),
        hidden_dropout_prob: 0.0,
        attention_probs_dropout_prob: 0.0,
        max_position_embeddings: 16,
        type_vocab_size: 2,
        initializer_range: 0.02,
        layer_norm_eps: 1e-12,
        pad_token_id: 0,
        model_type: "bert".to_string(),
    }
}

/// Write `config.json` and `model.safetensors` for `encoder`, prefixing every
/// key with `key_prefix`, plus one entry no encoder parameter matches.
pub fn write_model_dir(dir: &Path, encoder: &BertEncoder, key_prefix: &str) -> HashMap<String, Tensor> {
    let config_json = serde_json::to_string_pretty(encoder.config()).unwrap();
    std::fs::write(dir.join("config.json"), config_json).unwrap();

    let state = encoder.state_dict().unwrap();
    let mut saved: HashMap<String, Tensor> = state
        .iter()
        .map(|(k, v)| (format!("{}{}", key_prefix, k), v.clone()))
        .collect();
    saved.insert(
        format!("{}cls.predictions.bias", key_prefix),
        Tensor::zeros(32, candle_core::DType::F32, &Device::Cpu).unwrap(),
    );
    candle_core::safetensors::save(&saved, dir.join("model.safetensors")).unwrap();
    state
}

/// Temp model directory with keys saved under `module.`.
pub fn pretrained_dir() -> (TempDir, HashMap<String, Tensor>) {
    let dir = tempfile::tempdir().unwrap();
    let source = BertEncoder::new(tiny_config(), &Device::Cpu).unwrap();
    let state = write_model_dir(dir.path(), &source, "module.");
    (dir, state)
}

/// Build a batch from token rows; mask is 1 for nonzero ids, types all `type_id`
/// on real tokens.
pub fn batch(rows: &[&[u32]], type_id: u32) -> EncoderInput {
    let len = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    padded_batch(rows, type_id, len)
}

pub fn padded_batch(rows: &[&[u32]], type_id: u32, len: usize) -> EncoderInput {
    let ids: Vec<Vec<u32>> = rows
        .iter()
        .map(|r| {
            let mut row = r.to_vec();
            row.resize(len, 0);
            row
        })
        .collect();
    let mask: Vec<Vec<u32>> = ids
        .iter()
        .map(|r| r.iter().map(|&t| u32::from(t != 0)).collect())
        .collect();
    let types: Vec<Vec<u32>> = mask.iter().map(|r| r.iter().map(|&m| m * type_id).collect()).collect();
    EncoderInput::from_rows(&ids, &mask, &types, &Device::Cpu).unwrap()
}

pub fn mentions() -> EncoderInput {
    batch(&[&[1, 4, 5, 6, 2], &[1, 7, 8, 2], &[1, 9, 10, 11, 12, 2]], 0)
}

pub fn entities() -> EncoderInput {
    batch(&[&[1, 13, 14, 2], &[1, 15, 16, 17, 2], &[1, 18, 2]], 0)
}

/// Two hard negatives per sample, padded to a shared length.
pub fn candidate_sets() -> Vec<EncoderInput> {
    vec![
        padded_batch(&[&[1, 19, 20, 2], &[1, 21, 2]], 0, 6),
        padded_batch(&[&[1, 22, 23, 2], &[1, 24, 25, 26, 2]], 0, 6),
        padded_batch(&[&[1, 27, 2], &[1, 28, 29, 2]], 0, 6),
    ]
}

pub fn to_vec2(t: &Tensor) -> Vec<Vec<f32>> {
    t.to_vec2::<f32>().unwrap()
}

pub fn assert_close(a: f32, b: f32, tol: f32) {
    assert!((a - b).abs() <= tol, "{a} vs {b} (tol {tol})");
}
