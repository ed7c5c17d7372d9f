//! Pretrained checkpoint discovery, key normalization and tolerant merge.
//!
//! A model directory holds `config.json` plus one weight file:
//! `model.safetensors` (preferred) or `pytorch_model.bin`. Keys saved from a
//! data-parallel wrapper carry a `module.` prefix, which is stripped before
//! names are matched against encoder parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;

use crate::encoder::lock;
use crate::error::{LinkerError, LinkerResult};

/// Prefix added to every key by data-parallel wrappers.
pub const DATA_PARALLEL_PREFIX: &str = "module.";

pub const SAFETENSORS_FILE: &str = "model.safetensors";
pub const PYTORCH_FILE: &str = "pytorch_model.bin";

/// Outcome of a tolerant merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Parameters overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Parameters the checkpoint did not provide; they keep their values.
    pub missing: Vec<String>,
    /// Checkpoint entries with no matching parameter; ignored.
    pub unexpected: Vec<String>,
}

impl MergeReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Locate the weight file inside `model_dir`.
///
/// Checked before anything is read so a bad path fails fast.
pub fn locate(model_dir: &Path) -> LinkerResult<PathBuf> {
    if !model_dir.is_dir() {
        return Err(LinkerError::ModelDirectoryNotFound {
            path: model_dir.display().to_string(),
        });
    }
    [SAFETENSORS_FILE, PYTORCH_FILE]
        .iter()
        .map(|file| model_dir.join(file))
        .find(|path| path.is_file())
        .ok_or_else(|| LinkerError::CheckpointNotFound {
            path: model_dir.join(PYTORCH_FILE).display().to_string(),
        })
}

/// Read every tensor of a weight file onto `device`.
pub fn read(path: &Path, device: &Device) -> LinkerResult<HashMap<String, Tensor>> {
    if !path.is_file() {
        return Err(LinkerError::CheckpointNotFound {
            path: path.display().to_string(),
        });
    }
    let read_error = |e: candle_core::Error| LinkerError::CheckpointReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    };

    let is_safetensors = path.extension().map(|e| e == "safetensors").unwrap_or(false);
    let tensors = if is_safetensors {
        candle_core::safetensors::load(path, device).map_err(read_error)?
    } else {
        candle_core::pickle::read_all(path)
            .map_err(read_error)?
            .into_iter()
            .map(|(name, t)| Ok((name, t.to_device(device)?)))
            .collect::<LinkerResult<HashMap<_, _>>>()?
    };

    tracing::info!("Read {} tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}

/// Strip the data-parallel prefix, then `extra_prefix` if non-empty.
pub fn normalize_key(key: &str, extra_prefix: &str) -> String {
    let key = key.strip_prefix(DATA_PARALLEL_PREFIX).unwrap_or(key);
    let key = if extra_prefix.is_empty() {
        key
    } else {
        key.strip_prefix(extra_prefix).unwrap_or(key)
    };
    key.to_string()
}

/// Apply [`normalize_key`] to every entry.
pub fn normalize(state: HashMap<String, Tensor>, extra_prefix: &str) -> HashMap<String, Tensor> {
    state
        .into_iter()
        .map(|(key, tensor)| (normalize_key(&key, extra_prefix), tensor))
        .collect()
}

/// Keep entries under `prefix`, with the prefix removed.
pub fn select_prefixed(state: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    state
        .iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(prefix)
                .map(|rest| (rest.to_string(), tensor.clone()))
        })
        .collect()
}

/// Fail with [`LinkerError::ShapeMismatch`] if any name in `state` matches a
/// parameter of `varmap` with a different shape. Nothing is written.
pub fn check_shapes(varmap: &VarMap, state: &HashMap<String, Tensor>) -> LinkerResult<()> {
    let vars = lock(varmap.data())?;
    let mut names: Vec<&String> = state.keys().collect();
    names.sort();
    for name in names {
        if let Some(var) = vars.get(name) {
            let tensor = &state[name];
            if var.dims() != tensor.dims() {
                return Err(LinkerError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    actual: tensor.dims().to_vec(),
                });
            }
        }
    }
    Ok(())
}

/// Overwrite every parameter of `varmap` whose name appears in `state`.
///
/// Missing and unexpected names are reported, not rejected. A name that
/// matches with a different shape is an error, and no parameter is written
/// unless every matching name passes.
pub fn merge_into(varmap: &VarMap, state: &HashMap<String, Tensor>) -> LinkerResult<MergeReport> {
    check_shapes(varmap, state)?;

    let vars = lock(varmap.data())?;
    let mut report = MergeReport::default();

    let mut staged = Vec::with_capacity(state.len());
    for (name, tensor) in state {
        let Some(var) = vars.get(name) else {
            report.unexpected.push(name.clone());
            continue;
        };
        let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        staged.push((name, var, value));
    }
    for (name, var, value) in staged {
        var.set(&value)?;
        report.loaded.push(name.clone());
    }

    report.missing = vars
        .keys()
        .filter(|name| !state.contains_key(*name))
        .cloned()
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();

    tracing::info!(
        "Merged {} tensors ({} missing, {} unexpected)",
        report.loaded.len(),
        report.missing.len(),
        report.unexpected.len()
    );
    if !report.missing.is_empty() {
        tracing::warn!("Parameters left at initialization: {:?}", report.missing);
    }
    if !report.unexpected.is_empty() {
        tracing::debug!("Ignored checkpoint entries: {:?}", report.unexpected);
    }

    Ok(report)
}
