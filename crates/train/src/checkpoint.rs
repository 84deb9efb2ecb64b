//! Single-file training checkpoints.
//!
//! Tensor names are prefixed by owner: `encoder.`, `decoder.`, `decoder_optimizer.`,
//! `encoder_optimizer.` (only when the encoder is being fine-tuned) and `meta.`.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result, bail};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use captioner_model::CaptionModel;
use tracing::{info, warn};

use crate::optimizer::Adam;

const ENCODER: &str = "encoder.";
const DECODER: &str = "decoder.";
const DECODER_OPTIMIZER: &str = "decoder_optimizer.";
const ENCODER_OPTIMIZER: &str = "encoder_optimizer.";
const EPOCH: &str = "meta.epoch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMeta {
    /// Number of completed epochs.
    pub epoch: usize,
}

fn insert_prefixed(out: &mut HashMap<String, Tensor>, prefix: &str, tensors: HashMap<String, Tensor>) {
    out.extend(
        tensors
            .into_iter()
            .map(|(name, tensor)| (format!("{prefix}{name}"), tensor)),
    );
}

fn varmap_tensors(varmap: &VarMap) -> HashMap<String, Tensor> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    data.iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect()
}

fn strip_prefix(tensors: &HashMap<String, Tensor>, prefix: &str) -> HashMap<String, Tensor> {
    tensors
        .iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(prefix)
                .map(|rest| (rest.to_string(), tensor.clone()))
        })
        .collect()
}

fn restore_varmap(varmap: &VarMap, tensors: &HashMap<String, Tensor>, owner: &str) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    for (name, var) in data.iter() {
        let Some(tensor) = tensors.get(name) else {
            bail!("checkpoint has no {owner} parameter `{name}`");
        };
        var.set(&tensor.to_device(var.device())?)
            .with_context(|| format!("failed to restore {owner} parameter `{name}`"))?;
    }
    Ok(())
}

pub fn save_checkpoint(
    path: impl AsRef<Path>,
    model: &CaptionModel,
    decoder_optimizer: &Adam,
    encoder_optimizer: Option<&Adam>,
    meta: CheckpointMeta,
) -> Result<()> {
    let path = path.as_ref();
    let mut tensors = HashMap::new();
    insert_prefixed(&mut tensors, ENCODER, varmap_tensors(model.encoder.varmap()));
    insert_prefixed(&mut tensors, DECODER, varmap_tensors(model.decoder.varmap()));
    insert_prefixed(&mut tensors, DECODER_OPTIMIZER, decoder_optimizer.export_state()?);
    if let Some(optimizer) = encoder_optimizer {
        insert_prefixed(&mut tensors, ENCODER_OPTIMIZER, optimizer.export_state()?);
    }
    let epoch = u32::try_from(meta.epoch).context("epoch counter overflows u32")?;
    tensors.insert(EPOCH.to_string(), Tensor::new(&[epoch], &Device::Cpu)?);

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let staging = path.with_extension("safetensors.partial");
    candle_core::safetensors::save(&tensors, &staging)
        .with_context(|| format!("failed to write checkpoint {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("failed to move checkpoint into {}", path.display()))?;
    info!(path = %path.display(), epoch = meta.epoch, "saved checkpoint");
    Ok(())
}

/// Restore parameters and optimizer state in place. An encoder optimizer is only restored
/// when the checkpoint carries its state.
pub fn load_checkpoint(
    path: impl AsRef<Path>,
    model: &CaptionModel,
    decoder_optimizer: &mut Adam,
    encoder_optimizer: Option<&mut Adam>,
) -> Result<CheckpointMeta> {
    let path = path.as_ref();
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

    restore_varmap(model.encoder.varmap(), &strip_prefix(&tensors, ENCODER), "encoder")?;
    restore_varmap(model.decoder.varmap(), &strip_prefix(&tensors, DECODER), "decoder")?;
    decoder_optimizer
        .import_state(&strip_prefix(&tensors, DECODER_OPTIMIZER))
        .context("failed to restore decoder optimizer")?;
    if let Some(optimizer) = encoder_optimizer {
        let state = strip_prefix(&tensors, ENCODER_OPTIMIZER);
        if state.is_empty() {
            warn!("checkpoint has no encoder optimizer state, starting it fresh");
        } else {
            optimizer
                .import_state(&state)
                .context("failed to restore encoder optimizer")?;
        }
    }
    let epoch = tensors
        .get(EPOCH)
        .context("checkpoint is missing the epoch counter")?
        .flatten_all()?
        .to_vec1::<u32>()?
        .first()
        .copied()
        .context("empty epoch counter")? as usize;
    info!(path = %path.display(), epoch, "loaded checkpoint");
    Ok(CheckpointMeta { epoch })
}
