use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use captioner_core::LossTracker;
use captioner_dataset::{Batch, BatchLoader};
use captioner_model::CaptionModel;
use tracing::{debug, info};

use crate::{
    checkpoint::{CheckpointMeta, load_checkpoint, save_checkpoint},
    clip::clip_gradients,
    loss::caption_loss,
    optimizer::{Adam, AdamParams},
};

#[derive(Debug, Clone, PartialEq)]
pub struct TrainerConfig {
    pub encoder_lr: f64,
    pub decoder_lr: f64,
    /// Elementwise gradient bound; `None` disables clipping.
    pub grad_clip: Option<f64>,
    /// Weight of the attention coverage penalty.
    pub alpha_c: f64,
    pub fine_tune_encoder: bool,
    /// Log the running loss every this many batches.
    pub print_freq: usize,
    /// Where `fit` writes a checkpoint after each epoch.
    pub checkpoint_path: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            encoder_lr: 1e-4,
            decoder_lr: 4e-4,
            grad_clip: Some(5.0),
            alpha_c: 1.0,
            fine_tune_encoder: false,
            print_freq: 50,
            checkpoint_path: PathBuf::from("caption_model.safetensors"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    pub loss: f64,
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
}

pub struct Trainer {
    model: CaptionModel,
    decoder_optimizer: Adam,
    encoder_optimizer: Option<Adam>,
    config: TrainerConfig,
    epoch: usize,
}

impl Trainer {
    pub fn new(mut model: CaptionModel, config: TrainerConfig) -> Result<Self> {
        model.encoder.fine_tune(config.fine_tune_encoder);
        let decoder_optimizer = Adam::new(
            model.decoder.trainable_vars(),
            AdamParams::with_lr(config.decoder_lr),
        )?;
        let encoder_optimizer = if config.fine_tune_encoder {
            Some(Adam::new(
                model.encoder.trainable_vars(),
                AdamParams::with_lr(config.encoder_lr),
            )?)
        } else {
            None
        };
        info!(
            decoder_params = decoder_optimizer.len(),
            encoder_params = encoder_optimizer.as_ref().map_or(0, Adam::len),
            fine_tune_encoder = config.fine_tune_encoder,
            "trainer ready"
        );
        Ok(Self {
            model,
            decoder_optimizer,
            encoder_optimizer,
            config,
            epoch: 0,
        })
    }

    pub fn model(&self) -> &CaptionModel {
        &self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Completed epochs, including those restored from a checkpoint.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn decoder_optimizer(&self) -> &Adam {
        &self.decoder_optimizer
    }

    pub fn encoder_optimizer(&self) -> Option<&Adam> {
        self.encoder_optimizer.as_ref()
    }

    /// Forward, backward, clip and update on one batch.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let output = self
            .model
            .forward(&batch.images, &batch.captions, &batch.lengths, true)?;
        let loss = caption_loss(&output, self.config.alpha_c)?;
        let mut grads = loss.total.backward()?;
        if let Some(clip) = self.config.grad_clip {
            clip_gradients(&mut grads, self.decoder_optimizer.vars(), clip)?;
            if let Some(optimizer) = &self.encoder_optimizer {
                clip_gradients(&mut grads, optimizer.vars(), clip)?;
            }
        }
        self.decoder_optimizer.step(&grads)?;
        if let Some(optimizer) = &mut self.encoder_optimizer {
            optimizer.step(&grads)?;
        }
        Ok(StepStats {
            loss: loss.total.to_scalar::<f32>()? as f64,
            tokens: loss.tokens,
        })
    }

    pub fn train_epoch(&mut self, loader: &mut BatchLoader<'_>) -> Result<LossTracker> {
        loader.reset();
        let batches = loader.num_batches();
        let mut tracker = LossTracker::new();
        let mut index = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            let stats = self.train_step(&batch)?;
            tracker.update(stats.loss, stats.tokens);
            debug!(batch = index, size = batch.len(), tokens = stats.tokens, "trained batch");
            if self.config.print_freq > 0 && index % self.config.print_freq == 0 {
                info!(
                    epoch = self.epoch,
                    batch = index,
                    batches,
                    loss = tracker.val,
                    avg_loss = tracker.avg,
                    "training"
                );
            }
            index += 1;
        }
        Ok(tracker)
    }

    /// Same loss as training, with dropout disabled and no parameter updates.
    pub fn validate(&self, loader: &mut BatchLoader<'_>) -> Result<LossTracker> {
        loader.reset();
        let batches = loader.num_batches();
        let mut tracker = LossTracker::new();
        let mut index = 0;
        while let Some(batch) = loader.next_batch() {
            let batch = batch?;
            let output = self
                .model
                .forward(&batch.images, &batch.captions, &batch.lengths, false)?;
            let loss = caption_loss(&output, self.config.alpha_c)?;
            tracker.update(loss.total.to_scalar::<f32>()? as f64, loss.tokens);
            if self.config.print_freq > 0 && index % self.config.print_freq == 0 {
                info!(
                    batch = index,
                    batches,
                    loss = tracker.val,
                    avg_loss = tracker.avg,
                    "validation"
                );
            }
            index += 1;
        }
        info!(epoch = self.epoch, avg_loss = tracker.avg, "validation finished");
        Ok(tracker)
    }

    /// Train until `epochs` epochs have completed, validating and checkpointing after each.
    pub fn fit(
        &mut self,
        epochs: usize,
        train: &mut BatchLoader<'_>,
        val: &mut BatchLoader<'_>,
    ) -> Result<Vec<EpochSummary>> {
        let mut summaries = Vec::with_capacity(epochs.saturating_sub(self.epoch));
        while self.epoch < epochs {
            let train_loss = self.train_epoch(train)?;
            let val_loss = self.validate(val)?;
            self.epoch += 1;
            let path = self.config.checkpoint_path.clone();
            self.save_checkpoint(&path)?;
            info!(
                epoch = self.epoch,
                train_loss = train_loss.avg,
                val_loss = val_loss.avg,
                "epoch complete"
            );
            summaries.push(EpochSummary {
                epoch: self.epoch,
                train_loss: train_loss.avg,
                val_loss: val_loss.avg,
            });
        }
        Ok(summaries)
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        save_checkpoint(
            path,
            &self.model,
            &self.decoder_optimizer,
            self.encoder_optimizer.as_ref(),
            CheckpointMeta { epoch: self.epoch },
        )
    }

    pub fn resume(&mut self, path: &Path) -> Result<()> {
        let meta = load_checkpoint(
            path,
            &self.model,
            &mut self.decoder_optimizer,
            self.encoder_optimizer.as_mut(),
        )
        .with_context(|| format!("failed to resume from {}", path.display()))?;
        self.epoch = meta.epoch;
        Ok(())
    }
}
