//! LSTM decoder with soft attention, trained with teacher forcing.
//!
//! A batch is sorted by caption length (longest first) so that at every step the sequences
//! still being decoded form a leading prefix of the batch. Only that prefix is fed through
//! attention, the gate and the LSTM cell; rows past a sequence's length stay exactly zero in
//! the outputs.

use anyhow::{Result, bail, ensure};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Dropout, Init, Linear, VarBuilder, VarMap, linear, ops::sigmoid};
use captioner_core::tensor::{gather_token_embeddings, select_rows};
use tracing::{debug, info};

use crate::{attention::Attention, lstm::LstmCell};

const EMBEDDING: &str = "embedding.weight";

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    pub attention_dim: usize,
    pub embed_dim: usize,
    pub decoder_dim: usize,
    pub vocab_size: usize,
    pub encoder_dim: usize,
    pub dropout: f32,
    /// Fraction of steps fed the ground-truth token. Only full teacher forcing is supported.
    pub teacher_forcing_ratio: f64,
}

impl DecoderConfig {
    pub fn new(
        attention_dim: usize,
        embed_dim: usize,
        decoder_dim: usize,
        vocab_size: usize,
        encoder_dim: usize,
        dropout: f32,
    ) -> Self {
        Self {
            attention_dim,
            embed_dim,
            decoder_dim,
            vocab_size,
            encoder_dim,
            dropout,
            teacher_forcing_ratio: 1.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.teacher_forcing_ratio != 1.0 {
            bail!(
                "teacher_forcing_ratio {} is not supported, the decoder always feeds ground truth",
                self.teacher_forcing_ratio
            );
        }
        ensure!(
            (0.0..1.0).contains(&self.dropout),
            "dropout must be in [0, 1), got {}",
            self.dropout
        );
        for (name, value) in [
            ("attention_dim", self.attention_dim),
            ("embed_dim", self.embed_dim),
            ("decoder_dim", self.decoder_dim),
            ("vocab_size", self.vocab_size),
            ("encoder_dim", self.encoder_dim),
        ] {
            ensure!(value > 0, "{name} must be positive");
        }
        Ok(())
    }
}

/// Result of one teacher-forced pass over a batch, in length-sorted order.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[B, T, V]` with `T = max(length) - 1`.
    pub logits: Tensor,
    /// `[B, L]` captions permuted by `sort_order`.
    pub captions: Tensor,
    /// `length - 1` per sorted sequence, non-increasing.
    pub decode_lengths: Vec<usize>,
    /// `[B, T, N]` attention weights.
    pub alphas: Tensor,
    /// `sort_order[i]` is the original batch index of sorted row `i`.
    pub sort_order: Vec<usize>,
}

pub struct AttentionDecoder {
    config: DecoderConfig,
    varmap: VarMap,
    embedding: Tensor,
    attention: Attention,
    init_h: Linear,
    init_c: Linear,
    f_beta: Linear,
    decode_step: LstmCell,
    dropout: Dropout,
    fc: Linear,
    fine_tune_embeddings: bool,
}

impl AttentionDecoder {
    pub fn new(config: DecoderConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let uniform = Init::Uniform { lo: -0.1, up: 0.1 };

        let embedding = vb.get_with_hints((config.vocab_size, config.embed_dim), EMBEDDING, uniform)?;
        let attention = Attention::new(
            config.encoder_dim,
            config.decoder_dim,
            config.attention_dim,
            vb.pp("attention"),
        )?;
        let init_h = linear(config.encoder_dim, config.decoder_dim, vb.pp("init_h"))?;
        let init_c = linear(config.encoder_dim, config.decoder_dim, vb.pp("init_c"))?;
        let f_beta = linear(config.decoder_dim, config.encoder_dim, vb.pp("f_beta"))?;
        let decode_step = LstmCell::new(
            config.embed_dim + config.encoder_dim,
            config.decoder_dim,
            vb.pp("decode_step"),
        )?;
        let fc_weight = vb.get_with_hints((config.vocab_size, config.decoder_dim), "fc.weight", uniform)?;
        let fc_bias = vb.get_with_hints(config.vocab_size, "fc.bias", Init::Const(0.0))?;
        debug!(
            vocab = config.vocab_size,
            decoder_dim = config.decoder_dim,
            "constructed attention decoder"
        );
        Ok(Self {
            dropout: Dropout::new(config.dropout),
            config,
            varmap,
            embedding,
            attention,
            init_h,
            init_c,
            f_beta,
            decode_step,
            fc: Linear::new(fc_weight, Some(fc_bias)),
            fine_tune_embeddings: true,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Replace the embedding table with `[vocab_size, embed_dim]` pretrained vectors.
    pub fn load_pretrained_embeddings(&self, embeddings: &Tensor) -> Result<()> {
        let expected = (self.config.vocab_size, self.config.embed_dim);
        ensure!(
            embeddings.dims2()? == expected,
            "pretrained embeddings have shape {:?}, expected {:?}",
            embeddings.dims(),
            expected
        );
        let var = self.named_var(EMBEDDING)?;
        var.set(&embeddings.to_dtype(DType::F32)?.to_device(var.device())?)?;
        info!(vocab = expected.0, dim = expected.1, "loaded pretrained embeddings");
        Ok(())
    }

    /// Whether the embedding table is handed to the optimizer.
    pub fn fine_tune_embeddings(&mut self, enabled: bool) {
        self.fine_tune_embeddings = enabled;
    }

    fn named_var(&self, name: &str) -> Result<Var> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match data.get(name) {
            Some(var) => Ok(var.clone()),
            None => bail!("decoder has no parameter `{name}`"),
        }
    }

    /// Every optimizable parameter, sorted by name.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| self.fine_tune_embeddings || name.as_str() != EMBEDDING)
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    fn init_hidden_state(&self, grid: &Tensor) -> Result<(Tensor, Tensor)> {
        let mean = grid.mean(1)?;
        let h = self.init_h.forward(&mean)?;
        let c = self.init_c.forward(&mean)?;
        Ok((h, c))
    }

    /// Teacher-forced pass. `grid` is `[B, S, S, D]` (or already flattened to `[B, N, D]`),
    /// `captions` is `[B, L]` and `lengths` holds the true caption lengths.
    pub fn forward(
        &self,
        grid: &Tensor,
        captions: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> Result<DecoderOutput> {
        let batch = grid.dim(0)?;
        let encoder_dim = grid.dim(grid.rank() - 1)?;
        ensure!(
            encoder_dim == self.config.encoder_dim,
            "grid depth {encoder_dim} does not match decoder encoder_dim {}",
            self.config.encoder_dim
        );
        ensure!(batch > 0, "cannot decode an empty batch");
        let (caption_rows, caption_len) = captions.dims2()?;
        ensure!(
            caption_rows == batch && lengths.len() == batch,
            "batch of {batch} images has {caption_rows} captions and {} lengths",
            lengths.len()
        );
        ensure!(
            lengths.iter().all(|&len| (1..=caption_len).contains(&len)),
            "caption lengths must be in 1..={caption_len}, got {lengths:?}"
        );
        let grid = grid.reshape((batch, (), encoder_dim))?;
        let num_pixels = grid.dim(1)?;

        let mut sort_order: Vec<usize> = (0..batch).collect();
        sort_order.sort_by(|&a, &b| lengths[b].cmp(&lengths[a]));
        let grid = select_rows(&grid, &sort_order)?;
        let captions = select_rows(captions, &sort_order)?;
        let decode_lengths: Vec<usize> = sort_order.iter().map(|&idx| lengths[idx] - 1).collect();

        let embeddings = gather_token_embeddings(&self.embedding, &captions)?;
        let (mut h, mut c) = self.init_hidden_state(&grid)?;

        let steps = decode_lengths[0];
        let device = grid.device();
        let vocab = self.config.vocab_size;
        if steps == 0 {
            return Ok(DecoderOutput {
                logits: Tensor::zeros((batch, 0, vocab), DType::F32, device)?,
                captions,
                decode_lengths,
                alphas: Tensor::zeros((batch, 0, num_pixels), DType::F32, device)?,
                sort_order,
            });
        }

        let mut step_logits = Vec::with_capacity(steps);
        let mut step_alphas = Vec::with_capacity(steps);
        for t in 0..steps {
            let active = decode_lengths.iter().filter(|&&len| len > t).count();
            let h_t = h.narrow(0, 0, active)?;
            let c_t = c.narrow(0, 0, active)?;
            let (context, alpha) = self
                .attention
                .forward(&grid.narrow(0, 0, active)?, &h_t)?;
            let gate = sigmoid(&self.f_beta.forward(&h_t)?)?;
            let context = (gate * context)?;
            let embedded = embeddings.narrow(0, 0, active)?.narrow(1, t, 1)?.squeeze(1)?;
            let input = Tensor::cat(&[&embedded, &context], 1)?;
            let (h_next, c_next) = self.decode_step.forward(&input, &h_t, &c_t)?;
            let logits = self
                .fc
                .forward(&self.dropout.forward(&h_next, train)?)?;
            step_logits.push(logits.pad_with_zeros(0, 0, batch - active)?);
            step_alphas.push(alpha.pad_with_zeros(0, 0, batch - active)?);
            h = h_next;
            c = c_next;
        }

        Ok(DecoderOutput {
            logits: Tensor::stack(&step_logits, 1)?,
            captions,
            decode_lengths,
            alphas: Tensor::stack(&step_alphas, 1)?,
            sort_order,
        })
    }
}
