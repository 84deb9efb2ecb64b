use anyhow::{Result, ensure};
use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder, linear, ops::softmax};

/// Additive soft attention over the encoder grid.
pub struct Attention {
    encoder_att: Linear,
    decoder_att: Linear,
    full_att: Linear,
}

impl Attention {
    pub fn new(
        encoder_dim: usize,
        decoder_dim: usize,
        attention_dim: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            encoder_att: linear(encoder_dim, attention_dim, vb.pp("encoder_att"))?,
            decoder_att: linear(decoder_dim, attention_dim, vb.pp("decoder_att"))?,
            full_att: linear(attention_dim, 1, vb.pp("full_att"))?,
        })
    }

    /// `grid` is `[B, N, D]`, `hidden` is `[B, H]`. Returns the context `[B, D]` and the
    /// attention weights `[B, N]`, which are non-negative and sum to one per row.
    pub fn forward(&self, grid: &Tensor, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        ensure!(
            grid.dim(0)? == hidden.dim(0)?,
            "attention grid has {} rows but the hidden state has {}",
            grid.dim(0)?,
            hidden.dim(0)?
        );
        let att1 = self.encoder_att.forward(grid)?;
        let att2 = self.decoder_att.forward(hidden)?.unsqueeze(1)?;
        let scores = self
            .full_att
            .forward(&att1.broadcast_add(&att2)?.relu()?)?
            .squeeze(2)?;
        let alpha = softmax(&scores, 1)?;
        let context = grid.broadcast_mul(&alpha.unsqueeze(2)?)?.sum(1)?;
        Ok((context, alpha))
    }
}
