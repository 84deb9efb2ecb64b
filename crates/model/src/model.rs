use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};

use crate::{
    decoder::{AttentionDecoder, DecoderConfig, DecoderOutput},
    encoder::{EncoderConfig, VisualEncoder},
};

/// Encoder and decoder wired together for training.
pub struct CaptionModel {
    pub encoder: VisualEncoder,
    pub decoder: AttentionDecoder,
}

impl CaptionModel {
    pub fn new(encoder: EncoderConfig, decoder: DecoderConfig, device: &Device) -> Result<Self> {
        let encoder = VisualEncoder::new(encoder, device)?;
        let decoder = AttentionDecoder::new(decoder, device)?;
        Self::from_parts(encoder, decoder)
    }

    /// Fails when the encoder's output depth differs from what the decoder attends over.
    pub fn from_parts(encoder: VisualEncoder, decoder: AttentionDecoder) -> Result<Self> {
        ensure!(
            encoder.output_dim() == decoder.config().encoder_dim,
            "encoder produces {}-channel features but the decoder expects encoder_dim {}",
            encoder.output_dim(),
            decoder.config().encoder_dim
        );
        Ok(Self { encoder, decoder })
    }

    pub fn forward(
        &self,
        images: &Tensor,
        captions: &Tensor,
        lengths: &[usize],
        train: bool,
    ) -> Result<DecoderOutput> {
        let grid = self.encoder.forward(images)?;
        self.decoder.forward(&grid, captions, lengths, train)
    }
}
