use anyhow::{Result, ensure};
use candle_core::Tensor;
use captioner_model::DecoderOutput;

/// Loss terms for one batch.
#[derive(Debug, Clone)]
pub struct CaptionLoss {
    /// `cross_entropy + alpha_c * coverage`, the tensor to backpropagate.
    pub total: Tensor,
    pub cross_entropy: Tensor,
    pub coverage: Tensor,
    /// Number of scored tokens, `sum(decode_lengths)`.
    pub tokens: usize,
}

/// Flat row indices `b * steps + t` of every scored `(sequence, step)` pair.
fn valid_positions(decode_lengths: &[usize], steps: usize) -> Vec<u32> {
    decode_lengths
        .iter()
        .enumerate()
        .flat_map(|(row, &len)| (0..len.min(steps)).map(move |t| (row * steps + t) as u32))
        .collect()
}

/// Token-averaged cross-entropy against the captions shifted left by one, plus the doubly
/// stochastic attention penalty `alpha_c * mean((1 - sum_t alpha)^2)`.
pub fn caption_loss(output: &DecoderOutput, alpha_c: f64) -> Result<CaptionLoss> {
    let (batch, steps, vocab) = output.logits.dims3()?;
    let (_, caption_len) = output.captions.dims2()?;
    ensure!(
        steps < caption_len,
        "decoded {steps} steps from captions of length {caption_len}"
    );
    let positions = valid_positions(&output.decode_lengths, steps);
    let tokens = positions.len();
    ensure!(tokens > 0, "batch has no tokens to score");

    let device = output.logits.device();
    let index = Tensor::from_vec(positions, tokens, device)?;
    let logits = output
        .logits
        .reshape((batch * steps, vocab))?
        .index_select(&index, 0)?;
    let targets = output
        .captions
        .narrow(1, 1, steps)?
        .contiguous()?
        .reshape(batch * steps)?
        .index_select(&index, 0)?;
    let cross_entropy = candle_nn::loss::cross_entropy(&logits, &targets)?;

    let coverage = output.alphas.sum(1)?.affine(-1.0, 1.0)?.sqr()?.mean_all()?;
    let total = (&cross_entropy + coverage.affine(alpha_c, 0.0)?)?;
    Ok(CaptionLoss {
        total,
        cross_entropy,
        coverage,
        tokens,
    })
}
