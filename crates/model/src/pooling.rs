use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};

/// Row-stochastic `[out_len, in_len]` matrix averaging each adaptive pooling bin.
///
/// Bin `i` covers `floor(i * in / out) .. ceil((i + 1) * in / out)`, so bins overlap when the
/// sizes do not divide evenly and repeat inputs when upsampling.
fn axis_weights(in_len: usize, out_len: usize, device: &Device) -> Result<Tensor> {
    let mut weights = vec![0f32; out_len * in_len];
    for out_idx in 0..out_len {
        let start = out_idx * in_len / out_len;
        let end = ((out_idx + 1) * in_len).div_ceil(out_len);
        let width = (end - start) as f32;
        for src in start..end {
            weights[out_idx * in_len + src] = 1.0 / width;
        }
    }
    Ok(Tensor::from_vec(weights, (out_len, in_len), device)?)
}

/// Adaptive average pooling of `[B, C, H, W]` to `[B, C, out_h, out_w]`, expressed as two
/// matrix products so it stays differentiable.
pub fn adaptive_avg_pool2d(input: &Tensor, out_h: usize, out_w: usize) -> Result<Tensor> {
    let (batch, channels, in_h, in_w) = input.dims4()?;
    ensure!(
        in_h > 0 && in_w > 0 && out_h > 0 && out_w > 0,
        "cannot pool {in_h}x{in_w} to {out_h}x{out_w}"
    );
    if in_h == out_h && in_w == out_w {
        return Ok(input.clone());
    }
    let device = input.device();
    let rows = axis_weights(in_h, out_h, device)?
        .to_dtype(input.dtype())?
        .broadcast_as((batch, channels, out_h, in_h))?
        .contiguous()?;
    let cols = axis_weights(in_w, out_w, device)?
        .to_dtype(input.dtype())?
        .t()?
        .broadcast_as((batch, channels, in_w, out_w))?
        .contiguous()?;
    let pooled = rows.matmul(&input.contiguous()?)?;
    Ok(pooled.matmul(&cols)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_bins_average_blocks() -> Result<()> {
        let input = Tensor::arange(0f32, 16f32, &Device::Cpu)?.reshape((1, 1, 4, 4))?;
        let pooled = adaptive_avg_pool2d(&input, 2, 2)?;
        let values = pooled.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![2.5, 4.5, 10.5, 12.5]);
        Ok(())
    }

    #[test]
    fn uneven_bins_overlap() -> Result<()> {
        let weights = axis_weights(3, 2, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(weights, vec![vec![0.5, 0.5, 0.0], vec![0.0, 0.5, 0.5]]);
        let upsampled = axis_weights(1, 2, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(upsampled, vec![vec![1.0], vec![1.0]]);
        Ok(())
    }
}
