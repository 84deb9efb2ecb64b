use anyhow::Result;
use candle_core::{Var, backprop::GradStore};

/// Clamp every present gradient of `vars` into `[-clip, clip]`. Parameters without a
/// gradient are skipped. Returns how many gradients were clamped.
pub fn clip_gradients<'a>(
    grads: &mut GradStore,
    vars: impl IntoIterator<Item = &'a Var>,
    clip: f64,
) -> Result<usize> {
    let mut clipped = 0;
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let clamped = grad.clamp(-clip, clip)?;
        grads.insert(var.as_tensor(), clamped);
        clipped += 1;
    }
    Ok(clipped)
}
