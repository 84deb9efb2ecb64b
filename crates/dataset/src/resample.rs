use anyhow::{Result, ensure};
use rand::{Rng, seq::SliceRandom};

/// Pick exactly `captions_per_image` captions for one image.
///
/// With fewer captions than required, every original is kept and the remainder is drawn with
/// replacement. Otherwise `captions_per_image` distinct captions are drawn without
/// replacement.
pub fn resample_captions<T, R>(captions: &[T], captions_per_image: usize, rng: &mut R) -> Result<Vec<T>>
where
    T: Clone,
    R: Rng + ?Sized,
{
    ensure!(
        !captions.is_empty(),
        "cannot resample captions for an image without captions"
    );
    if captions.len() < captions_per_image {
        let mut chosen = captions.to_vec();
        for _ in captions.len()..captions_per_image {
            if let Some(extra) = captions.choose(rng) {
                chosen.push(extra.clone());
            }
        }
        Ok(chosen)
    } else {
        Ok(captions
            .choose_multiple(rng, captions_per_image)
            .cloned()
            .collect())
    }
}
