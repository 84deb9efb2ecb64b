use std::path::Path;

use candle_core::{Device, Tensor};
use image::{RgbImage, imageops::FilterType};

use crate::error::{DatasetError, Result};

/// Per-channel statistics applied after scaling pixels into `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }
}

/// Decode an image, force it to RGB, resize it to `size x size` and lay it out channel-first.
///
/// Grayscale inputs are broadcast to three channels and alpha is discarded.
pub fn load_normalized_image(path: impl AsRef<Path>, size: u32) -> Result<Vec<u8>> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|source| DatasetError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    let rgb = image.to_rgb8();
    let resized = if rgb.dimensions() == (size, size) {
        rgb
    } else {
        image::imageops::resize(&rgb, size, size, FilterType::Triangle)
    };
    Ok(rgb_to_chw(&resized))
}

fn rgb_to_chw(rgb: &RgbImage) -> Vec<u8> {
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0u8; plane * 3];
    for (idx, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + idx] = pixel[c];
        }
    }
    data
}

/// Turn a packed `3 x height x width` byte image into a normalized `f32` tensor.
pub fn chw_to_tensor(
    bytes: &[u8],
    height: usize,
    width: usize,
    normalization: &Normalization,
    device: &Device,
) -> Result<Tensor> {
    let plane = height * width;
    if bytes.len() != plane * 3 {
        return Err(DatasetError::Format(format!(
            "expected {} image bytes for 3x{height}x{width}, found {}",
            plane * 3,
            bytes.len()
        )));
    }
    let mut data = Vec::with_capacity(bytes.len());
    for c in 0..3 {
        let mean = normalization.mean[c];
        let std = normalization.std[c];
        data.extend(
            bytes[c * plane..(c + 1) * plane]
                .iter()
                .map(|&value| (value as f32 / 255.0 - mean) / std),
        );
    }
    Ok(Tensor::from_vec(data, (3, height, width), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chw_layout_separates_channels() {
        let mut rgb = RgbImage::new(2, 1);
        rgb.put_pixel(0, 0, image::Rgb([1, 2, 3]));
        rgb.put_pixel(1, 0, image::Rgb([4, 5, 6]));
        assert_eq!(rgb_to_chw(&rgb), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn normalizes_per_channel() -> anyhow::Result<()> {
        let norm = Normalization::new([0.0, 0.5, 1.0], [1.0, 0.5, 1.0]);
        let tensor = chw_to_tensor(&[255, 0, 255], 1, 1, &norm, &Device::Cpu)?;
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values, vec![1.0, -1.0, 0.0]);
        Ok(())
    }
}
