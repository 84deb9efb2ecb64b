use std::{fs, path::Path};

use candle_core::{Device, Tensor};

use crate::{
    container::ArchiveReader,
    error::{DatasetError, Result},
    preprocess::{Normalization, chw_to_tensor},
    split::Split,
};

/// One caption of a packed split together with its image.
#[derive(Debug, Clone)]
pub struct CaptionItem {
    /// `[3, S, S]` normalized `f32` image.
    pub image: Tensor,
    pub caption: Vec<u32>,
    pub length: usize,
    /// Every reference caption of the image for validation and test splits; empty for train.
    pub all_captions: Vec<Vec<u32>>,
}

/// Read-only view over a packed split.
#[derive(Debug, Clone)]
pub struct CaptionDataset {
    split: Split,
    images: ArchiveReader,
    captions: Vec<Vec<u32>>,
    lengths: Vec<usize>,
    captions_per_image: usize,
    caption_len: usize,
    normalization: Normalization,
}

impl CaptionDataset {
    pub fn open(dir: impl AsRef<Path>, split: &str, normalization: Normalization) -> Result<Self> {
        let split: Split = split.parse()?;
        let dir = dir.as_ref();
        let images = ArchiveReader::open(split.images_file(dir))?;
        let captions: Vec<Vec<u32>> = read_json(&split.captions_file(dir))?;
        let lengths: Vec<usize> = read_json(&split.lengths_file(dir))?;
        let captions_per_image = images.header().captions_per_image as usize;

        if captions.len() != images.len() * captions_per_image {
            return Err(DatasetError::Format(format!(
                "{split} has {} captions for {} images at {captions_per_image} per image",
                captions.len(),
                images.len()
            )));
        }
        if lengths.len() != captions.len() {
            return Err(DatasetError::Format(format!(
                "{split} has {} captions but {} lengths",
                captions.len(),
                lengths.len()
            )));
        }
        let caption_len = captions.first().map_or(0, Vec::len);
        for (idx, (caption, &length)) in captions.iter().zip(&lengths).enumerate() {
            if caption.len() != caption_len || length == 0 || length > caption_len {
                return Err(DatasetError::Format(format!(
                    "{split} caption {idx} has {} ids and length {length}, expected {caption_len} ids",
                    caption.len()
                )));
            }
        }
        Ok(Self {
            split,
            images,
            captions,
            lengths,
            captions_per_image,
            caption_len,
            normalization,
        })
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// Number of captions, which is `image_count * captions_per_image`.
    pub fn count(&self) -> usize {
        self.captions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captions.is_empty()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn captions_per_image(&self) -> usize {
        self.captions_per_image
    }

    /// Fixed encoded caption length, `max_len + 2`.
    pub fn caption_len(&self) -> usize {
        self.caption_len
    }

    pub fn image_size(&self) -> (usize, usize) {
        let header = self.images.header();
        (header.height as usize, header.width as usize)
    }

    pub fn get(&self, index: usize) -> Result<CaptionItem> {
        if index >= self.count() {
            return Err(DatasetError::IndexOutOfRange {
                index,
                len: self.count(),
            });
        }
        let image_index = index / self.captions_per_image;
        let (height, width) = self.image_size();
        let image = chw_to_tensor(
            self.images.image(image_index)?,
            height,
            width,
            &self.normalization,
            &Device::Cpu,
        )?;
        let all_captions = match self.split {
            Split::Train => Vec::new(),
            Split::Val | Split::Test => {
                let start = image_index * self.captions_per_image;
                self.captions[start..start + self.captions_per_image].to_vec()
            }
        };
        Ok(CaptionItem {
            image,
            caption: self.captions[index].clone(),
            length: self.lengths[index],
            all_captions,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
