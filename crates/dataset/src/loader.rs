use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};
use tracing::debug;

use crate::{
    accessor::{CaptionDataset, CaptionItem},
    split::Split,
};

/// A collated mini-batch, already on the target device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, S, S]` normalized images.
    pub images: Tensor,
    /// `[B, L]` encoded captions.
    pub captions: Tensor,
    pub lengths: Vec<usize>,
    /// `[B, cpi, L]` reference captions, only for validation and test splits.
    pub all_captions: Option<Tensor>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

pub struct BatchLoader<'a> {
    dataset: &'a CaptionDataset,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
    indices: Vec<usize>,
    position: usize,
    pool: ThreadPool,
    device: Device,
}

impl<'a> BatchLoader<'a> {
    pub fn new(
        dataset: &'a CaptionDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        workers: usize,
        device: &Device,
    ) -> Result<Self> {
        ensure!(batch_size > 0, "batch_size must be positive");
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|idx| format!("caption-loader-{idx}"))
            .build()
            .context("failed to build image decoding pool")?;
        let mut loader = Self {
            dataset,
            batch_size,
            shuffle,
            rng: StdRng::seed_from_u64(seed),
            indices: (0..dataset.count()).collect(),
            position: 0,
            pool,
            device: device.clone(),
        };
        loader.reset();
        Ok(loader)
    }

    pub fn dataset(&self) -> &CaptionDataset {
        self.dataset
    }

    /// Number of batches per epoch, the last one possibly partial.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Rewind to the start of a new epoch, reshuffling when enabled.
    pub fn reset(&mut self) {
        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
        self.position = 0;
    }

    pub fn next_batch(&mut self) -> Option<Result<Batch>> {
        if self.position >= self.indices.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.indices.len());
        let start = self.position;
        self.position = end;
        Some(self.collate(start, end))
    }

    fn collate(&self, start: usize, end: usize) -> Result<Batch> {
        let dataset = self.dataset;
        let batch_indices = &self.indices[start..end];
        let items: Vec<CaptionItem> = self.pool.install(|| {
            batch_indices
                .par_iter()
                .map(|&idx| dataset.get(idx))
                .collect::<crate::Result<Vec<_>>>()
        })?;

        let images: Vec<Tensor> = items.iter().map(|item| item.image.clone()).collect();
        let images = Tensor::stack(&images, 0)?.to_device(&self.device)?;
        let caption_len = dataset.caption_len();
        let flat: Vec<u32> = items
            .iter()
            .flat_map(|item| item.caption.iter().copied())
            .collect();
        let captions = Tensor::from_vec(flat, (items.len(), caption_len), &self.device)?;
        let lengths = items.iter().map(|item| item.length).collect();
        let all_captions = match dataset.split() {
            Split::Train => None,
            Split::Val | Split::Test => {
                let cpi = dataset.captions_per_image();
                let flat: Vec<u32> = items
                    .iter()
                    .flat_map(|item| item.all_captions.iter().flatten().copied())
                    .collect();
                Some(Tensor::from_vec(
                    flat,
                    (items.len(), cpi, caption_len),
                    &self.device,
                )?)
            }
        };
        debug!(
            split = dataset.split().as_str(),
            batch = items.len(),
            start,
            "collated batch"
        );
        Ok(Batch {
            images,
            captions,
            lengths,
            all_captions,
        })
    }
}

impl Iterator for BatchLoader<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch()
    }
}
