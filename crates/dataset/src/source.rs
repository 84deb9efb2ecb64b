//! Caption-corpus ingestion.
//!
//! The corpus is a JSON document listing every image with its provenance split and its
//! pre-tokenized sentences.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use captioner_core::TokenCounter;
use serde::Deserialize;
use tracing::{info, warn};

use crate::split::Split;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionSource {
    pub images: Vec<SourceImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceImage {
    /// Sub-directory under the image root. Absent for corpora that keep every image in one
    /// directory.
    #[serde(default)]
    pub filepath: Option<String>,
    pub filename: String,
    pub split: String,
    #[serde(default)]
    pub sentences: Vec<SourceSentence>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSentence {
    pub tokens: Vec<String>,
}

pub fn load_caption_source(path: impl AsRef<Path>) -> Result<CaptionSource> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read caption source {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse caption source {}", path.display()))
}

/// Images of one split, index-aligned with their surviving captions.
#[derive(Debug, Clone, Default)]
pub struct SplitListing {
    pub paths: Vec<PathBuf>,
    pub captions: Vec<Vec<Vec<String>>>,
}

impl SplitListing {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn push(&mut self, path: PathBuf, captions: Vec<Vec<String>>) {
        self.paths.push(path);
        self.captions.push(captions);
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectedSplits {
    pub train: SplitListing,
    pub val: SplitListing,
    pub test: SplitListing,
    /// Frequencies over every caption in the corpus, including the ones dropped for length.
    pub counter: TokenCounter,
}

impl CollectedSplits {
    pub fn listing(&self, split: Split) -> &SplitListing {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    fn listing_mut(&mut self, split: Split) -> &mut SplitListing {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }
}

/// Walk the corpus in file order, count tokens and assign each image to its split.
pub fn collect_splits(source: &CaptionSource, image_root: &Path, max_len: usize) -> CollectedSplits {
    let mut collected = CollectedSplits::default();
    let mut excluded = 0usize;
    for image in &source.images {
        let mut captions = Vec::with_capacity(image.sentences.len());
        for sentence in &image.sentences {
            collected.counter.update(&sentence.tokens);
            if sentence.tokens.len() <= max_len {
                captions.push(sentence.tokens.clone());
            }
        }
        if captions.is_empty() {
            excluded += 1;
            continue;
        }
        let Some(split) = Split::from_provenance(&image.split) else {
            warn!(
                filename = %image.filename,
                split = %image.split,
                "skipping image with unrecognised split label"
            );
            continue;
        };
        let path = match &image.filepath {
            Some(dir) => image_root.join(dir).join(&image.filename),
            None => image_root.join(&image.filename),
        };
        collected.listing_mut(split).push(path, captions);
    }
    if excluded > 0 {
        warn!(excluded, max_len, "excluded images left without captions");
    }
    info!(
        train = collected.train.len(),
        val = collected.val.len(),
        test = collected.test.len(),
        distinct_tokens = collected.counter.len(),
        "collected caption corpus"
    );
    collected
}
