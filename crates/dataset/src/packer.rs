use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use captioner_core::Vocabulary;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;

use crate::{
    container::{ArchiveHeader, ArchiveWriter},
    preprocess::load_normalized_image,
    progress::packing_progress,
    resample::resample_captions,
    source::{CollectedSplits, SplitListing, collect_splits, load_caption_source},
    split::Split,
};

/// File name of the persisted vocabulary inside a dataset directory.
pub const WORDMAP_FILE: &str = "WORDMAP.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingSettings {
    pub captions_per_image: usize,
    pub min_word_freq: usize,
    pub max_caption_len: usize,
    pub image_size: u32,
    pub seed: u64,
}

impl Default for PackingSettings {
    fn default() -> Self {
        Self {
            captions_per_image: 5,
            min_word_freq: 5,
            max_caption_len: 50,
            image_size: 256,
            seed: 123,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSplitSummary {
    pub split: Split,
    pub images: usize,
    pub captions: usize,
    pub archive: PathBuf,
}

pub struct DatasetPacker<'a> {
    settings: PackingSettings,
    vocab: &'a Vocabulary,
}

impl<'a> DatasetPacker<'a> {
    pub fn new(settings: PackingSettings, vocab: &'a Vocabulary) -> Self {
        Self { settings, vocab }
    }

    /// Pack train, val and test in that order, drawing every resample from one generator
    /// seeded with `settings.seed`.
    pub fn pack_all(&self, splits: &CollectedSplits, out_dir: &Path) -> Result<Vec<PackedSplitSummary>> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create dataset directory {}", out_dir.display()))?;
        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        Split::ALL
            .into_iter()
            .map(|split| self.pack_split(split, splits.listing(split), out_dir, &mut rng))
            .collect()
    }

    /// Encode, resample and store one split. Any image that fails to load aborts the split
    /// before its artifacts are moved into place.
    pub fn pack_split<R: Rng + ?Sized>(
        &self,
        split: Split,
        listing: &SplitListing,
        out_dir: &Path,
        rng: &mut R,
    ) -> Result<PackedSplitSummary> {
        let cpi = self.settings.captions_per_image;
        let size = self.settings.image_size;
        ensure!(cpi > 0, "captions_per_image must be positive");
        ensure!(
            listing.paths.len() == listing.captions.len(),
            "{split} listing has {} images but {} caption lists",
            listing.paths.len(),
            listing.captions.len()
        );
        let image_count = u32::try_from(listing.len())
            .with_context(|| format!("{split} holds too many images for one archive"))?;
        let header = ArchiveHeader::new(cpi as u32, image_count, size, size);
        let archive_path = split.images_file(out_dir);
        let mut writer = ArchiveWriter::create(&archive_path, header)
            .with_context(|| format!("failed to create {}", archive_path.display()))?;

        let mut encoded = Vec::with_capacity(listing.len() * cpi);
        let mut lengths = Vec::with_capacity(listing.len() * cpi);
        let progress = packing_progress(listing.len(), split.as_str());
        for (path, captions) in listing.paths.iter().zip(&listing.captions) {
            let chosen = resample_captions(captions, cpi, rng)
                .with_context(|| format!("failed to resample captions for {}", path.display()))?;
            let pixels = load_normalized_image(path, size)
                .with_context(|| format!("failed to pack {split} image {}", path.display()))?;
            writer.push(&pixels)?;
            for caption in &chosen {
                let caption = self.vocab.encode(caption, self.settings.max_caption_len)?;
                encoded.push(caption.ids);
                lengths.push(caption.length);
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        ensure!(
            encoded.len() == listing.len() * cpi && lengths.len() == encoded.len(),
            "{split} produced {} captions for {} images",
            encoded.len(),
            listing.len()
        );
        write_json_atomic(&split.captions_file(out_dir), &encoded)?;
        write_json_atomic(&split.lengths_file(out_dir), &lengths)?;
        let archive = writer
            .finish()
            .with_context(|| format!("failed to finalise {}", archive_path.display()))?;
        info!(
            split = split.as_str(),
            images = listing.len(),
            captions = encoded.len(),
            "packed split"
        );
        Ok(PackedSplitSummary {
            split,
            images: listing.len(),
            captions: encoded.len(),
            archive,
        })
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to stage {}", path.display()))?;
    serde_json::to_writer(&mut file, value)
        .with_context(|| format!("failed to serialise {}", path.display()))?;
    file.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub vocab: Vocabulary,
    pub splits: Vec<PackedSplitSummary>,
}

/// Full pipeline: read the caption corpus, build and persist the vocabulary, pack every split.
pub fn prepare_dataset(
    caption_source: &Path,
    image_root: &Path,
    out_dir: &Path,
    settings: PackingSettings,
) -> Result<PreparedDataset> {
    let source = load_caption_source(caption_source)?;
    let collected = collect_splits(&source, image_root, settings.max_caption_len);
    let vocab = Vocabulary::build(&collected.counter, settings.min_word_freq)?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create dataset directory {}", out_dir.display()))?;
    vocab.save(out_dir.join(WORDMAP_FILE))?;
    let splits = DatasetPacker::new(settings, &vocab).pack_all(&collected, out_dir)?;
    info!(
        vocab = vocab.len(),
        dir = %out_dir.display(),
        "dataset prepared"
    );
    Ok(PreparedDataset { vocab, splits })
}
