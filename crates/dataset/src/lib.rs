//! Caption dataset preparation and access: corpus ingestion, caption resampling, image
//! preprocessing, the packed split format and batched loading.

pub mod accessor;
pub mod container;
pub mod error;
pub mod loader;
pub mod packer;
pub mod preprocess;
mod progress;
pub mod resample;
pub mod source;
pub mod split;

pub use accessor::{CaptionDataset, CaptionItem};
pub use container::{ArchiveHeader, ArchiveReader, ArchiveWriter};
pub use error::{DatasetError, Result};
pub use loader::{Batch, BatchLoader};
pub use packer::{
    DatasetPacker, PackedSplitSummary, PackingSettings, PreparedDataset, WORDMAP_FILE,
    prepare_dataset,
};
pub use preprocess::{Normalization, chw_to_tensor, load_normalized_image};
pub use resample::resample_captions;
pub use source::{
    CaptionSource, CollectedSplits, SourceImage, SourceSentence, SplitListing, collect_splits,
    load_caption_source,
};
pub use split::Split;
