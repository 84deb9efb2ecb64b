pub mod checkpoint;
pub mod clip;
pub mod loss;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{CheckpointMeta, load_checkpoint, save_checkpoint};
pub use clip::clip_gradients;
pub use loss::{CaptionLoss, caption_loss};
pub use optimizer::{Adam, AdamParams};
pub use trainer::{EpochSummary, StepStats, Trainer, TrainerConfig};
