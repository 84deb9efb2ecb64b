pub mod runtime;
pub mod tensor;
pub mod tracker;
pub mod vocab;

pub use runtime::{DeviceKind, prepare_device};
pub use tracker::LossTracker;
pub use vocab::{
    END_TOKEN, EncodedCaption, PAD_TOKEN, START_TOKEN, TokenCounter, UNK_TOKEN, Vocabulary,
};
