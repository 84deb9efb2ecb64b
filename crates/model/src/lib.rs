pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod lstm;
pub mod model;
mod pooling;

pub use attention::Attention;
pub use decoder::{AttentionDecoder, DecoderConfig, DecoderOutput};
pub use encoder::{BackboneStage, EncoderConfig, ParameterGroup, VisualEncoder};
pub use lstm::LstmCell;
pub use model::CaptionModel;
