use std::path::PathBuf;

use captioner_config::ConfigOverrides;
use captioner_core::DeviceKind;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Image captioning dataset packer and trainer", long_about = None)]
pub struct Cli {
    /// Only log errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build the vocabulary and pack the train, val and test splits.
    Prepare(PrepareArgs),
    /// Train the caption model on a packed dataset.
    Train(TrainArgs),
}

#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Caption corpus JSON listing images, splits and tokenized sentences.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub caption_source: Option<PathBuf>,

    /// Directory the corpus image paths are relative to.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub image_root: Option<PathBuf>,

    /// Where packed splits and WORDMAP.json are written.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub output_dir: Option<PathBuf>,

    #[arg(long, help_heading = "Packing")]
    pub captions_per_image: Option<usize>,

    /// Keep words seen strictly more often than this.
    #[arg(long, help_heading = "Packing")]
    pub min_word_freq: Option<usize>,

    /// Drop captions with more tokens than this.
    #[arg(long, help_heading = "Packing")]
    pub max_caption_len: Option<usize>,

    /// Seed for caption resampling.
    #[arg(long, help_heading = "Packing")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Packed dataset directory produced by `prepare`.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub output_dir: Option<PathBuf>,

    /// Checkpoint written after every epoch.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub checkpoint: Option<PathBuf>,

    /// Resume model, optimizer state and epoch counter from a checkpoint.
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub resume: Option<PathBuf>,

    /// Pretrained backbone weights (safetensors, torchvision names).
    #[arg(long, value_name = "PATH", help_heading = "Data")]
    pub encoder_weights: Option<PathBuf>,

    /// Device backend to execute on (cpu/metal/cuda).
    #[arg(long, help_heading = "Training")]
    pub device: Option<DeviceKind>,

    #[arg(long, help_heading = "Training")]
    pub batch_size: Option<usize>,

    #[arg(long, help_heading = "Training")]
    pub epochs: Option<usize>,

    /// Train backbone stages 2 to 4 alongside the decoder.
    #[arg(long, help_heading = "Training")]
    pub fine_tune_encoder: bool,

    /// Threads decoding images for each batch.
    #[arg(long, help_heading = "Training")]
    pub workers: Option<usize>,
}

impl From<&PrepareArgs> for ConfigOverrides {
    fn from(args: &PrepareArgs) -> Self {
        let mut overrides = ConfigOverrides::default();
        overrides.config_path = args.config.clone();
        overrides.caption_source = args.caption_source.clone();
        overrides.image_root = args.image_root.clone();
        overrides.output_dir = args.output_dir.clone();
        overrides.packing.captions_per_image = args.captions_per_image;
        overrides.packing.min_word_freq = args.min_word_freq;
        overrides.packing.max_caption_len = args.max_caption_len;
        overrides.packing.seed = args.seed;
        overrides
    }
}

impl From<&TrainArgs> for ConfigOverrides {
    fn from(args: &TrainArgs) -> Self {
        let mut overrides = ConfigOverrides::default();
        overrides.config_path = args.config.clone();
        overrides.output_dir = args.output_dir.clone();
        overrides.checkpoint = args.checkpoint.clone();
        overrides.training.device = args.device;
        overrides.training.batch_size = args.batch_size;
        overrides.training.epochs = args.epochs;
        overrides.training.workers = args.workers;
        if args.fine_tune_encoder {
            overrides.training.fine_tune_encoder = Some(true);
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use captioner_config::AppConfig;

    #[test]
    fn train_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "captioner",
            "train",
            "--device",
            "cuda",
            "--batch-size",
            "8",
            "--fine-tune-encoder",
        ])
        .expect("valid arguments");
        let Command::Train(args) = cli.command else {
            panic!("expected the train subcommand");
        };
        let mut config = AppConfig::default();
        config += ConfigOverrides::from(&args);
        assert_eq!(config.training.device, DeviceKind::Cuda);
        assert_eq!(config.training.batch_size, 8);
        assert!(config.training.fine_tune_encoder);
        assert_eq!(config.training.epochs, 1);
    }

    #[test]
    fn prepare_flags_become_overrides() {
        let cli = Cli::try_parse_from([
            "captioner",
            "--quiet",
            "prepare",
            "--captions-per-image",
            "3",
            "--seed",
            "9",
        ])
        .expect("valid arguments");
        assert!(cli.quiet);
        let Command::Prepare(args) = cli.command else {
            panic!("expected the prepare subcommand");
        };
        let mut config = AppConfig::default();
        config += ConfigOverrides::from(&args);
        assert_eq!(config.packing.captions_per_image, 3);
        assert_eq!(config.packing.seed, 9);
        assert_eq!(config.packing.min_word_freq, 5);
    }
}
