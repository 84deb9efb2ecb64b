use std::{
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use captioner_core::DeviceKind;
use serde::{Deserialize, Serialize};

use crate::fs::{AppPath, LocalFileSystem};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data: DataSettings,
    pub packing: PackingSettings,
    pub model: ModelSettings,
    pub training: TrainingSettings,
}

/// Where raw inputs come from and where derived artifacts go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// Caption corpus JSON (`{"images": [{"filepath", "filename", "split", "sentences"}]}`).
    pub caption_source: PathBuf,
    /// Directory that `filepath/filename` entries are relative to.
    pub image_root: PathBuf,
    /// Packed dataset directory. Defaults to the platform data dir.
    pub output_dir: Option<PathBuf>,
    /// Checkpoint written after every epoch. Defaults to the platform data dir.
    pub checkpoint: Option<PathBuf>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            caption_source: PathBuf::from("dataset_coco.json"),
            image_root: PathBuf::from("."),
            output_dir: None,
            checkpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
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

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub encoded_image_size: usize,
    pub encoder_dim: usize,
    pub backbone_layers: [usize; 4],
    pub attention_dim: usize,
    pub embed_dim: usize,
    pub decoder_dim: usize,
    pub dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            encoded_image_size: 14,
            encoder_dim: 2048,
            backbone_layers: [3, 8, 36, 3],
            attention_dim: 512,
            embed_dim: 512,
            decoder_dim: 512,
            dropout: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub device: DeviceKind,
    pub batch_size: usize,
    pub workers: usize,
    pub epochs: usize,
    pub encoder_lr: f64,
    pub decoder_lr: f64,
    pub grad_clip: Option<f64>,
    pub alpha_c: f64,
    pub fine_tune_encoder: bool,
    pub print_freq: usize,
    pub shuffle_seed: u64,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpu,
            batch_size: 256,
            workers: 1,
            epochs: 1,
            encoder_lr: 1e-4,
            decoder_lr: 4e-4,
            grad_clip: Some(5.0),
            alpha_c: 1.0,
            fine_tune_encoder: false,
            print_freq: 50,
            shuffle_seed: 0,
            image_mean: IMAGENET_MEAN,
            image_std: IMAGENET_STD,
        }
    }
}

/// Where the active configuration was read from.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub path: PathBuf,
    /// The file did not exist and was written with defaults.
    pub created: bool,
}

impl AppConfig {
    /// Read `override_path`, or the per-user `config.toml`, writing defaults on first use.
    pub fn load_or_init(
        fs: &LocalFileSystem,
        override_path: Option<&Path>,
    ) -> Result<(Self, ConfigDescriptor)> {
        let path = override_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| fs.resolve(&AppPath::ConfigFile));
        let (config, created) = load_config_file(&path)?;
        config.validate()?;
        Ok((config, ConfigDescriptor { path, created }))
    }

    /// [`AppConfig::load_or_init`] from `overrides.config_path`, then fold the overrides in.
    pub fn load_with_overrides(
        fs: &LocalFileSystem,
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor)> {
        let (mut config, descriptor) = Self::load_or_init(fs, overrides.config_path.as_deref())?;
        config += overrides;
        config.validate()?;
        Ok((config, descriptor))
    }

    /// Reject settings no component can honour.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.packing.captions_per_image > 0,
            "packing.captions_per_image must be positive"
        );
        ensure!(
            self.packing.image_size > 0,
            "packing.image_size must be positive"
        );
        ensure!(
            self.model.encoded_image_size > 0,
            "model.encoded_image_size must be positive"
        );
        ensure!(
            (0.0..1.0).contains(&self.model.dropout),
            "model.dropout must be in [0, 1), got {}",
            self.model.dropout
        );
        ensure!(
            self.training.batch_size > 0,
            "training.batch_size must be positive"
        );
        ensure!(
            self.training.print_freq > 0,
            "training.print_freq must be positive"
        );
        if let Some(clip) = self.training.grad_clip {
            ensure!(clip > 0.0, "training.grad_clip must be positive, got {clip}");
        }
        ensure!(
            self.training.image_std.iter().all(|&s| s > 0.0),
            "training.image_std entries must be positive"
        );
        Ok(())
    }

    pub fn dataset_dir(&self, fs: &LocalFileSystem) -> PathBuf {
        self.data
            .output_dir
            .clone()
            .unwrap_or_else(|| fs.resolve(&AppPath::DatasetDir))
    }

    pub fn checkpoint_path(&self, fs: &LocalFileSystem) -> PathBuf {
        self.data
            .checkpoint
            .clone()
            .unwrap_or_else(|| {
                fs.resolve(&AppPath::Checkpoint("caption_model.safetensors".into()))
            })
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(path) = overrides.caption_source.as_ref() {
            self.data.caption_source = path.clone();
        }
        if let Some(path) = overrides.image_root.as_ref() {
            self.data.image_root = path.clone();
        }
        if let Some(path) = overrides.output_dir.as_ref() {
            self.data.output_dir = Some(path.clone());
        }
        if let Some(path) = overrides.checkpoint.as_ref() {
            self.data.checkpoint = Some(path.clone());
        }

        if let Some(cpi) = overrides.packing.captions_per_image {
            self.packing.captions_per_image = cpi;
        }
        if let Some(min_word_freq) = overrides.packing.min_word_freq {
            self.packing.min_word_freq = min_word_freq;
        }
        if let Some(max_caption_len) = overrides.packing.max_caption_len {
            self.packing.max_caption_len = max_caption_len;
        }
        if let Some(seed) = overrides.packing.seed {
            self.packing.seed = seed;
        }

        if let Some(device) = overrides.training.device {
            self.training.device = device;
        }
        if let Some(batch_size) = overrides.training.batch_size {
            self.training.batch_size = batch_size;
        }
        if let Some(workers) = overrides.training.workers {
            self.training.workers = workers;
        }
        if let Some(epochs) = overrides.training.epochs {
            self.training.epochs = epochs;
        }
        if let Some(encoder_lr) = overrides.training.encoder_lr {
            self.training.encoder_lr = encoder_lr;
        }
        if let Some(decoder_lr) = overrides.training.decoder_lr {
            self.training.decoder_lr = decoder_lr;
        }
        if let Some(fine_tune) = overrides.training.fine_tune_encoder {
            self.training.fine_tune_encoder = fine_tune;
        }
    }
}

fn load_config_file(path: &Path) -> Result<(AppConfig, bool)> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let config = AppConfig::default();
        fs::write(path, toml::to_string_pretty(&config)?)
            .with_context(|| format!("failed to write configuration to {}", path.display()))?;
        return Ok((config, true));
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse configuration at {}", path.display()))?;
    Ok((config, false))
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub caption_source: Option<PathBuf>,
    pub image_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub checkpoint: Option<PathBuf>,
    pub packing: PackingOverride,
    pub training: TrainingOverride,
}

#[derive(Debug, Default, Clone)]
pub struct PackingOverride {
    pub captions_per_image: Option<usize>,
    pub min_word_freq: Option<usize>,
    pub max_caption_len: Option<usize>,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct TrainingOverride {
    pub device: Option<DeviceKind>,
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub epochs: Option<usize>,
    pub encoder_lr: Option<f64>,
    pub decoder_lr: Option<f64>,
    pub fine_tune_encoder: Option<bool>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}
