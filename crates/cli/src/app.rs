use anyhow::{Context, Result};
use captioner_config::{AppConfig, ConfigOverrides, LocalFileSystem};
use captioner_core::{Vocabulary, prepare_device};
use captioner_dataset::{
    BatchLoader, CaptionDataset, Normalization, PackingSettings, WORDMAP_FILE, prepare_dataset,
};
use captioner_model::{CaptionModel, DecoderConfig, EncoderConfig};
use captioner_train::{Trainer, TrainerConfig};
use tracing::info;

use crate::args::{PrepareArgs, TrainArgs};

const APP_NAME: &str = "captioner";

fn load_config(fs: &LocalFileSystem, overrides: ConfigOverrides) -> Result<AppConfig> {
    let (config, descriptor) = AppConfig::load_with_overrides(fs, overrides)?;
    if descriptor.created {
        info!("Wrote default configuration to {}", descriptor.path.display());
    } else {
        info!("Using configuration {}", descriptor.path.display());
    }
    Ok(config)
}

pub fn run_prepare(args: PrepareArgs) -> Result<()> {
    let fs = LocalFileSystem::new(APP_NAME);
    let config = load_config(&fs, ConfigOverrides::from(&args))?;
    let out_dir = config.dataset_dir(&fs);
    let packing = &config.packing;
    let settings = PackingSettings {
        captions_per_image: packing.captions_per_image,
        min_word_freq: packing.min_word_freq,
        max_caption_len: packing.max_caption_len,
        image_size: packing.image_size,
        seed: packing.seed,
    };
    info!(
        source = %config.data.caption_source.display(),
        images = %config.data.image_root.display(),
        out = %out_dir.display(),
        "preparing dataset"
    );
    let prepared = prepare_dataset(
        &config.data.caption_source,
        &config.data.image_root,
        &out_dir,
        settings,
    )?;
    for split in &prepared.splits {
        info!(
            split = split.split.as_str(),
            images = split.images,
            captions = split.captions,
            archive = %split.archive.display(),
            "split ready"
        );
    }
    Ok(())
}

pub fn run_train(args: TrainArgs) -> Result<()> {
    let fs = LocalFileSystem::new(APP_NAME);
    let config = load_config(&fs, ConfigOverrides::from(&args))?;
    let device = prepare_device(config.training.device)?;
    let data_dir = config.dataset_dir(&fs);
    let checkpoint_path = config.checkpoint_path(&fs);

    let vocab = Vocabulary::load(data_dir.join(WORDMAP_FILE))
        .with_context(|| format!("no vocabulary in {}, run `prepare` first", data_dir.display()))?;
    let training = &config.training;
    let normalization = Normalization::new(training.image_mean, training.image_std);
    let train_set = CaptionDataset::open(&data_dir, "TRAIN", normalization)?;
    let val_set = CaptionDataset::open(&data_dir, "VAL", normalization)?;
    info!(
        vocab = vocab.len(),
        train = train_set.count(),
        val = val_set.count(),
        device = ?training.device,
        "loaded packed dataset"
    );

    let settings = &config.model;
    let encoder = EncoderConfig {
        layers: settings.backbone_layers,
        output_dim: settings.encoder_dim,
        encoded_image_size: settings.encoded_image_size,
    };
    let decoder = DecoderConfig::new(
        settings.attention_dim,
        settings.embed_dim,
        settings.decoder_dim,
        vocab.len(),
        settings.encoder_dim,
        settings.dropout,
    );
    let mut model = CaptionModel::new(encoder, decoder, &device)?;
    if let Some(weights) = args.encoder_weights.as_deref() {
        model.encoder.load_weights(weights)?;
    }

    let mut trainer = Trainer::new(
        model,
        TrainerConfig {
            encoder_lr: training.encoder_lr,
            decoder_lr: training.decoder_lr,
            grad_clip: training.grad_clip,
            alpha_c: training.alpha_c,
            fine_tune_encoder: training.fine_tune_encoder,
            print_freq: training.print_freq,
            checkpoint_path,
        },
    )?;
    if let Some(path) = args.resume.as_deref() {
        trainer.resume(path)?;
        info!(epoch = trainer.epoch(), "resumed training");
    }

    let mut train_loader = BatchLoader::new(
        &train_set,
        training.batch_size,
        true,
        training.shuffle_seed,
        training.workers,
        &device,
    )?;
    let mut val_loader = BatchLoader::new(
        &val_set,
        training.batch_size,
        false,
        training.shuffle_seed,
        training.workers,
        &device,
    )?;
    let summaries = trainer.fit(training.epochs, &mut train_loader, &mut val_loader)?;
    match summaries.last() {
        Some(last) => info!(
            epochs = last.epoch,
            train_loss = last.train_loss,
            val_loss = last.val_loss,
            checkpoint = %trainer.config().checkpoint_path.display(),
            "training finished"
        ),
        None => info!(
            epoch = trainer.epoch(),
            "checkpoint already covers the requested epochs"
        ),
    }
    Ok(())
}
