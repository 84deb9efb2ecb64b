use std::{fs, path::Path};

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use captioner_dataset::{
    ArchiveHeader, ArchiveWriter, Batch, BatchLoader, CaptionDataset, Normalization, Split,
};
use captioner_model::{CaptionModel, DecoderConfig, EncoderConfig};
use captioner_train::{Trainer, TrainerConfig};
use tempfile::tempdir;

const VOCAB: usize = 8;
const SIZE: u32 = 32;

fn tiny_model(device: &Device) -> Result<CaptionModel> {
    let encoder = EncoderConfig {
        layers: [1, 1, 1, 1],
        output_dim: 32,
        encoded_image_size: 2,
    };
    let decoder = DecoderConfig::new(4, 4, 6, VOCAB, 32, 0.0);
    CaptionModel::new(encoder, decoder, device)
}

fn tiny_batch(device: &Device) -> Result<Batch> {
    let captions = vec![5u32, 1, 2, 6, 0, 0, 5, 3, 6, 0, 0, 0];
    Ok(Batch {
        images: Tensor::randn(0f32, 1.0, (2, 3, SIZE as usize, SIZE as usize), device)?,
        captions: Tensor::from_vec(captions, (2, 6), device)?,
        lengths: vec![4, 3],
        all_captions: None,
    })
}

fn config(checkpoint: &Path) -> TrainerConfig {
    TrainerConfig {
        encoder_lr: 1e-3,
        decoder_lr: 1e-2,
        fine_tune_encoder: true,
        print_freq: 1,
        checkpoint_path: checkpoint.to_path_buf(),
        ..TrainerConfig::default()
    }
}

fn max_difference(a: &VarMap, b: &VarMap) -> Result<f32> {
    let a = a.data().lock().unwrap();
    let b = b.data().lock().unwrap();
    let mut worst = 0f32;
    for (name, var) in a.iter() {
        let other = b.get(name).expect("same parameter set");
        let diff = (var.as_tensor() - other.as_tensor())?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        worst = worst.max(diff);
    }
    Ok(worst)
}

#[test]
fn a_few_steps_reduce_the_loss() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempdir()?;
    let mut trainer = Trainer::new(tiny_model(&device)?, config(&dir.path().join("ckpt.safetensors")))?;
    let batch = tiny_batch(&device)?;
    let first = trainer.train_step(&batch)?;
    assert_eq!(first.tokens, 5);
    let mut last = first;
    for _ in 0..30 {
        last = trainer.train_step(&batch)?;
    }
    assert!(
        last.loss < first.loss,
        "loss went from {} to {}",
        first.loss,
        last.loss
    );
    Ok(())
}

#[test]
fn frozen_encoder_has_no_optimizer() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempdir()?;
    let config = TrainerConfig {
        fine_tune_encoder: false,
        ..config(&dir.path().join("ckpt.safetensors"))
    };
    let mut trainer = Trainer::new(tiny_model(&device)?, config)?;
    assert!(trainer.encoder_optimizer().is_none());
    assert!(!trainer.model().encoder.is_trainable());
    trainer.train_step(&tiny_batch(&device)?)?;
    Ok(())
}

#[test]
fn checkpoint_round_trip_yields_identical_next_update() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempdir()?;
    let path = dir.path().join("ckpt.safetensors");
    let batch = tiny_batch(&device)?;

    let mut original = Trainer::new(tiny_model(&device)?, config(&path))?;
    original.train_step(&batch)?;
    original.save_checkpoint(&path)?;

    let mut restored = Trainer::new(tiny_model(&device)?, config(&path))?;
    assert!(max_difference(original.model().decoder.varmap(), restored.model().decoder.varmap())? > 0.0);
    restored.resume(&path)?;
    assert_eq!(restored.epoch(), original.epoch());

    original.train_step(&batch)?;
    restored.train_step(&batch)?;
    let decoder = max_difference(original.model().decoder.varmap(), restored.model().decoder.varmap())?;
    let encoder = max_difference(original.model().encoder.varmap(), restored.model().encoder.varmap())?;
    assert!(decoder < 1e-6, "decoder parameters diverged by {decoder}");
    assert!(encoder < 1e-6, "encoder parameters diverged by {encoder}");
    Ok(())
}

fn write_split(dir: &Path, split: Split, captions: &[Vec<u32>], lengths: &[usize]) -> Result<()> {
    let header = ArchiveHeader::new(1, captions.len() as u32, SIZE, SIZE);
    let mut writer = ArchiveWriter::create(split.images_file(dir), header)?;
    for idx in 0..captions.len() {
        writer.push(&vec![(idx * 40) as u8; header.image_len()])?;
    }
    writer.finish()?;
    fs::write(split.captions_file(dir), serde_json::to_string(captions)?)?;
    fs::write(split.lengths_file(dir), serde_json::to_string(lengths)?)?;
    Ok(())
}

#[test]
fn fit_validates_checkpoints_and_resumes() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempdir()?;
    let captions = vec![
        vec![5, 1, 2, 6, 0, 0],
        vec![5, 3, 6, 0, 0, 0],
        vec![5, 1, 3, 4, 6, 0],
    ];
    write_split(dir.path(), Split::Train, &captions, &[4, 3, 5])?;
    write_split(dir.path(), Split::Val, &captions[..2], &[4, 3])?;
    let norm = Normalization::new([0.5; 3], [0.25; 3]);
    let train = CaptionDataset::open(dir.path(), "train", norm)?;
    let val = CaptionDataset::open(dir.path(), "val", norm)?;
    let mut train_loader = BatchLoader::new(&train, 2, true, 3, 1, &device)?;
    let mut val_loader = BatchLoader::new(&val, 2, false, 0, 1, &device)?;

    let path = dir.path().join("checkpoints").join("model.safetensors");
    let mut trainer = Trainer::new(tiny_model(&device)?, config(&path))?;
    let summaries = trainer.fit(2, &mut train_loader, &mut val_loader)?;
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[1].epoch, 2);
    assert!(summaries.iter().all(|s| s.train_loss.is_finite() && s.val_loss.is_finite()));
    assert!(path.exists());

    let mut resumed = Trainer::new(tiny_model(&device)?, config(&path))?;
    resumed.resume(&path)?;
    assert_eq!(resumed.epoch(), 2);
    assert!(resumed.fit(2, &mut train_loader, &mut val_loader)?.is_empty());
    Ok(())
}
