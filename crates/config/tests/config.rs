use std::path::PathBuf;

use anyhow::Result;
use captioner_config::{AppConfig, AppPath, ConfigOverrides, LocalFileSystem};
use captioner_core::DeviceKind;

fn temp_fs(root: &std::path::Path) -> LocalFileSystem {
    LocalFileSystem::with_roots(root.join("config"), root.join("data"))
}

#[test]
fn defaults_match_reference_hyperparameters() {
    let cfg = AppConfig::default();
    assert_eq!(cfg.packing.captions_per_image, 5);
    assert_eq!(cfg.packing.min_word_freq, 5);
    assert_eq!(cfg.packing.max_caption_len, 50);
    assert_eq!(cfg.packing.image_size, 256);
    assert_eq!(cfg.model.encoder_dim, 2048);
    assert_eq!(cfg.model.encoded_image_size, 14);
    assert_eq!(cfg.training.grad_clip, Some(5.0));
    assert!(!cfg.training.fine_tune_encoder);
    assert!(cfg.validate().is_ok());
}

#[test]
fn first_load_writes_default_config_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = temp_fs(dir.path());
    let (cfg, descriptor) = AppConfig::load_or_init(&fs, None)?;
    let config_file = fs.resolve(&AppPath::ConfigFile);
    assert!(config_file.exists());
    assert!(descriptor.created);
    assert_eq!(descriptor.path, config_file);
    assert_eq!(cfg.training.batch_size, 256);

    let (reloaded, descriptor) = AppConfig::load_or_init(&fs, None)?;
    assert!(!descriptor.created);
    assert_eq!(reloaded.packing.seed, cfg.packing.seed);
    Ok(())
}

#[test]
fn physical_config_is_parsed_with_partial_sections() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = temp_fs(dir.path());
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        "[packing]\ncaptions_per_image = 3\n\n[training]\ndevice = \"cuda\"\nbatch_size = 8\n",
    )?;
    let (cfg, _) = AppConfig::load_or_init(&fs, Some(&path))?;
    assert_eq!(cfg.packing.captions_per_image, 3);
    assert_eq!(cfg.packing.min_word_freq, 5);
    assert_eq!(cfg.training.device, DeviceKind::Cuda);
    assert_eq!(cfg.training.batch_size, 8);
    Ok(())
}

#[test]
fn overrides_take_precedence() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = temp_fs(dir.path());
    let mut overrides = ConfigOverrides::default();
    overrides.output_dir = Some(PathBuf::from("/tmp/packed"));
    overrides.packing.seed = Some(7);
    overrides.training.epochs = Some(4);
    overrides.training.fine_tune_encoder = Some(true);

    let (cfg, _) = AppConfig::load_with_overrides(&fs, overrides)?;
    assert_eq!(cfg.packing.seed, 7);
    assert_eq!(cfg.training.epochs, 4);
    assert!(cfg.training.fine_tune_encoder);
    assert_eq!(cfg.dataset_dir(&fs), PathBuf::from("/tmp/packed"));
    assert_eq!(
        cfg.checkpoint_path(&fs),
        dir.path()
            .join("data")
            .join("checkpoints")
            .join("caption_model.safetensors")
    );
    Ok(())
}

#[test]
fn config_path_override_selects_the_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = temp_fs(dir.path());
    let path = dir.path().join("run.toml");
    std::fs::write(&path, "[packing]\nseed = 41\nmin_word_freq = 2\n")?;
    let mut overrides = ConfigOverrides::default();
    overrides.config_path = Some(path.clone());
    overrides.packing.min_word_freq = Some(3);

    let (cfg, descriptor) = AppConfig::load_with_overrides(&fs, overrides)?;
    assert_eq!(descriptor.path, path);
    assert_eq!(cfg.packing.seed, 41);
    assert_eq!(cfg.packing.min_word_freq, 3);
    assert!(!fs.resolve(&AppPath::ConfigFile).exists());
    Ok(())
}

#[test]
fn invalid_settings_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[model]\ndropout = 1.5\n")?;
    let fs = temp_fs(dir.path());
    let err = match AppConfig::load_or_init(&fs, Some(&path)) {
        Ok(_) => panic!("dropout outside [0, 1) must be rejected"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("model.dropout"));
    Ok(())
}
