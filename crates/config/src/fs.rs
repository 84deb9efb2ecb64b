use std::{env, path::PathBuf};

const CONFIG_FILE: &str = "config.toml";
const DATASET_DIR: &str = "dataset";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Well-known locations under the per-user config and data roots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AppPath {
    ConfigFile,
    /// Default output of `prepare` and input of `train`.
    DatasetDir,
    Checkpoint(String),
}

/// Config and data roots, taken from `CAPTIONER_CONFIG_DIR` / `CAPTIONER_DATA_DIR` when set.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    config_root: PathBuf,
    data_root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(app_name: &str) -> Self {
        let config_root = env::var_os("CAPTIONER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_dir(dirs::config_dir(), ".config", app_name));
        let data_root = env::var_os("CAPTIONER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| user_dir(dirs::data_dir(), ".local/share", app_name));
        Self::with_roots(config_root, data_root)
    }

    pub fn with_roots(config_root: PathBuf, data_root: PathBuf) -> Self {
        Self {
            config_root,
            data_root,
        }
    }

    pub fn resolve(&self, path: &AppPath) -> PathBuf {
        match path {
            AppPath::ConfigFile => self.config_root.join(CONFIG_FILE),
            AppPath::DatasetDir => self.data_root.join(DATASET_DIR),
            AppPath::Checkpoint(name) => self.data_root.join(CHECKPOINT_DIR).join(name),
        }
    }
}

fn user_dir(platform: Option<PathBuf>, home_relative: &str, app_name: &str) -> PathBuf {
    platform
        .or_else(|| dirs::home_dir().map(|home| home.join(home_relative)))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(app_name)
}
