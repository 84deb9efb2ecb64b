pub mod config;
pub mod fs;

pub use config::{
    AppConfig, ConfigDescriptor, ConfigOverride, ConfigOverrides, DataSettings, ModelSettings,
    PackingOverride, PackingSettings, TrainingOverride, TrainingSettings,
};
pub use fs::{AppPath, LocalFileSystem};
