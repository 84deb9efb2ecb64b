use anyhow::{Context, Result};
use candle_core::Device;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

pub fn prepare_device(device: DeviceKind) -> Result<Device> {
    let device = match device {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Metal => Device::new_metal(0).context("failed to initialise Metal device")?,
        DeviceKind::Cuda => Device::new_cuda(0).context("failed to initialise CUDA device")?,
    };
    Ok(device)
}
