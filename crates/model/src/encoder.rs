//! ResNet-style visual encoder producing a fixed `S x S` grid of feature vectors.
//!
//! Parameter names follow torchvision (`conv1`, `bn1`, `layer1.0.conv1`, ...) so pretrained
//! ImageNet weights can be loaded directly.

use std::{fmt, path::Path};

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder, VarMap, conv2d_no_bias};
use tracing::{debug, info};

use crate::pooling::adaptive_avg_pool2d;

/// Output channels of a bottleneck block relative to its inner width.
const EXPANSION: usize = 4;
const BN_EPS: f64 = 1e-5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Bottleneck blocks per stage.
    pub layers: [usize; 4],
    /// Channel depth of the final stage.
    pub output_dim: usize,
    /// Side length of the pooled feature grid.
    pub encoded_image_size: usize,
}

impl EncoderConfig {
    pub fn resnet152(encoded_image_size: usize) -> Self {
        Self {
            layers: [3, 8, 36, 3],
            output_dim: 2048,
            encoded_image_size,
        }
    }

    fn base_width(&self) -> Result<usize> {
        let divisor = 8 * EXPANSION;
        ensure!(
            self.output_dim >= divisor && self.output_dim % divisor == 0,
            "encoder output depth {} must be a positive multiple of {divisor}",
            self.output_dim
        );
        Ok(self.output_dim / divisor)
    }
}

/// Independently freezable parameter groups of the backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackboneStage {
    Stem,
    Stage1,
    Stage2,
    Stage3,
    Stage4,
}

impl BackboneStage {
    pub const ALL: [BackboneStage; 5] = [
        BackboneStage::Stem,
        BackboneStage::Stage1,
        BackboneStage::Stage2,
        BackboneStage::Stage3,
        BackboneStage::Stage4,
    ];

    /// Stages toggled by [`VisualEncoder::fine_tune`].
    pub const FINE_TUNABLE: [BackboneStage; 3] = [
        BackboneStage::Stage2,
        BackboneStage::Stage3,
        BackboneStage::Stage4,
    ];

    fn index(self) -> usize {
        self as usize
    }

    /// Stage owning the parameter `name`.
    pub fn of_parameter(name: &str) -> Option<Self> {
        let head = name.split('.').next()?;
        match head {
            "conv1" | "bn1" => Some(BackboneStage::Stem),
            "layer1" => Some(BackboneStage::Stage1),
            "layer2" => Some(BackboneStage::Stage2),
            "layer3" => Some(BackboneStage::Stage3),
            "layer4" => Some(BackboneStage::Stage4),
            _ => None,
        }
    }
}

impl fmt::Display for BackboneStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackboneStage::Stem => "stem",
            BackboneStage::Stage1 => "layer1",
            BackboneStage::Stage2 => "layer2",
            BackboneStage::Stage3 => "layer3",
            BackboneStage::Stage4 => "layer4",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterGroup {
    #[default]
    Frozen,
    Trainable,
}

/// Batch norm evaluated with its stored running statistics.
struct FrozenBatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl FrozenBatchNorm2d {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        // Running statistics share storage with their variables but never join the graph.
        let running_mean = vb
            .get_with_hints(channels, "running_mean", Init::Const(0.0))?
            .detach();
        let running_var = vb
            .get_with_hints(channels, "running_var", Init::Const(1.0))?
            .detach();
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let channels = self.weight.dim(0)?;
        let shape = (1, channels, 1, 1);
        let inv_std = (self.running_var.clone() + BN_EPS)?.sqrt()?.recip()?;
        let scale = self.weight.mul(&inv_std)?;
        let shift = self.bias.sub(&self.running_mean.mul(&scale)?)?;
        x.broadcast_mul(&scale.reshape(shape)?)?
            .broadcast_add(&shift.reshape(shape)?)
    }
}

fn is_running_statistic(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

struct Downsample {
    conv: Conv2d,
    bn: FrozenBatchNorm2d,
}

struct Bottleneck {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    conv2: Conv2d,
    bn2: FrozenBatchNorm2d,
    conv3: Conv2d,
    bn3: FrozenBatchNorm2d,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    fn new(
        in_channels: usize,
        width: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let out_channels = width * EXPANSION;
        let conv1 = conv2d_no_bias(in_channels, width, 1, Conv2dConfig::default(), vb.pp("conv1"))?;
        let bn1 = FrozenBatchNorm2d::new(width, vb.pp("bn1"))?;
        let mut cfg = Conv2dConfig::default();
        cfg.padding = 1;
        cfg.stride = stride;
        let conv2 = conv2d_no_bias(width, width, 3, cfg, vb.pp("conv2"))?;
        let bn2 = FrozenBatchNorm2d::new(width, vb.pp("bn2"))?;
        let conv3 = conv2d_no_bias(width, out_channels, 1, Conv2dConfig::default(), vb.pp("conv3"))?;
        let bn3 = FrozenBatchNorm2d::new(out_channels, vb.pp("bn3"))?;
        let downsample = if stride != 1 || in_channels != out_channels {
            let mut cfg = Conv2dConfig::default();
            cfg.stride = stride;
            let vb = vb.pp("downsample");
            Some(Downsample {
                conv: conv2d_no_bias(in_channels, out_channels, 1, cfg, vb.pp("0"))?,
                bn: FrozenBatchNorm2d::new(out_channels, vb.pp("1"))?,
            })
        } else {
            None
        };
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            downsample,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let out = self.bn1.forward(&self.conv1.forward(x)?)?.relu()?;
        let out = self.bn2.forward(&self.conv2.forward(&out)?)?.relu()?;
        let out = self.bn3.forward(&self.conv3.forward(&out)?)?;
        let identity = match &self.downsample {
            Some(down) => down.bn.forward(&down.conv.forward(x)?)?,
            None => x.clone(),
        };
        (out + identity)?.relu()
    }
}

struct Stem {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
}

impl Stem {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let x = self.bn1.forward(&self.conv1.forward(x)?)?.relu()?;
        // Zero padding is equivalent to -inf padding after the ReLU.
        x.pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)
    }
}

/// Convolutional backbone plus adaptive pooling to a channel-last `[B, S, S, D]` grid.
pub struct VisualEncoder {
    config: EncoderConfig,
    varmap: VarMap,
    stem: Stem,
    stages: Vec<Vec<Bottleneck>>,
    groups: [ParameterGroup; 5],
}

impl VisualEncoder {
    pub fn new(config: EncoderConfig, device: &Device) -> Result<Self> {
        ensure!(
            config.encoded_image_size > 0,
            "encoded_image_size must be positive"
        );
        ensure!(
            config.layers.iter().all(|&blocks| blocks > 0),
            "every backbone stage needs at least one block, got {:?}",
            config.layers
        );
        let base = config.base_width()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut cfg = Conv2dConfig::default();
        cfg.padding = 3;
        cfg.stride = 2;
        let stem = Stem {
            conv1: conv2d_no_bias(3, base, 7, cfg, vb.pp("conv1"))?,
            bn1: FrozenBatchNorm2d::new(base, vb.pp("bn1"))?,
        };

        let mut in_channels = base;
        let mut stages = Vec::with_capacity(4);
        for (idx, &blocks) in config.layers.iter().enumerate() {
            let width = base << idx;
            let stride = if idx == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", idx + 1));
            let mut stage = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let block_stride = if block == 0 { stride } else { 1 };
                stage.push(Bottleneck::new(
                    in_channels,
                    width,
                    block_stride,
                    stage_vb.pp(block.to_string()),
                )?);
                in_channels = width * EXPANSION;
            }
            stages.push(stage);
        }
        debug!(
            layers = ?config.layers,
            output_dim = config.output_dim,
            "constructed visual encoder"
        );
        Ok(Self {
            config,
            varmap,
            stem,
            stages,
            groups: [ParameterGroup::Frozen; 5],
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn output_dim(&self) -> usize {
        self.config.output_dim
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn group(&self, stage: BackboneStage) -> ParameterGroup {
        self.groups[stage.index()]
    }

    pub fn set_group(&mut self, stage: BackboneStage, group: ParameterGroup) {
        self.groups[stage.index()] = group;
    }

    /// Make stages 2 to 4 trainable (`true`) or frozen (`false`). The stem and stage 1 are
    /// never touched.
    pub fn fine_tune(&mut self, enabled: bool) {
        let group = if enabled {
            ParameterGroup::Trainable
        } else {
            ParameterGroup::Frozen
        };
        for stage in BackboneStage::FINE_TUNABLE {
            self.set_group(stage, group);
        }
    }

    pub fn is_trainable(&self) -> bool {
        self.groups.contains(&ParameterGroup::Trainable)
    }

    /// Parameters of trainable groups, sorted by name. Running statistics are excluded.
    pub fn trainable_vars(&self) -> Vec<(String, Var)> {
        let data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut vars: Vec<(String, Var)> = data
            .iter()
            .filter(|(name, _)| !is_running_statistic(name))
            .filter(|(name, _)| {
                BackboneStage::of_parameter(name)
                    .is_some_and(|stage| self.group(stage) == ParameterGroup::Trainable)
            })
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Load torchvision-named weights. Tensors in the file without a counterpart (such as
    /// the classification head) are ignored.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("failed to load encoder weights from {}", path.display()))?;
        info!(path = %path.display(), "loaded encoder weights");
        Ok(())
    }

    /// `[B, 3, H, W]` normalized images to a `[B, S, S, D]` grid.
    ///
    /// Batch norm always normalizes with the loaded running statistics, in training as well
    /// as evaluation, so the output never depends on the other images in the batch.
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        ensure!(
            images.rank() == 4 && images.dim(1)? == 3,
            "encoder expects [batch, 3, height, width] images, got {:?}",
            images.dims()
        );
        let first_trainable = BackboneStage::ALL
            .iter()
            .position(|&stage| self.group(stage) == ParameterGroup::Trainable);

        let mut x = if first_trainable == Some(0) {
            images.detach()
        } else {
            images.clone()
        };
        x = self.stem.forward(&x)?;
        for (idx, stage) in self.stages.iter().enumerate() {
            if first_trainable == Some(idx + 1) {
                x = x.detach();
            }
            for block in stage {
                x = block.forward(&x)?;
            }
        }
        if first_trainable.is_none() {
            x = x.detach();
        }
        let size = self.config.encoded_image_size;
        let pooled = adaptive_avg_pool2d(&x, size, size)?;
        Ok(pooled.permute((0, 2, 3, 1))?.contiguous()?)
    }
}
