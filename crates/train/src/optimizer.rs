//! Adam with per-parameter step counters and exportable state.

use std::collections::HashMap;

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor, Var, backprop::GradStore};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl AdamParams {
    pub fn with_lr(lr: f64) -> Self {
        Self {
            lr,
            ..Self::default()
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
    step: u32,
}

pub struct Adam {
    params: AdamParams,
    states: Vec<ParamState>,
}

impl Adam {
    /// Optimize the named parameters. Names key the exported state.
    pub fn new(vars: Vec<(String, Var)>, params: AdamParams) -> Result<Self> {
        ensure!(params.lr > 0.0, "learning rate must be positive, got {}", params.lr);
        let mut states = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            ensure!(
                var.dtype() == DType::F32,
                "parameter {name} is {:?}, only f32 is supported",
                var.dtype()
            );
            let exp_avg = var.zeros_like()?;
            let exp_avg_sq = var.zeros_like()?;
            states.push(ParamState {
                name,
                var,
                exp_avg,
                exp_avg_sq,
                step: 0,
            });
        }
        Ok(Self { params, states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> + '_ {
        self.states.iter().map(|state| &state.var)
    }

    /// Apply one update to every parameter that has a gradient. Parameters without one keep
    /// their value and their step counter.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
        } = self.params;
        for state in &mut self.states {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            state.step += 1;
            let step = state.step as i32;
            state.exp_avg = (state.exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
            state.exp_avg_sq =
                (state.exp_avg_sq.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let bias_correction1 = 1.0 - beta1.powi(step);
            let bias_correction2 = 1.0 - beta2.powi(step);
            let denom = state
                .exp_avg_sq
                .sqrt()?
                .affine(1.0 / bias_correction2.sqrt(), eps)?;
            let update = state.exp_avg.div(&denom)?.affine(lr / bias_correction1, 0.0)?;
            let next = state.var.as_tensor().detach().sub(&update)?;
            state.var.set(&next)?;
        }
        Ok(())
    }

    /// Moments and step counters keyed `{param}.exp_avg`, `{param}.exp_avg_sq` and
    /// `{param}.step`.
    pub fn export_state(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(self.states.len() * 3);
        for state in &self.states {
            out.insert(format!("{}.exp_avg", state.name), state.exp_avg.clone());
            out.insert(format!("{}.exp_avg_sq", state.name), state.exp_avg_sq.clone());
            out.insert(
                format!("{}.step", state.name),
                Tensor::new(&[state.step], state.var.device())?,
            );
        }
        Ok(out)
    }

    /// Restore state produced by [`Adam::export_state`] for the same parameter names.
    pub fn import_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for param in &mut self.states {
            let fetch = |suffix: &str| -> Result<Tensor> {
                let key = format!("{}.{suffix}", param.name);
                state
                    .get(&key)
                    .cloned()
                    .with_context(|| format!("optimizer state is missing `{key}`"))
            };
            let exp_avg = fetch("exp_avg")?;
            let exp_avg_sq = fetch("exp_avg_sq")?;
            for moment in [&exp_avg, &exp_avg_sq] {
                ensure!(
                    moment.dims() == param.var.dims(),
                    "optimizer state for {} has shape {:?}, parameter has {:?}",
                    param.name,
                    moment.dims(),
                    param.var.dims()
                );
            }
            let step = fetch("step")?.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
            param.step = step
                .first()
                .copied()
                .with_context(|| format!("empty step counter for {}", param.name))?;
            let device = param.var.device();
            param.exp_avg = exp_avg.to_dtype(DType::F32)?.to_device(device)?;
            param.exp_avg_sq = exp_avg_sq.to_dtype(DType::F32)?.to_device(device)?;
        }
        Ok(())
    }
}
