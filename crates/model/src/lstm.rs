use anyhow::Result;
use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear, VarBuilder, ops::sigmoid};

/// Single-step LSTM cell with torch-compatible parameter names and gate order (i, f, g, o).
pub struct LstmCell {
    input: Linear,
    hidden: Linear,
    hidden_size: usize,
}

impl LstmCell {
    pub fn new(input_size: usize, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (hidden_size as f64).sqrt();
        let init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let gates = 4 * hidden_size;
        let weight_ih = vb.get_with_hints((gates, input_size), "weight_ih", init)?;
        let weight_hh = vb.get_with_hints((gates, hidden_size), "weight_hh", init)?;
        let bias_ih = vb.get_with_hints(gates, "bias_ih", init)?;
        let bias_hh = vb.get_with_hints(gates, "bias_hh", init)?;
        Ok(Self {
            input: Linear::new(weight_ih, Some(bias_ih)),
            hidden: Linear::new(weight_hh, Some(bias_hh)),
            hidden_size,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Advance `(h, c)` by one step of input `x`.
    pub fn forward(&self, x: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (self.input.forward(x)? + self.hidden.forward(h)?)?;
        let chunks = gates.chunk(4, 1)?;
        let input_gate = sigmoid(&chunks[0])?;
        let forget_gate = sigmoid(&chunks[1])?;
        let cell_gate = chunks[2].tanh()?;
        let output_gate = sigmoid(&chunks[3])?;
        let c = ((forget_gate * c)? + (input_gate * cell_gate)?)?;
        let h = (output_gate * c.tanh()?)?;
        Ok((h, c))
    }
}
