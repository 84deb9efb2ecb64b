/// Running, count-weighted average of a scalar such as the per-batch loss.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossTracker {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed over `n` items (tokens, for the caption loss).
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
