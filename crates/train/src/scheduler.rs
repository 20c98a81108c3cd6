//! Learning-rate schedule of the gating classifier.

use std::str::FromStr;

/// Decay mode after warmup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LrDecay {
    #[default]
    Cosine,
    Linear,
    Constant,
}

impl FromStr for LrDecay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(Self::Cosine),
            "linear" => Ok(Self::Linear),
            "constant" | "none" => Ok(Self::Constant),
            other => Err(format!("unknown lr decay {other:?}")),
        }
    }
}

/// Warmup → cosine / linear / constant.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    lr_min: f64,
    warmup_steps: usize,
    max_steps: usize,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(lr: f64, lr_min: f64, warmup_steps: usize, max_steps: usize, decay: LrDecay) -> Self {
        Self {
            step: 0,
            lr,
            lr_min,
            warmup_steps,
            max_steps,
            decay,
        }
    }

    pub fn current_lr(&self) -> f64 {
        let step = self.step;
        if step < self.warmup_steps {
            return self.lr * (step as f64 + 1.0) / self.warmup_steps as f64;
        }
        if self.max_steps <= self.warmup_steps || self.decay == LrDecay::Constant {
            return self.lr;
        }

        let progress = (step.min(self.max_steps) - self.warmup_steps) as f64
            / (self.max_steps - self.warmup_steps) as f64;
        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + 0.5 * (self.lr - self.lr_min) * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::Constant => self.lr,
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}
