//! Trainer for the gating classifier.
//!
//! The backbone and its experts are frozen: the optimiser only ever sees the
//! classifier's `VarMap`. Gradients reach the classifier through the
//! coefficients that scale every expert contribution in the real pass; the
//! shadow-pass hidden states it reads are detached.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use loramix_common::{batch_to_tensors, shift_for_next_token};
use loramix_core::{ExpertBackbone, GatedModel, ModelInput};

use crate::scheduler::{LrDecay, LrScheduler};

// ── Config ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub batch_size: usize,
    pub seq_len: usize,
    pub max_steps: usize,
    pub lr: f64,
    pub lr_min: f64,
    pub lr_warmup_steps: usize,
    pub lr_decay: LrDecay,
    pub weight_decay: f64,
    pub grad_clip_max_norm: f64,
    pub label_smoothing: f64,
    pub log_every: usize,
    pub seed: u64,
    pub output_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            seq_len: 64,
            max_steps: 1000,
            lr: 1e-3,
            lr_min: 1e-5,
            lr_warmup_steps: 50,
            lr_decay: LrDecay::Cosine,
            weight_decay: 0.0,
            grad_clip_max_norm: 1.0,
            label_smoothing: 0.0,
            log_every: 10,
            seed: 42,
            output_dir: PathBuf::from("gating"),
        }
    }
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub lr: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

/// Cut token sequences into shuffled `(inputs, labels)` batches of
/// `batch_size × seq_len` flat tokens. Windows that do not fill a whole
/// batch are dropped.
pub fn make_batches(
    sequences: &[Vec<u32>],
    seq_len: usize,
    batch_size: usize,
    seed: u64,
) -> Vec<(Vec<u32>, Vec<u32>)> {
    let mut windows: Vec<(Vec<u32>, Vec<u32>)> = sequences
        .iter()
        .flat_map(|s| shift_for_next_token(s, seq_len))
        .collect();
    windows.shuffle(&mut StdRng::seed_from_u64(seed));
    if batch_size == 0 {
        return Vec::new();
    }
    windows
        .chunks_exact(batch_size)
        .map(|chunk| {
            let inputs = chunk.iter().flat_map(|(i, _)| i.iter().copied()).collect();
            let labels = chunk.iter().flat_map(|(_, l)| l.iter().copied()).collect();
            (inputs, labels)
        })
        .collect()
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct GatingTrainer<B: ExpertBackbone> {
    pub model: GatedModel<B>,
    vars: Vec<Var>,
    optimizer: AdamW,
    lr_scheduler: LrScheduler,
    pub config: TrainerConfig,
    pub global_step: usize,
    device: Device,
}

impl<B: ExpertBackbone> GatingTrainer<B> {
    pub fn new(model: GatedModel<B>, config: TrainerConfig, device: Device) -> anyhow::Result<Self> {
        let vars = model.classifier().varmap().all_vars();
        tracing::info!(
            trainable = vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            report = %model.parameter_report(),
            "gating trainer ready"
        );

        let lr_scheduler = LrScheduler::new(
            config.lr,
            config.lr_min,
            config.lr_warmup_steps,
            config.max_steps,
            config.lr_decay,
        );
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        Ok(Self {
            model,
            vars,
            optimizer,
            lr_scheduler,
            config,
            global_step: 0,
            device,
        })
    }

    fn batch_loss(&self, input_ids: &[u32], labels: &[u32]) -> anyhow::Result<Tensor> {
        let (batch, seq) = (self.config.batch_size, self.config.seq_len);
        let (ids, labels) = batch_to_tensors(input_ids, labels, batch, seq, &self.device)?;
        let mask = Tensor::ones((batch, seq), DType::U32, &self.device)?;
        let output = self
            .model
            .forward(&ModelInput::from_ids(ids).with_attention_mask(mask))?;
        let (b, t, v) = output.logits.dims3()?;
        let logits = output.logits.reshape((b * t, v))?;
        let labels = labels.reshape((b * t,))?;
        Ok(cross_entropy_with_label_smoothing(
            &logits,
            &labels,
            self.config.label_smoothing,
            v,
        )?)
    }

    /// One optimiser step over the mean loss of `batches`.
    pub fn step(&mut self, batches: &[(Vec<u32>, Vec<u32>)]) -> anyhow::Result<StepMetrics> {
        anyhow::ensure!(!batches.is_empty(), "training step needs at least one batch");
        self.model.set_training(true);

        let n = batches.len();
        let mut total_loss: Option<Tensor> = None;
        let mut loss_sum = 0.0f32;
        for (input_ids, labels) in batches {
            let step_loss = self.batch_loss(input_ids, labels)?;
            loss_sum += step_loss.to_scalar::<f32>()?;
            let scaled = step_loss.affine(1.0 / n as f64, 0.0)?;
            total_loss = Some(match total_loss {
                None => scaled,
                Some(prev) => (prev + scaled)?,
            });
        }
        let total_loss = total_loss.context("no loss accumulated")?;

        let lr = self.lr_scheduler.current_lr();
        self.optimizer.set_learning_rate(lr);
        let mut grads = total_loss.backward()?;
        let norm = grad_norm(&grads, &self.vars)?;
        if norm == 0.0 {
            tracing::warn!(step = self.global_step, "no gradient reached the gating classifier");
        }
        if self.config.grad_clip_max_norm > 0.0 {
            clip_grad_norm(&mut grads, &self.vars, norm, self.config.grad_clip_max_norm)?;
        }
        self.optimizer.step(&grads)?;

        self.lr_scheduler.advance();
        self.global_step += 1;
        self.model.set_training(false);

        let metrics = StepMetrics {
            step: self.global_step - 1,
            loss: loss_sum / n as f32,
            lr,
            grad_norm: norm,
        };
        if self.config.log_every > 0 && metrics.step % self.config.log_every == 0 {
            tracing::info!(
                step = metrics.step,
                loss = metrics.loss,
                lr = metrics.lr,
                grad_norm = metrics.grad_norm,
                "train step"
            );
        }
        Ok(metrics)
    }

    /// Mean loss and perplexity over `batches`, dropout off.
    pub fn evaluate(&self, batches: &[(Vec<u32>, Vec<u32>)]) -> anyhow::Result<(f64, f64)> {
        self.model.set_training(false);
        let mut loss_sum = 0.0f64;
        for (input_ids, labels) in batches {
            loss_sum += self.batch_loss(input_ids, labels)?.to_scalar::<f32>()? as f64;
        }
        if batches.is_empty() {
            return Ok((f64::MAX, f64::MAX));
        }
        let avg_loss = loss_sum / batches.len() as f64;
        Ok((avg_loss, avg_loss.exp()))
    }

    /// Persist the classifier under `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        self.model
            .save_classifier(dir)
            .with_context(|| format!("saving classifier to {}", dir.display()))
    }

    /// Save to `output_dir/checkpoint-{step}`.
    pub fn save_checkpoint(&self) -> anyhow::Result<PathBuf> {
        let dir = self
            .config
            .output_dir
            .join(format!("checkpoint-{}", self.global_step));
        self.save(&dir)?;
        Ok(dir)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

fn cross_entropy_with_label_smoothing(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
    vocab_size: usize,
) -> candle_core::Result<Tensor> {
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, labels);
    }
    let log_probs = ops::log_softmax(logits, 1)?;
    let nll = loss::nll(&log_probs, labels)?;
    // Uniform term: mean over rows of -Σ log p / V.
    let uniform = log_probs.sum(1)?.neg()?.mean_all()?.affine(1.0 / vocab_size as f64, 0.0)?;
    (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)
}

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Global L2 norm of the gradients of `vars`; 0 when none has a gradient.
fn grad_norm(grads: &GradStore, vars: &[Var]) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients so their global norm is at most `max_norm`.
fn clip_grad_norm(
    grads: &mut GradStore,
    vars: &[Var],
    norm: f64,
    max_norm: f64,
) -> anyhow::Result<()> {
    if norm <= max_norm {
        return Ok(());
    }
    let scale = max_norm / norm;
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
        }
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
