//! Gating classifier: hidden states of an expert-free shadow pass →
//! `(batch, n_layers, n_classes)` mixing coefficients.
//!
//! The head is a small stack of linear layers:
//!
//! | depth | layers |
//! |-------|--------|
//! | 1 | `hidden → out` |
//! | 2 | `hidden → size`, [ReLU, Dropout], `size → out` |
//! | d | `hidden → size`, (d − 2) × `size → size`, `size → out` |
//!
//! with `out = n_classes × n_layers` when `layerwise_scalings` is set and
//! `n_classes` (shared by every layer) otherwise.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder, VarMap};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use loramix_common::{GatingConfig, GatingError, PoolingMode, Result};

use crate::backbone::ModelInput;
use crate::coordinator::{ForwardOptions, HookedForward};

pub const GATING_CONFIG_FILENAME: &str = "gating_config.json";
pub const GATING_WEIGHTS_FILENAME: &str = "gating_classifier.safetensors";

/// Configuration half of a saved classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingCheckpoint {
    pub config: GatingConfig,
    pub n_classes: usize,
    pub n_layers: usize,
    pub expert_names: Vec<String>,
}

enum HeadLayer {
    Linear(Linear),
    Relu,
    Dropout(Dropout),
}

impl HeadLayer {
    fn forward(&self, x: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        match self {
            Self::Linear(l) => l.forward(x),
            Self::Relu => x.relu(),
            Self::Dropout(d) => d.forward(x, train),
        }
    }
}

fn head_linear(
    in_dim: usize,
    out_dim: usize,
    bias: bool,
    vb: VarBuilder,
) -> candle_core::Result<Linear> {
    if bias {
        candle_nn::linear(in_dim, out_dim, vb)
    } else {
        candle_nn::linear_no_bias(in_dim, out_dim, vb)
    }
}

// ── Decision position ───────────────────────────────────────────────────────

/// Wrap a possibly negative index into `[0, seq_len)`.
fn wrap_position(position: i64, seq_len: usize) -> usize {
    position.rem_euclid(seq_len as i64) as usize
}

/// Index of the position whose hidden state decides the gating, per row.
///
/// * With a stop token and token ids: its first occurrence, or the last
///   position when it never occurs.
/// * Otherwise: the position before the first padding zero of the
///   attention mask, wrapped into range (so an unpadded row selects its
///   last position).
pub fn decision_positions(
    config: &GatingConfig,
    input: &ModelInput,
    seq_len: usize,
) -> Result<Vec<usize>> {
    if seq_len == 0 {
        return Err(GatingError::ShapeMismatch {
            what: "sequence length",
            expected: 1,
            actual: 0,
        });
    }
    if let (Some(stop), Some(ids)) = (config.stop_token_id, input.input_ids.as_ref()) {
        let rows = ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        return Ok(rows
            .iter()
            .map(|row| {
                let found = row.iter().position(|&t| t == stop).map_or(-1, |p| p as i64);
                wrap_position(found, seq_len)
            })
            .collect());
    }
    let mask = input
        .attention_mask
        .as_ref()
        .ok_or(GatingError::MissingAttentionMask)?;
    let (mask_batch, mask_len) = mask.dims2()?;
    let batch = input.batch_size()?;
    if mask_batch != batch {
        return Err(GatingError::ShapeMismatch {
            what: "attention mask batch",
            expected: batch,
            actual: mask_batch,
        });
    }
    if mask_len != seq_len {
        return Err(GatingError::ShapeMismatch {
            what: "attention mask length",
            expected: seq_len,
            actual: mask_len,
        });
    }
    let rows = mask.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(rows
        .iter()
        .map(|row| {
            // argmax semantics: a row without padding reports index 0.
            let first_pad = row.iter().position(|&m| m == 0.0).unwrap_or(0) as i64;
            wrap_position(first_pad - 1, seq_len)
        })
        .collect())
}

/// Reduce `(batch, seq, hidden)` to `(batch, hidden)`.
pub fn pool_hidden(hidden: &Tensor, positions: &[usize], mode: PoolingMode) -> Result<Tensor> {
    let rows = positions
        .iter()
        .enumerate()
        .map(|(b, &p)| match mode {
            PoolingMode::DecisionToken => hidden.i((b, p)),
            PoolingMode::Mean => hidden.i(b)?.narrow(0, 0, p + 1)?.mean(0),
        })
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::stack(&rows, 0)?)
}

// ── GatingClassifier ────────────────────────────────────────────────────────

pub struct GatingClassifier {
    config: GatingConfig,
    expert_names: Vec<String>,
    n_layers: usize,
    inner: Vec<HeadLayer>,
    last: Linear,
    varmap: VarMap,
    dtype: DType,
    device: Device,
    training: AtomicBool,
    predictions_to_print: AtomicUsize,
    logging: AtomicBool,
    logging_ever_enabled: AtomicBool,
    log: Mutex<Vec<Tensor>>,
}

impl GatingClassifier {
    /// Fresh classifier with its own parameter store.
    pub fn new(
        config: GatingConfig,
        expert_names: Vec<String>,
        n_layers: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let n_classes = expert_names.len();

        let mut inner = Vec::new();
        let mut width = config.hidden_size;
        for i in 0..config.gating_depth - 1 {
            let linear = head_linear(
                width,
                config.gating_size,
                config.use_bias,
                vb.pp(format!("inner.{i}")),
            )?;
            inner.push(HeadLayer::Linear(linear));
            if config.enable_relu_and_dropout {
                inner.push(HeadLayer::Relu);
                inner.push(HeadLayer::Dropout(Dropout::new(config.dropout_p)));
            }
            width = config.gating_size;
        }
        let out_dim = if config.layerwise_scalings && n_layers > 0 {
            n_classes * n_layers
        } else {
            n_classes
        };
        let last = head_linear(width, out_dim, config.use_bias, vb.pp("last"))?;

        Ok(Self {
            config,
            expert_names,
            n_layers,
            inner,
            last,
            varmap,
            dtype,
            device: device.clone(),
            training: AtomicBool::new(false),
            predictions_to_print: AtomicUsize::new(0),
            logging: AtomicBool::new(false),
            logging_ever_enabled: AtomicBool::new(false),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Rebuild a classifier saved by [`GatingClassifier::save_pretrained`].
    pub fn from_pretrained(dir: &Path, dtype: DType, device: &Device) -> Result<Self> {
        let json = std::fs::read_to_string(dir.join(GATING_CONFIG_FILENAME))?;
        let checkpoint: GatingCheckpoint = serde_json::from_str(&json)?;
        if checkpoint.n_classes != checkpoint.expert_names.len() {
            return Err(GatingError::ShapeMismatch {
                what: "saved expert count",
                expected: checkpoint.expert_names.len(),
                actual: checkpoint.n_classes,
            });
        }
        let mut classifier = Self::new(
            checkpoint.config,
            checkpoint.expert_names,
            checkpoint.n_layers,
            dtype,
            device,
        )?;
        classifier
            .varmap
            .load(dir.join(GATING_WEIGHTS_FILENAME))?;
        tracing::info!(dir = %dir.display(), "loaded gating classifier");
        Ok(classifier)
    }

    /// Write `gating_config.json` and `gating_classifier.safetensors` to `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let checkpoint = GatingCheckpoint {
            config: self.config.clone(),
            n_classes: self.n_classes(),
            n_layers: self.n_layers,
            expert_names: self.expert_names.clone(),
        };
        std::fs::write(
            dir.join(GATING_CONFIG_FILENAME),
            serde_json::to_string_pretty(&checkpoint)?,
        )?;
        self.varmap.save(dir.join(GATING_WEIGHTS_FILENAME))?;
        tracing::info!(dir = %dir.display(), "saved gating classifier");
        Ok(())
    }

    pub fn config(&self) -> &GatingConfig {
        &self.config
    }

    pub fn n_classes(&self) -> usize {
        self.expert_names.len()
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    pub fn expert_names(&self) -> &[String] {
        &self.expert_names
    }

    /// Trainable parameters of the classifier.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// `(trainable, total)`. Every classifier parameter is trainable.
    pub fn parameter_counts(&self) -> (usize, usize) {
        let total = self.varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        (total, total)
    }

    /// Dropout is active only in training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Print the next `n` predicted coefficient tensors.
    pub fn set_predictions_to_print(&self, n: usize) {
        self.predictions_to_print.store(n, Ordering::Relaxed);
    }

    pub fn predictions_to_print(&self) -> usize {
        self.predictions_to_print.load(Ordering::Relaxed)
    }

    pub fn set_logging(&self, enabled: bool) {
        self.logging.store(enabled, Ordering::Relaxed);
        if enabled {
            self.logging_ever_enabled.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_logging(&self) -> bool {
        self.logging.load(Ordering::Relaxed)
    }

    pub fn logged_batches(&self) -> usize {
        self.log.lock().len()
    }

    /// Concatenate every logged tensor along the batch axis, write it to
    /// `path` as `.npy`, then clear the buffer.
    pub fn flush_log(&self, path: &Path) -> Result<()> {
        if !self.logging_ever_enabled.load(Ordering::Relaxed) {
            return Err(GatingError::LoggingDisabled);
        }
        let mut log = self.log.lock();
        if log.is_empty() {
            return Err(GatingError::EmptyLog);
        }
        let all = Tensor::cat(log.as_slice(), 0)?;
        all.write_npy(path)?;
        tracing::info!(path = %path.display(), rows = all.dim(0)?, "flushed logged coefficients");
        log.clear();
        Ok(())
    }

    /// Predict coefficients for `input`.
    ///
    /// Runs one inhibited, expert-free forward of `model` to capture hidden
    /// states, pools them at the decision position and maps the result
    /// through the head.
    pub fn compute<M: HookedForward + ?Sized>(
        &self,
        model: &M,
        input: &ModelInput,
    ) -> Result<Tensor> {
        let batch_size = input.batch_size()?;
        let output = model.forward_hooked(input, ForwardOptions::shadow(batch_size))?;
        let hidden = output
            .hidden_states
            .and_then(|mut states| states.pop())
            .ok_or(GatingError::MissingHiddenStates)?
            .detach();

        let seq_len = hidden.dim(1)?;
        let positions = decision_positions(&self.config, input, seq_len)?;
        let pooled = pool_hidden(&hidden, &positions, self.config.pooling)?;
        let coefficients = self.head(&pooled)?;

        if self
            .predictions_to_print
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::info!("Scaling predictions: {coefficients}");
        }
        if self.is_logging() {
            self.log.lock().push(coefficients.detach());
        }
        Ok(coefficients)
    }

    /// `(batch, hidden)` pooled representation → `(batch, n_layers, n_classes)`.
    pub fn head(&self, pooled: &Tensor) -> Result<Tensor> {
        let (batch, width) = pooled.dims2()?;
        if width != self.config.hidden_size {
            return Err(GatingError::ShapeMismatch {
                what: "pooled representation width",
                expected: self.config.hidden_size,
                actual: width,
            });
        }
        let n_classes = self.n_classes();
        if self.n_layers == 0 {
            return Ok(Tensor::zeros(
                (batch, 0, n_classes),
                self.dtype,
                &self.device,
            )?);
        }

        let train = self.is_training();
        let mut h = pooled.to_dtype(self.dtype)?;
        for layer in &self.inner {
            h = layer.forward(&h, train)?;
        }
        let logits = self.last.forward(&h)?;
        let coefficients = if self.config.layerwise_scalings {
            logits.reshape((batch, self.n_layers, n_classes))?
        } else {
            logits
                .unsqueeze(1)?
                .broadcast_as((batch, self.n_layers, n_classes))?
                .contiguous()?
        };

        if !self.config.enable_softmax {
            return Ok(coefficients);
        }
        let scaled = coefficients.affine(1.0 / self.config.softmax_temperature, 0.0)?;
        Ok(candle_nn::ops::softmax(&scaled, D::Minus1)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
