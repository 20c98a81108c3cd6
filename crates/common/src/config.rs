//! Configuration records for loramix.
//!
//! Serialised as JSON next to classifier weights. Every field has a default
//! so a minimal `{}` JSON produces a working (if small) setup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GatingError, Result};

// ── Gating classifier ───────────────────────────────────────────────────────

/// How the classifier reduces a `(seq, hidden)` hidden state to one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolingMode {
    /// Take the hidden state at the decision position.
    #[default]
    DecisionToken,
    /// Average every position up to and including the decision position.
    Mean,
}

/// Configuration of the gating classifier.
///
/// Backwards-compatible: missing fields fall back to their
/// `#[serde(default)]` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingConfig {
    /// Width of the backbone hidden states fed to the classifier.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Normalise coefficients across the expert axis.
    #[serde(default = "default_true")]
    pub enable_softmax: bool,
    /// Logits are divided by this before the softmax.
    #[serde(default = "default_temperature")]
    pub softmax_temperature: f64,
    /// Predict one coefficient row per adapter layer instead of sharing one.
    #[serde(default)]
    pub layerwise_scalings: bool,
    /// Keep only the `k` strongest experts per layer (no renormalisation).
    #[serde(default)]
    pub top_k_lora: Option<usize>,
    /// Number of linear layers in the classifier head (>= 1).
    #[serde(default = "default_depth")]
    pub gating_depth: usize,
    /// Hidden width of the classifier; unused when `gating_depth = 1`.
    #[serde(default = "default_gating_size")]
    pub gating_size: usize,
    /// ReLU + dropout between hidden classifier layers.
    #[serde(default = "default_true")]
    pub enable_relu_and_dropout: bool,
    #[serde(default = "default_dropout_p")]
    pub dropout_p: f32,
    /// Bias terms on the classifier projections.
    #[serde(default)]
    pub use_bias: bool,
    #[serde(default)]
    pub pooling: PoolingMode,
    /// Token marking the decision position. `None` derives it from the
    /// attention mask instead.
    #[serde(default)]
    pub stop_token_id: Option<u32>,
}

fn default_hidden_size() -> usize {
    256
}
fn default_true() -> bool {
    true
}
fn default_temperature() -> f64 {
    1.0
}
fn default_depth() -> usize {
    1
}
fn default_gating_size() -> usize {
    2048
}
fn default_dropout_p() -> f32 {
    0.2
}

impl Default for GatingConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            enable_softmax: true,
            softmax_temperature: 1.0,
            layerwise_scalings: false,
            top_k_lora: None,
            gating_depth: 1,
            gating_size: 2048,
            enable_relu_and_dropout: true,
            dropout_p: 0.2,
            use_bias: false,
            pooling: PoolingMode::DecisionToken,
            stop_token_id: None,
        }
    }
}

impl GatingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gating_depth == 0 {
            return Err(GatingError::InvalidConfig(
                "gating_depth must be at least 1".into(),
            ));
        }
        if !(self.softmax_temperature > 0.0) {
            return Err(GatingError::InvalidConfig(format!(
                "softmax_temperature must be positive, got {}",
                self.softmax_temperature
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(GatingError::InvalidConfig(format!(
                "dropout_p must lie in [0, 1), got {}",
                self.dropout_p
            )));
        }
        if self.top_k_lora == Some(0) {
            return Err(GatingError::InvalidConfig(
                "top_k_lora must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

// ── Reference backbone ──────────────────────────────────────────────────────

/// One LoRA expert attached to every adapter-bearing projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterSpec {
    pub name: String,
    pub rank: usize,
    pub alpha: f64,
}

impl AdapterSpec {
    pub fn new(name: impl Into<String>, rank: usize, alpha: f64) -> Self {
        Self {
            name: name.into(),
            rank,
            alpha,
        }
    }

    /// LoRA scale `alpha / rank`.
    pub fn scale(&self) -> f64 {
        self.alpha / self.rank.max(1) as f64
    }
}

/// Hyper-parameters of the reference decoder-only backbone.
///
/// Missing fields take their [`Default`] values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub intermediate_size: usize,
    pub max_seq_len: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    /// RMSNorm instead of LayerNorm.
    #[serde(default = "default_true")]
    pub use_rms_norm: bool,
    /// Scale sublayer output by 1/√2 before adding to the residual.
    #[serde(default)]
    pub use_residual_scaling: bool,
    /// Experts carried by every adapter-bearing projection, in expert-axis order.
    #[serde(default = "default_experts")]
    pub experts: Vec<AdapterSpec>,
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_experts() -> Vec<AdapterSpec> {
    (0..3)
        .map(|i| AdapterSpec::new(format!("expert_{i}"), 8, 16.0))
        .collect()
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32_000,
            hidden_size: 256,
            num_heads: 8,
            num_layers: 4,
            intermediate_size: 1024,
            max_seq_len: 512,
            layer_norm_eps: 1e-5,
            use_rms_norm: true,
            use_residual_scaling: false,
            experts: default_experts(),
        }
    }
}

impl BackboneConfig {
    /// Head dimension (`hidden_size / num_heads`).
    pub fn head_dim(&self) -> Result<usize> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(GatingError::InvalidConfig(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        Ok(self.hidden_size / self.num_heads)
    }

    pub fn expert_names(&self) -> Vec<String> {
        self.experts.iter().map(|e| e.name.clone()).collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

// ── Combined record ─────────────────────────────────────────────────────────

/// Backbone + gating configuration, as written by `loramix init`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoramixConfig {
    #[serde(default)]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub gating: GatingConfig,
}

impl LoramixConfig {
    /// Checks both halves and that they agree on the hidden width.
    pub fn validate(&self) -> Result<()> {
        self.backbone.head_dim()?;
        self.gating.validate()?;
        if self.gating.hidden_size != self.backbone.hidden_size {
            return Err(GatingError::ShapeMismatch {
                what: "gating hidden_size",
                expected: self.backbone.hidden_size,
                actual: self.gating.hidden_size,
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

// ── Tests ───────────────────────────────────────────────────────────────────
