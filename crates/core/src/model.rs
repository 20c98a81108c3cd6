//! Reference decoder-only backbone with adapter-bearing projections.
//!
//! Pre-norm blocks (attention → residual → FFN → residual), a final norm and
//! a weight-tied LM head. Every projection inside a block is an
//! [`AdapterLinear`] slot, which makes this model a drop-in
//! [`ExpertBackbone`] for the gating core.

use candle_core::Tensor;
use candle_nn::{embedding, Embedding, Linear, Module, VarBuilder};

use loramix_common::{AdapterSpec, BackboneConfig, GatingError, Result};

use crate::attention::CausalSelfAttention;
use crate::backbone::{ExpertBackbone, ModelInput, ModelOutput, PassContext};
use crate::expert::AdapterLinear;
use crate::lora::LoraLinear;
use crate::norm::NormLayer;

/// `Lora` slot when experts are configured, `Frozen` otherwise.
pub(crate) fn adapter_slot(
    in_dim: usize,
    out_dim: usize,
    experts: &[AdapterSpec],
    vb: VarBuilder,
) -> Result<AdapterLinear> {
    if experts.is_empty() {
        let linear: Linear = candle_nn::linear_no_bias(in_dim, out_dim, vb)?;
        return Ok(AdapterLinear::Frozen(linear));
    }
    Ok(AdapterLinear::Lora(LoraLinear::new(
        in_dim, out_dim, experts, vb,
    )?))
}

// ── Feed-forward ────────────────────────────────────────────────────────────

/// `c_proj(silu(c_fc(x)))`.
struct FeedForward {
    c_fc: AdapterLinear,
    c_proj: AdapterLinear,
}

impl FeedForward {
    fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            c_fc: adapter_slot(h, inter, &config.experts, vb.pp("c_fc"))?,
            c_proj: adapter_slot(inter, h, &config.experts, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor, pass: &PassContext<'_>) -> Result<Tensor> {
        let h = candle_nn::ops::silu(&self.c_fc.forward(x, pass)?)?;
        self.c_proj.forward(&h, pass)
    }
}

// ── Decoder Block ───────────────────────────────────────────────────────────

struct DecoderBlock {
    attn: CausalSelfAttention,
    ln1: NormLayer,
    mlp: FeedForward,
    ln2: NormLayer,
    residual_scale: f64,
}

impl DecoderBlock {
    fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let residual_scale = if config.use_residual_scaling {
            1.0 / 2.0_f64.sqrt()
        } else {
            1.0
        };
        Ok(Self {
            attn: CausalSelfAttention::new(config, vb.pp("attn"))?,
            ln1: NormLayer::new(config, vb.pp("ln1"))?,
            mlp: FeedForward::new(config, vb.pp("mlp"))?,
            ln2: NormLayer::new(config, vb.pp("ln2"))?,
            residual_scale,
        })
    }

    fn forward(&self, x: &Tensor, pass: &PassContext<'_>) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln1.forward(x)?, pass)?;
        let x = (x + attn_out.affine(self.residual_scale, 0.0)?)?;
        let ff_out = self.mlp.forward(&self.ln2.forward(&x)?, pass)?;
        Ok((&x + ff_out.affine(self.residual_scale, 0.0)?)?)
    }

    /// Slots in traversal order: attention before FFN, input before output.
    fn slots_mut(&mut self, prefix: &str) -> Vec<(String, &mut AdapterLinear)> {
        vec![
            (format!("{prefix}.attn.c_attn"), &mut self.attn.c_attn),
            (format!("{prefix}.attn.c_proj"), &mut self.attn.c_proj),
            (format!("{prefix}.mlp.c_fc"), &mut self.mlp.c_fc),
            (format!("{prefix}.mlp.c_proj"), &mut self.mlp.c_proj),
        ]
    }
}

// ── LoraTransformer ─────────────────────────────────────────────────────────

/// Decoder-only transformer whose projections carry LoRA experts.
///
/// Weight tying: the output projection reuses the token embedding `wte`.
pub struct LoraTransformer {
    wte: Embedding,
    blocks: Vec<DecoderBlock>,
    ln_f: NormLayer,
    config: BackboneConfig,
}

impl LoraTransformer {
    pub fn new(vb: VarBuilder, config: &BackboneConfig) -> Result<Self> {
        config.head_dim()?;
        let wte = embedding(config.vocab_size, config.hidden_size, vb.pp("wte"))?;
        let blocks = (0..config.num_layers)
            .map(|i| DecoderBlock::new(config, vb.pp(format!("h.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = NormLayer::new(config, vb.pp("ln_f"))?;
        Ok(Self {
            wte,
            blocks,
            ln_f,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    fn embed(&self, input: &ModelInput) -> Result<Tensor> {
        if let Some(ids) = &input.input_ids {
            return Ok(self.wte.forward(ids)?);
        }
        let embeds = input.inputs_embeds.as_ref().ok_or(GatingError::MissingInput)?;
        let width = embeds.dim(2)?;
        if width != self.config.hidden_size {
            return Err(GatingError::ShapeMismatch {
                what: "inputs_embeds width",
                expected: self.config.hidden_size,
                actual: width,
            });
        }
        Ok(embeds.clone())
    }
}

impl ExpertBackbone for LoraTransformer {
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn adapter_slots_mut(&mut self) -> Vec<(String, &mut AdapterLinear)> {
        self.blocks
            .iter_mut()
            .enumerate()
            .flat_map(|(i, block)| block.slots_mut(&format!("h.{i}")))
            .filter(|(_, slot)| slot.is_adapter_bearing())
            .collect()
    }

    fn forward(&self, input: &ModelInput, pass: &PassContext<'_>) -> Result<ModelOutput> {
        let mut x = self.embed(input)?;
        let mut hidden_states = pass.output_hidden_states.then(Vec::new);
        if let Some(states) = hidden_states.as_mut() {
            states.push(x.clone());
        }
        for block in &self.blocks {
            x = block.forward(&x, pass)?;
            if let Some(states) = hidden_states.as_mut() {
                states.push(x.clone());
            }
        }
        x = self.ln_f.forward(&x)?;
        if let Some(last) = hidden_states.as_mut().and_then(|s| s.last_mut()) {
            *last = x.clone();
        }

        // Weight-tied output projection: logits = x @ wte^T
        let (b, t, h) = x.dims3()?;
        let logits = x
            .reshape((b * t, h))?
            .matmul(&self.wte.embeddings().t()?)?
            .reshape((b, t, self.config.vocab_size))?;
        Ok(ModelOutput {
            logits,
            hidden_states,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
