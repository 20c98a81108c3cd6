//! The contract between the gating core and the base model.
//!
//! The base network is an external collaborator. The core needs three things
//! from it:
//!
//! 1. a traversal enumerating adapter-bearing projections in a stable order
//!    ([`ExpertBackbone::adapter_slots_mut`]);
//! 2. a way to run with every expert disabled ([`ExpertMode::Disabled`],
//!    carried by the call-scoped [`PassContext`], so nothing needs restoring
//!    afterwards even on error);
//! 3. hidden-state capture for the shadow pass.

use candle_core::Tensor;

use loramix_common::{GatingError, Result};

use crate::channel::CoefficientChannel;
use crate::expert::AdapterLinear;

/// Inputs of one forward call.
#[derive(Clone, Debug, Default)]
pub struct ModelInput {
    /// `(batch, seq)` token ids.
    pub input_ids: Option<Tensor>,
    /// `(batch, seq, hidden)` embeddings, used when `input_ids` is absent.
    pub inputs_embeds: Option<Tensor>,
    /// `(batch, seq)`, 1 for real tokens and 0 for padding.
    pub attention_mask: Option<Tensor>,
}

impl ModelInput {
    pub fn from_ids(input_ids: Tensor) -> Self {
        Self {
            input_ids: Some(input_ids),
            ..Default::default()
        }
    }

    pub fn from_embeds(inputs_embeds: Tensor) -> Self {
        Self {
            inputs_embeds: Some(inputs_embeds),
            ..Default::default()
        }
    }

    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    fn leading(&self) -> Result<&Tensor> {
        self.input_ids
            .as_ref()
            .or(self.inputs_embeds.as_ref())
            .ok_or(GatingError::MissingInput)
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.leading()?.dim(0)?)
    }

    pub fn seq_len(&self) -> Result<usize> {
        Ok(self.leading()?.dim(1)?)
    }
}

/// Result of a backbone forward.
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// `(batch, seq, vocab)`.
    pub logits: Tensor,
    /// Captured `(batch, seq, hidden)` states, embedding output first and the
    /// final (normalised) state last. `None` unless capture was requested.
    pub hidden_states: Option<Vec<Tensor>>,
}

/// Whether gated layers add their experts on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpertMode {
    #[default]
    Enabled,
    /// Frozen base weights only. Gated layers still read the channel.
    Disabled,
}

/// Call-scoped state handed down through one backbone forward.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    pub channel: &'a CoefficientChannel,
    pub experts: ExpertMode,
    pub output_hidden_states: bool,
}

impl<'a> PassContext<'a> {
    pub fn new(channel: &'a CoefficientChannel) -> Self {
        Self {
            channel,
            experts: ExpertMode::Enabled,
            output_hidden_states: false,
        }
    }
}

/// A base model whose projections can be wrapped by gated expert layers.
pub trait ExpertBackbone {
    /// Width of the captured hidden states.
    fn hidden_size(&self) -> usize;

    /// Every adapter slot, named, in traversal order. The order must not
    /// change for the lifetime of the model: it defines the layer axis of
    /// the coefficient tensor.
    fn adapter_slots_mut(&mut self) -> Vec<(String, &mut AdapterLinear)>;

    fn forward(&self, input: &ModelInput, pass: &PassContext<'_>) -> Result<ModelOutput>;
}
