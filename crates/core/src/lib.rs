//! # loramix-core: gated mixture of LoRA experts
//!
//! A frozen backbone carries several frozen low-rank adapters ("experts") on
//! each of its projections. A small classifier looks at the backbone's own
//! hidden states and decides, per batch row, how strongly every expert
//! contributes at every layer.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`channel`] | `CoefficientChannel`: single-slot coefficient store with bounded-lifetime overrides |
//! | [`lora`] | `LoraExpert`, `LoraLinear` |
//! | [`expert`] | `ExpertLayer`, `AdapterLinear` slots, top-k filtering |
//! | [`backbone`] | `ExpertBackbone` trait, `ModelInput`/`ModelOutput`, `PassContext` |
//! | [`norm`] | `NormLayer` (RMSNorm / LayerNorm) |
//! | [`attention`] | `CausalSelfAttention` with adapter-bearing projections |
//! | [`model`] | `LoraTransformer`, the reference backbone |
//! | [`classifier`] | `GatingClassifier`, decision positions, pooling |
//! | [`coordinator`] | `ForwardCoordinator`, the shadow-pass state machine |
//! | [`gated`] | `GatedModel`: attach and the caller-facing operations |
//!
//! ## Flow of one forward call
//!
//! 1. The coordinator enters `ShadowPass` and the classifier re-enters the
//!    model with the inhibitor set. That inner call publishes neutral
//!    coefficients for exactly `n_layers` reads and runs the backbone with
//!    experts disabled, capturing hidden states.
//! 2. The classifier pools the last hidden state and predicts
//!    `(batch, n_layers, n_experts)` coefficients, which are published.
//! 3. The real pass runs; every gated layer reads the published value.
//!
//! One model owns one channel. Overlapping calls on the same model must be
//! serialised by the caller.

pub mod attention;
pub mod backbone;
pub mod channel;
pub mod classifier;
pub mod coordinator;
pub mod expert;
pub mod gated;
pub mod lora;
pub mod model;
pub mod norm;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use backbone::{ExpertBackbone, ExpertMode, ModelInput, ModelOutput, PassContext};
pub use channel::CoefficientChannel;
pub use classifier::{
    decision_positions, pool_hidden, GatingCheckpoint, GatingClassifier, GATING_CONFIG_FILENAME,
    GATING_WEIGHTS_FILENAME,
};
pub use coordinator::{
    uniform_coefficients, CoordinatorState, CoordinatorStats, ForwardCoordinator, ForwardOptions,
    HookedForward, PassGuard,
};
pub use expert::{apply_top_k, top_k_mask, AdapterLinear, ExpertLayer};
pub use gated::{GatedModel, ParameterReport};
pub use lora::{LoraExpert, LoraLinear};
pub use model::LoraTransformer;
