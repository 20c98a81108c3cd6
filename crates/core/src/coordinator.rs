//! Per-call orchestration of the shadow pass and coefficient publication.
//!
//! Computing coefficients needs the backbone's hidden states, and running
//! the backbone goes through the same forward hook that computes
//! coefficients. The recursion is broken by an inhibitor marker carried in
//! [`ForwardOptions`]: the classifier issues its shadow call with
//! `inhibitor = Some(batch_size)`, and the hook answers such calls by
//! publishing neutral coefficients for exactly `n_layers` reads instead of
//! invoking the classifier again.
//!
//! ```text
//! Idle ──outer call──▶ ShadowPass ──classifier done──▶ Published
//!  ▲                                                       │
//!  └────────────── call returns ◀── RealPass ◀─────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use parking_lot::Mutex;

use loramix_common::Result;

use crate::backbone::{ExpertMode, ModelInput, ModelOutput};
use crate::channel::CoefficientChannel;

/// Call-scoped flags of a hooked forward.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Set on the classifier's own shadow call; holds its batch size.
    pub inhibitor: Option<usize>,
    pub experts: ExpertMode,
    pub output_hidden_states: bool,
}

impl ForwardOptions {
    /// Options of the classifier's shadow call.
    pub fn shadow(batch_size: usize) -> Self {
        Self {
            inhibitor: Some(batch_size),
            experts: ExpertMode::Disabled,
            output_hidden_states: true,
        }
    }
}

/// A model whose forward goes through the coordinator hook.
pub trait HookedForward {
    fn forward_hooked(&self, input: &ModelInput, options: ForwardOptions) -> Result<ModelOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    ShadowPass,
    Published,
    RealPass,
}

/// Monotonic counters, mainly for tests and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorStats {
    /// Inhibited calls answered with neutral coefficients.
    pub shadow_passes: usize,
    /// Real coefficient tensors published to the channel.
    pub publications: usize,
}

/// `1 / n_classes` everywhere, shape `(batch, n_layers, n_classes)`.
pub fn uniform_coefficients(
    batch: usize,
    n_layers: usize,
    n_classes: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    let value = 1.0 / n_classes.max(1) as f64;
    Ok(Tensor::ones((batch, n_layers, n_classes), dtype, device)?.affine(value, 0.0)?)
}

pub struct ForwardCoordinator {
    n_layers: usize,
    n_classes: usize,
    state: Mutex<CoordinatorState>,
    shadow_passes: AtomicUsize,
    publications: AtomicUsize,
}

impl ForwardCoordinator {
    pub fn new(n_layers: usize, n_classes: usize) -> Self {
        Self {
            n_layers,
            n_classes,
            state: Mutex::new(CoordinatorState::Idle),
            shadow_passes: AtomicUsize::new(0),
            publications: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.lock()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            shadow_passes: self.shadow_passes.load(Ordering::Relaxed),
            publications: self.publications.load(Ordering::Relaxed),
        }
    }

    /// Inhibitor branch of the hook: publish neutral coefficients for the
    /// `n_layers` reads of the shadow pass. Never calls the classifier.
    ///
    /// On the very first call there is nothing to fall back to, so the
    /// neutral value is published without a bound; the real publication
    /// that follows overwrites it.
    pub fn inhibit(
        &self,
        channel: &CoefficientChannel,
        batch_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<()> {
        let neutral =
            uniform_coefficients(batch_size, self.n_layers, self.n_classes, dtype, device)?;
        if channel.is_set() {
            channel.set_with_lifetime(neutral, self.n_layers)?;
        } else {
            channel.set(neutral)?;
        }
        self.shadow_passes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(batch_size, n_layers = self.n_layers, "shadow pass inhibited");
        Ok(())
    }

    /// Start an outer call. The returned guard drives the state machine and
    /// puts it back to `Idle` however the call ends.
    pub fn begin<'a>(&'a self, channel: &'a CoefficientChannel) -> PassGuard<'a> {
        let mut state = self.state.lock();
        if *state != CoordinatorState::Idle {
            tracing::warn!(
                state = ?*state,
                "overlapping forward calls on one gated model; serialise calls or use one model per caller"
            );
        }
        *state = CoordinatorState::ShadowPass;
        PassGuard {
            coordinator: self,
            channel,
            channel_was_set: channel.is_set(),
            completed: false,
        }
    }

    fn transition(&self, to: CoordinatorState) {
        *self.state.lock() = to;
    }
}

/// RAII handle over one outer forward call.
///
/// Dropping it without [`PassGuard::finish`] (early return on error, or a
/// panic) cuts any pending inhibitor override short, so the neutral
/// coefficients of an aborted shadow pass cannot leak into the next call.
/// If the channel was empty when the call began it is emptied again.
pub struct PassGuard<'a> {
    coordinator: &'a ForwardCoordinator,
    channel: &'a CoefficientChannel,
    channel_was_set: bool,
    completed: bool,
}

impl PassGuard<'_> {
    /// Publish the classifier's coefficients for the real pass.
    pub fn publish(&mut self, coefficients: Tensor) -> Result<()> {
        self.channel.set(coefficients)?;
        self.coordinator.publications.fetch_add(1, Ordering::Relaxed);
        self.coordinator.transition(CoordinatorState::Published);
        Ok(())
    }

    pub fn enter_real_pass(&mut self) {
        self.coordinator.transition(CoordinatorState::RealPass);
    }

    pub fn finish(mut self) {
        self.completed = true;
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            if !self.channel_was_set {
                self.channel.clear();
                tracing::debug!("aborted first forward call: cleared coefficient channel");
            } else if self.channel.expire_override() {
                tracing::debug!("aborted forward call: dropped pending inhibitor coefficients");
            }
        }
        self.coordinator.transition(CoordinatorState::Idle);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
