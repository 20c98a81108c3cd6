//! Single-slot coefficient broadcast channel.
//!
//! One channel exists per gated model. The coordinator writes it once per
//! outer forward call; every gated expert layer reads it during the pass.
//!
//! A value may carry a bounded lifetime: after exactly `n` reads the channel
//! reverts to the previously published value. The shadow pass uses this so
//! its neutral coefficients are seen by precisely the adapter layers that
//! run inside it and by nothing afterwards.
//!
//! # Thread safety
//!
//! State sits behind a [`parking_lot::Mutex`] so the owning model stays
//! `Send + Sync`, but reads and writes are *not* attributed to a call.
//! Overlapping forward calls on one model must be serialised by the caller,
//! or each caller must own its own model (and therefore its own channel).

use candle_core::Tensor;
use parking_lot::Mutex;

use loramix_common::{GatingError, Result};

#[derive(Default)]
struct ChannelState {
    current: Option<Tensor>,
    fallback: Option<Tensor>,
    /// `None` = unlimited.
    accesses_remaining: Option<usize>,
}

/// Holder of the current `(batch, layers, experts)` gating coefficients.
#[derive(Default)]
pub struct CoefficientChannel {
    state: Mutex<ChannelState>,
}

impl CoefficientChannel {
    /// Empty channel. Reading before the first `set` is an error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `coefficients` with unlimited lifetime, dropping any pending
    /// override and its fallback.
    pub fn set(&self, coefficients: Tensor) -> Result<()> {
        check_rank(&coefficients)?;
        let mut state = self.state.lock();
        state.current = Some(coefficients);
        state.fallback = None;
        state.accesses_remaining = None;
        Ok(())
    }

    /// Publish `coefficients` for exactly `n_accesses` reads, then revert to
    /// the value that was visible before.
    ///
    /// If the channel already holds a bounded override, the fallback stays the
    /// durable value underneath it so overrides never stack. `n_accesses = 0`
    /// leaves the visible value untouched.
    pub fn set_with_lifetime(&self, coefficients: Tensor, n_accesses: usize) -> Result<()> {
        check_rank(&coefficients)?;
        let mut state = self.state.lock();
        let Some(current) = state.current.take() else {
            return Err(GatingError::NoPriorValue);
        };
        let fallback = if state.accesses_remaining.is_some() {
            state.fallback.take().unwrap_or(current)
        } else {
            current
        };
        if n_accesses == 0 {
            state.current = Some(fallback);
            state.fallback = None;
            state.accesses_remaining = None;
            return Ok(());
        }
        state.current = Some(coefficients);
        state.fallback = Some(fallback);
        state.accesses_remaining = Some(n_accesses);
        Ok(())
    }

    /// Read the visible coefficients, consuming one access of a bounded value.
    pub fn get(&self) -> Result<Tensor> {
        let mut state = self.state.lock();
        let value = state.current.clone().ok_or(GatingError::ChannelUnset)?;
        if let Some(remaining) = state.accesses_remaining {
            let remaining = remaining.saturating_sub(1);
            if remaining == 0 {
                if let Some(fallback) = state.fallback.take() {
                    state.current = Some(fallback);
                }
                state.accesses_remaining = None;
            } else {
                state.accesses_remaining = Some(remaining);
            }
        }
        Ok(value)
    }

    /// Whether anything has been published yet.
    pub fn is_set(&self) -> bool {
        self.state.lock().current.is_some()
    }

    pub fn accesses_remaining(&self) -> Option<usize> {
        self.state.lock().accesses_remaining
    }

    /// Forget every published value; the next read fails with
    /// [`GatingError::ChannelUnset`].
    pub fn clear(&self) {
        *self.state.lock() = ChannelState::default();
    }

    /// Drop a pending bounded override and restore its fallback immediately.
    ///
    /// Returns `true` if an override was cut short.
    pub fn expire_override(&self) -> bool {
        let mut state = self.state.lock();
        if state.accesses_remaining.take().is_none() {
            return false;
        }
        if let Some(fallback) = state.fallback.take() {
            state.current = Some(fallback);
        }
        true
    }
}

fn check_rank(t: &Tensor) -> Result<()> {
    if t.rank() != 3 {
        return Err(GatingError::invalid_shape(t.dims()));
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
