//! # loramix-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`GatingConfig`]**: gating classifier hyper-parameters (serialised as JSON).
//! * **[`BackboneConfig`]** / **[`AdapterSpec`]**: reference backbone and its LoRA experts.
//! * **[`GatingError`]**: the error taxonomy surfaced by the gating core.
//! * **[`batch_to_tensors`]**: raw token batch → Candle tensors.

pub mod config;
pub mod data;
pub mod error;

pub use config::{AdapterSpec, BackboneConfig, GatingConfig, LoramixConfig, PoolingMode};
pub use data::{batch_to_tensors, parse_token_lines, shift_for_next_token};
pub use error::{GatingError, Result};
