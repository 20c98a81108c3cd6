//! # loramix-train: classifier training
//!
//! * **[`GatingTrainer`]**: owns a gated model whose backbone and experts
//!   stay frozen. One call to [`GatingTrainer::step`] runs the gated
//!   forward, next-token cross-entropy, gradient clipping and an AdamW step
//!   over the classifier parameters only.
//! * **[`LrScheduler`]**: warmup → cosine / linear / constant.

pub mod scheduler;
pub mod trainer;

pub use scheduler::{LrDecay, LrScheduler};
pub use trainer::{make_batches, GatingTrainer, StepMetrics, TrainerConfig};
