//! Error taxonomy of the gating core.
//!
//! Every variant is fatal to the call that raised it. Nothing in the core
//! retries or substitutes defaults; callers match on the variant to tell
//! wiring defects from runtime shape problems.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatingError {
    /// The coefficient channel was read before anything was published.
    #[error("coefficient channel read before any coefficients were published")]
    ChannelUnset,

    /// A coefficient tensor did not have the `(batch, layers, experts)` layout.
    #[error("invalid coefficient shape: expected {expected}, got {actual:?}")]
    InvalidShape {
        expected: String,
        actual: Vec<usize>,
    },

    /// A bounded-lifetime override was requested on an empty channel.
    #[error("bounded-lifetime coefficients need a previously published value to fall back to")]
    NoPriorValue,

    /// A hidden state or checkpoint did not match the configured dimensions.
    #[error("{what} mismatch: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Decision-position derivation needed an attention mask that was not supplied.
    #[error("attention mask is required to locate the decision position")]
    MissingAttentionMask,

    /// `flush_log` was called while coefficient logging was never enabled.
    #[error("coefficient logging is disabled")]
    LoggingDisabled,

    /// `flush_log` was called with nothing buffered.
    #[error("no logged coefficients to flush")]
    EmptyLog,

    /// A model input carried neither token ids nor embeddings.
    #[error("model input needs either input_ids or inputs_embeds")]
    MissingInput,

    /// The backbone returned no hidden states although capture was requested.
    #[error("backbone did not return hidden states for the shadow pass")]
    MissingHiddenStates,

    /// The configuration record failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GatingError {
    /// Shape error for a coefficient tensor that is not rank 3.
    pub fn invalid_shape(actual: &[usize]) -> Self {
        Self::InvalidShape {
            expected: "(batch, layers, experts)".to_string(),
            actual: actual.to_vec(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatingError>;
