//! Normalisation layers of the reference backbone.
//!
//! Both variants are composed from primitive tensor ops so gradients flow
//! through them: the gating classifier is trained through every block norm
//! and the final norm of a frozen backbone. The fused `candle_nn` kernels
//! have no backward pass.

use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

use loramix_common::BackboneConfig;

/// RMSNorm (when `use_rms_norm = true`) or bias-free LayerNorm, each with a
/// learned `weight` of width `hidden_size`.
pub struct NormLayer {
    weight: Tensor,
    eps: f64,
    remove_mean: bool,
}

impl NormLayer {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("ln1")`).
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
        Ok(Self {
            weight,
            eps: config.layer_norm_eps,
            remove_mean: !config.use_rms_norm,
        })
    }

    pub fn is_rms(&self) -> bool {
        !self.remove_mean
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let internal = match dtype {
            DType::F16 | DType::BF16 => DType::F32,
            d => d,
        };
        let mut x = x.to_dtype(internal)?;
        if self.remove_mean {
            x = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
        }
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        normed.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}
