//! Causal self-attention whose projections are adapter slots.
//!
//! Fused Q/K/V projection (`c_attn`, 3 × hidden) and an output projection
//! (`c_proj`). Both are [`AdapterLinear`]s, so gating reaches them.

use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::VarBuilder;

use loramix_common::{BackboneConfig, Result};

use crate::backbone::PassContext;
use crate::expert::AdapterLinear;
use crate::model::adapter_slot;

/// Multi-head causal self-attention.
pub struct CausalSelfAttention {
    pub(crate) c_attn: AdapterLinear,
    pub(crate) c_proj: AdapterLinear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl CausalSelfAttention {
    pub fn new(config: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim()?;
        let c_attn = adapter_slot(hidden, 3 * hidden, &config.experts, vb.pp("c_attn"))?;
        let c_proj = adapter_slot(hidden, hidden, &config.experts, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(&self, x: &Tensor, pass: &PassContext<'_>) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        let qkv = self.c_attn.forward(x, pass)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let device = x.device();
        let mask = Tensor::tril2(t, DType::F32, device)?.reshape((1, 1, t, t))?;
        let neg_inf = (mask.affine(1.0, -1.0)? * 1e9)?;
        let scores = scores.broadcast_add(&neg_inf.to_dtype(scores.dtype())?)?;

        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;

        self.c_proj.forward(&y, pass)
    }
}
