//! Frozen low-rank adapter experts.
//!
//! A LoRA expert adds `scale · (x Aᵀ) Bᵀ` on top of a frozen base
//! projection, with `A: (rank, in)`, `B: (out, rank)` and
//! `scale = alpha / rank`. Weights are read through a [`VarBuilder`] under
//! `lora_A.{name}` / `lora_B.{name}`, so a safetensors file loaded into the
//! backing `VarMap` supplies trained experts.

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use loramix_common::AdapterSpec;

/// Init used when no checkpoint supplies the expert weights.
const LORA_INIT: Init = Init::Randn {
    mean: 0.,
    stdev: 0.02,
};

/// `x @ w_t` for inputs with any number of leading dimensions.
pub(crate) fn matmul_reshape(x: &Tensor, w_t: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let out_dim = w_t.dim(1)?;
    let last = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 1].iter().product();
    let y = x.reshape((rows, last))?.matmul(w_t)?;
    let mut out_shape = dims[..dims.len() - 1].to_vec();
    out_shape.push(out_dim);
    y.reshape(out_shape)
}

/// One frozen LoRA expert.
#[derive(Clone)]
pub struct LoraExpert {
    name: String,
    a: Tensor,
    b: Tensor,
    scale: f64,
}

impl LoraExpert {
    pub fn new(spec: &AdapterSpec, in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let a = vb.get_with_hints(
            (spec.rank, in_dim),
            &format!("lora_A.{}", spec.name),
            LORA_INIT,
        )?;
        let b = vb.get_with_hints(
            (out_dim, spec.rank),
            &format!("lora_B.{}", spec.name),
            LORA_INIT,
        )?;
        Ok(Self::from_weights(spec.name.clone(), a, b, spec.scale()))
    }

    /// Build from explicit factors. Gradients never reach them.
    pub fn from_weights(name: impl Into<String>, a: Tensor, b: Tensor, scale: f64) -> Self {
        Self {
            name: name.into(),
            a: a.detach(),
            b: b.detach(),
            scale,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[0]
    }

    pub fn parameter_count(&self) -> usize {
        self.a.elem_count() + self.b.elem_count()
    }

    /// Incremental contribution of this expert for input `x`.
    pub fn delta(&self, x: &Tensor) -> Result<Tensor> {
        let h = matmul_reshape(x, &self.a.t()?)?;
        let y = matmul_reshape(&h, &self.b.t()?)?;
        y.affine(self.scale, 0.0)
    }
}

/// Frozen projection carrying every expert at unit weight.
///
/// This is an adapter-bearing layer before gating is attached: all experts
/// are summed statically onto the base output.
#[derive(Clone)]
pub struct LoraLinear {
    base: Linear,
    experts: Vec<LoraExpert>,
}

impl LoraLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        adapters: &[AdapterSpec],
        vb: VarBuilder,
    ) -> Result<Self> {
        let base = candle_nn::linear_no_bias(in_dim, out_dim, vb.clone())?;
        let experts = adapters
            .iter()
            .map(|spec| LoraExpert::new(spec, in_dim, out_dim, vb.clone()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { base, experts })
    }

    pub fn from_parts(base: Linear, experts: Vec<LoraExpert>) -> Self {
        Self { base, experts }
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn experts(&self) -> &[LoraExpert] {
        &self.experts
    }

    /// Base output only, as if no adapter were loaded.
    pub fn forward_base(&self, x: &Tensor) -> Result<Tensor> {
        self.base.forward(x)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = self.base.forward(x)?;
        for expert in &self.experts {
            out = (out + expert.delta(x)?)?;
        }
        Ok(out)
    }

    pub(crate) fn into_parts(self) -> (Linear, Vec<LoraExpert>) {
        (self.base, self.experts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn delta_matches_manual_product() {
        let device = Device::Cpu;
        // A = [[1, 0]] (rank 1, in 2), B = [[2], [0], [1]] (out 3, rank 1)
        let a = Tensor::new(&[[1f32, 0.]], &device).unwrap();
        let b = Tensor::new(&[[2f32], [0.], [1.]], &device).unwrap();
        let expert = LoraExpert::from_weights("e", a, b, 0.5);
        let x = Tensor::new(&[[[3f32, 7.]]], &device).unwrap(); // (1, 1, 2)
        let y = expert.delta(&x).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(y, vec![vec![vec![3.0, 0.0, 1.5]]]);
        assert_eq!(expert.rank(), 1);
        assert_eq!(expert.parameter_count(), 5);
    }

    #[test]
    fn static_sum_adds_every_expert() {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::eye(2, DType::F32, &device).unwrap(), None);
        let one = Tensor::new(&[[1f32, 1.]], &device).unwrap();
        let col = Tensor::new(&[[1f32], [0.]], &device).unwrap();
        let experts = vec![
            LoraExpert::from_weights("a", one.clone(), col.clone(), 1.0),
            LoraExpert::from_weights("b", one, col, 2.0),
        ];
        let layer = LoraLinear::from_parts(base, experts);
        let x = Tensor::new(&[[[1f32, 2.]]], &device).unwrap();
        let y = layer.forward(&x).unwrap().to_vec3::<f32>().unwrap();
        // base [1, 2] + (1 + 2) * 3 on the first output
        assert_eq!(y, vec![vec![vec![10.0, 2.0]]]);
        let base_only = layer.forward_base(&x).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(base_only, vec![vec![vec![1.0, 2.0]]]);
    }

    #[test]
    fn built_from_var_builder() {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let specs = [AdapterSpec::new("x", 4, 8.0), AdapterSpec::new("y", 2, 2.0)];
        let layer = LoraLinear::new(6, 5, &specs, vb.pp("proj")).unwrap();
        assert_eq!(layer.experts().len(), 2);
        assert_eq!(layer.experts()[0].rank(), 4);
        let x = Tensor::zeros((2, 3, 6), DType::F32, &device).unwrap();
        assert_eq!(layer.forward(&x).unwrap().dims(), &[2, 3, 5]);
        // base weight + two A/B pairs
        assert_eq!(varmap.all_vars().len(), 5);
    }
}
