//! Gated expert layers.
//!
//! [`AdapterLinear`] is the slot type every adapter-bearing projection of a
//! backbone uses. Attaching gating turns its `Lora` variant into `Gated`,
//! which mixes the experts with per-call coefficients read from the
//! [`CoefficientChannel`](crate::CoefficientChannel) instead of summing them
//! at unit weight.

use std::cmp::Ordering;

use candle_core::{DType, IndexOp, Tensor};
use candle_nn::{Linear, Module};

use loramix_common::{GatingError, Result};

use crate::backbone::{ExpertMode, PassContext};
use crate::lora::{LoraExpert, LoraLinear};

// ── Top-k ───────────────────────────────────────────────────────────────────

/// Keep-mask for the `k` largest entries of `row`.
///
/// Ties go to the lower index. `k >= row.len()` keeps everything.
pub fn top_k_mask(row: &[f32], k: usize) -> Vec<f32> {
    let mut order: Vec<usize> = (0..row.len()).collect();
    // Stable sort: equal weights keep expert-axis order.
    order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
    let mut mask = vec![0f32; row.len()];
    for &i in order.iter().take(k) {
        mask[i] = 1.0;
    }
    mask
}

/// Zero all but the `k` strongest experts of every `(batch, experts)` row.
/// Surviving weights are not renormalised.
pub fn apply_top_k(weights: &Tensor, k: usize) -> Result<Tensor> {
    let (batch, experts) = weights.dims2()?;
    if k >= experts {
        return Ok(weights.clone());
    }
    let rows = weights.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mask: Vec<f32> = rows.iter().flat_map(|r| top_k_mask(r, k)).collect();
    let mask = Tensor::from_vec(mask, (batch, experts), weights.device())?
        .to_dtype(weights.dtype())?;
    Ok((weights * mask)?)
}

// ── ExpertLayer ─────────────────────────────────────────────────────────────

/// One frozen adapter-bearing projection whose experts are mixed by gating
/// coefficients.
///
/// `layer_index` is the position of this layer in the backbone traversal and
/// selects its row of the coefficient tensor.
#[derive(Clone)]
pub struct ExpertLayer {
    layer_index: usize,
    base: Linear,
    experts: Vec<LoraExpert>,
    top_k: Option<usize>,
}

impl ExpertLayer {
    pub fn new(
        layer_index: usize,
        base: Linear,
        experts: Vec<LoraExpert>,
        top_k: Option<usize>,
    ) -> Self {
        Self {
            layer_index,
            base,
            experts,
            top_k,
        }
    }

    pub fn from_lora(lora: LoraLinear, layer_index: usize, top_k: Option<usize>) -> Self {
        let (base, experts) = lora.into_parts();
        Self::new(layer_index, base, experts, top_k)
    }

    pub fn layer_index(&self) -> usize {
        self.layer_index
    }

    pub fn expert_names(&self) -> Vec<&str> {
        self.experts.iter().map(LoraExpert::name).collect()
    }

    pub fn top_k(&self) -> Option<usize> {
        self.top_k
    }

    pub fn set_top_k(&mut self, top_k: Option<usize>) {
        self.top_k = top_k;
    }

    pub fn expert_parameter_count(&self) -> usize {
        self.experts.iter().map(LoraExpert::parameter_count).sum()
    }

    /// This layer's `(batch, experts)` weighting, after top-k filtering.
    fn weighting(&self, coefficients: &Tensor, batch: usize) -> Result<Tensor> {
        let (b, layers, experts) = coefficients
            .dims3()
            .map_err(|_| GatingError::invalid_shape(coefficients.dims()))?;
        if self.layer_index >= layers {
            return Err(GatingError::ShapeMismatch {
                what: "coefficient layer axis",
                expected: self.layer_index + 1,
                actual: layers,
            });
        }
        if experts != self.experts.len() {
            return Err(GatingError::ShapeMismatch {
                what: "coefficient expert axis",
                expected: self.experts.len(),
                actual: experts,
            });
        }
        if b != batch {
            return Err(GatingError::ShapeMismatch {
                what: "coefficient batch",
                expected: batch,
                actual: b,
            });
        }
        let weights = coefficients.i((.., self.layer_index, ..))?;
        match self.top_k {
            Some(k) => apply_top_k(&weights, k),
            None => Ok(weights),
        }
    }

    /// Base output plus every expert's contribution scaled by its coefficient.
    ///
    /// The channel is read exactly once per call, also when experts are
    /// disabled, so bounded-lifetime coefficients drain one access per layer.
    pub fn forward(&self, x: &Tensor, pass: &PassContext<'_>) -> Result<Tensor> {
        let coefficients = pass.channel.get()?;
        let batch = x.dim(0)?;
        let weights = self.weighting(&coefficients, batch)?;

        let mut out = self.base.forward(x)?;
        if pass.experts == ExpertMode::Disabled {
            return Ok(out);
        }

        let rows = weights.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        // (batch, 1, .., 1) so one weight broadcasts over the rest of x.
        let mut bcast = vec![1usize; x.rank()];
        bcast[0] = batch;
        for (j, expert) in self.experts.iter().enumerate() {
            if rows.iter().all(|r| r[j] == 0.0) {
                continue;
            }
            let w = weights.i((.., j))?.reshape(bcast.as_slice())?;
            let delta = expert.delta(x)?;
            out = (out + delta.broadcast_mul(&w.to_dtype(delta.dtype())?)?)?;
        }
        Ok(out)
    }
}

// ── AdapterLinear ───────────────────────────────────────────────────────────

/// Projection slot of a backbone.
pub enum AdapterLinear {
    /// No adapters.
    Frozen(Linear),
    /// Adapters summed at unit weight (before gating is attached).
    Lora(LoraLinear),
    /// Adapters mixed by gating coefficients.
    Gated(ExpertLayer),
}

impl AdapterLinear {
    pub fn forward(&self, x: &Tensor, pass: &PassContext<'_>) -> Result<Tensor> {
        match self {
            Self::Frozen(l) => Ok(l.forward(x)?),
            Self::Lora(l) if pass.experts == ExpertMode::Disabled => Ok(l.forward_base(x)?),
            Self::Lora(l) => Ok(l.forward(x)?),
            Self::Gated(l) => l.forward(x, pass),
        }
    }

    /// Whether this slot carries adapters (gated or not).
    pub fn is_adapter_bearing(&self) -> bool {
        !matches!(self, Self::Frozen(_))
    }

    pub fn as_gated(&self) -> Option<&ExpertLayer> {
        match self {
            Self::Gated(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_gated_mut(&mut self) -> Option<&mut ExpertLayer> {
        match self {
            Self::Gated(l) => Some(l),
            _ => None,
        }
    }

    /// Replace a `Lora` slot by a gated expert layer at `layer_index`.
    pub fn attach(&mut self, layer_index: usize, top_k: Option<usize>) -> Result<()> {
        let lora = match self {
            Self::Lora(lora) => lora,
            Self::Frozen(_) => {
                return Err(GatingError::InvalidConfig(
                    "slot carries no adapters".into(),
                ))
            }
            Self::Gated(_) => {
                return Err(GatingError::InvalidConfig("slot is already gated".into()))
            }
        };
        let gated = ExpertLayer::from_lora(lora.clone(), layer_index, top_k);
        *self = Self::Gated(gated);
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CoefficientChannel;
    use candle_core::Device;
    use proptest::prelude::*;

    /// Identity base on 2 features and three experts whose deltas are
    /// `[s, 0]` for x = [1, 0], with s = 1, 10, 100.
    fn layer(layer_index: usize, top_k: Option<usize>) -> ExpertLayer {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::eye(2, DType::F32, &device).unwrap(), None);
        let a = Tensor::new(&[[1f32, 0.]], &device).unwrap();
        let b = Tensor::new(&[[1f32], [0.]], &device).unwrap();
        let experts = [1.0, 10.0, 100.0]
            .iter()
            .enumerate()
            .map(|(i, &s)| LoraExpert::from_weights(format!("e{i}"), a.clone(), b.clone(), s))
            .collect();
        ExpertLayer::new(layer_index, base, experts, top_k)
    }

    fn x() -> Tensor {
        Tensor::new(&[[[1f32, 0.]]], &Device::Cpu).unwrap() // (1, 1, 2)
    }

    fn coeffs(rows: &[[f32; 3]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (1, rows.len(), 3), &Device::Cpu).unwrap()
    }

    #[test]
    fn top_k_mask_prefers_lower_index_on_ties() {
        assert_eq!(top_k_mask(&[0.2, 0.5, 0.5, 0.1], 1), vec![0., 1., 0., 0.]);
        assert_eq!(top_k_mask(&[0.3, 0.3, 0.3], 2), vec![1., 1., 0.]);
        assert_eq!(top_k_mask(&[0.1, 0.9], 5), vec![1., 1.]);
    }

    #[test]
    fn mixes_experts_with_layer_row() {
        let channel = CoefficientChannel::new();
        channel
            .set(coeffs(&[[0.0, 0.0, 0.0], [0.5, 0.25, 0.01]]))
            .unwrap();
        let l = layer(1, None);
        let y = l
            .forward(&x(), &PassContext::new(&channel))
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        // 1 + 0.5 * 1 + 0.25 * 10 + 0.01 * 100
        assert!((y[0][0][0] - 5.0).abs() < 1e-5);
        assert_eq!(y[0][0][1], 0.0);
    }

    #[test]
    fn top_k_drops_weaker_experts_without_renormalising() {
        let channel = CoefficientChannel::new();
        channel.set(coeffs(&[[0.5, 0.3, 0.2]])).unwrap();
        let l = layer(0, Some(1));
        let y = l
            .forward(&x(), &PassContext::new(&channel))
            .unwrap()
            .to_vec3::<f32>()
            .unwrap();
        assert!((y[0][0][0] - 1.5).abs() < 1e-5);
    }

    #[test]
    fn disabled_experts_still_read_channel() {
        let channel = CoefficientChannel::new();
        channel.set(coeffs(&[[0.0, 0.0, 0.0]])).unwrap();
        channel.set_with_lifetime(coeffs(&[[1.0, 1.0, 1.0]]), 1).unwrap();
        let pass = PassContext {
            experts: ExpertMode::Disabled,
            ..PassContext::new(&channel)
        };
        let y = layer(0, None).forward(&x(), &pass).unwrap();
        assert_eq!(y.to_vec3::<f32>().unwrap()[0][0][0], 1.0);
        assert_eq!(channel.accesses_remaining(), None);
    }

    #[test]
    fn shape_errors_are_reported() {
        let channel = CoefficientChannel::new();
        channel.set(coeffs(&[[0.5, 0.5, 0.0]])).unwrap();
        let err = layer(3, None)
            .forward(&x(), &PassContext::new(&channel))
            .unwrap_err();
        assert!(matches!(
            err,
            GatingError::ShapeMismatch {
                what: "coefficient layer axis",
                ..
            }
        ));

        channel
            .set(Tensor::zeros((1, 1, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let err = layer(0, None)
            .forward(&x(), &PassContext::new(&channel))
            .unwrap_err();
        assert!(matches!(
            err,
            GatingError::ShapeMismatch {
                what: "coefficient expert axis",
                ..
            }
        ));
    }

    #[test]
    fn unset_channel_propagates() {
        let channel = CoefficientChannel::new();
        assert!(matches!(
            layer(0, None).forward(&x(), &PassContext::new(&channel)),
            Err(GatingError::ChannelUnset)
        ));
    }

    #[test]
    fn attach_converts_lora_slots_only() {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::eye(2, DType::F32, &device).unwrap(), None);
        let mut frozen = AdapterLinear::Frozen(base.clone());
        match frozen.attach(0, None) {
            Err(GatingError::InvalidConfig(msg)) => assert!(msg.contains("no adapters")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert!(frozen.as_gated().is_none());

        let mut slot = AdapterLinear::Lora(LoraLinear::from_parts(base, Vec::new()));
        assert!(slot.is_adapter_bearing());
        slot.attach(4, Some(2)).unwrap();
        let gated = slot.as_gated().unwrap();
        assert_eq!(gated.layer_index(), 4);
        assert_eq!(gated.top_k(), Some(2));
        match slot.attach(5, None) {
            Err(GatingError::InvalidConfig(msg)) => assert!(msg.contains("already gated")),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert_eq!(slot.as_gated().unwrap().layer_index(), 4);
    }

    proptest! {
        #[test]
        fn top_k_keeps_exactly_the_largest(
            row in proptest::collection::vec(0.001f32..1.0, 1..12),
            k in 1usize..14,
        ) {
            let mask = top_k_mask(&row, k);
            let kept: Vec<usize> = (0..row.len()).filter(|&i| mask[i] == 1.0).collect();
            prop_assert_eq!(kept.len(), k.min(row.len()));
            let min_kept = kept.iter().map(|&i| row[i]).fold(f32::INFINITY, f32::min);
            for i in 0..row.len() {
                if mask[i] == 0.0 {
                    prop_assert!(row[i] <= min_kept);
                    // A dropped tie must sit after every kept tie.
                    if row[i] == min_kept {
                        prop_assert!(kept.iter().all(|&j| row[j] != min_kept || j < i));
                    }
                }
            }
        }
    }
}
