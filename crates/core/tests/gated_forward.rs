//! End-to-end behaviour of a gated reference transformer.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{VarBuilder, VarMap};

use loramix_common::{AdapterSpec, BackboneConfig, GatingConfig, GatingError, PoolingMode, Result};
use loramix_core::{
    AdapterLinear, CoordinatorState, ExpertBackbone, GatedModel, LoraExpert, LoraLinear,
    LoraTransformer, ModelInput, ModelOutput, PassContext,
};

const HIDDEN: usize = 16;

fn backbone_config(num_layers: usize, experts: usize) -> BackboneConfig {
    BackboneConfig {
        vocab_size: 32,
        hidden_size: HIDDEN,
        num_heads: 2,
        num_layers,
        intermediate_size: 32,
        max_seq_len: 16,
        experts: (0..experts)
            .map(|i| AdapterSpec::new(format!("e{i}"), 2, 4.0))
            .collect(),
        ..Default::default()
    }
}

fn gating_config() -> GatingConfig {
    GatingConfig {
        hidden_size: HIDDEN,
        gating_size: 8,
        layerwise_scalings: true,
        ..Default::default()
    }
}

fn gated(num_layers: usize, experts: usize, gating: GatingConfig) -> GatedModel<LoraTransformer> {
    let config = backbone_config(num_layers, experts);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backbone = LoraTransformer::new(vb, &config).unwrap();
    GatedModel::attach(backbone, config.expert_names(), gating, DType::F32, &Device::Cpu).unwrap()
}

fn input(rows: &[[u32; 4]], mask: &[[u32; 4]]) -> ModelInput {
    let ids = Tensor::from_vec(rows.concat(), (rows.len(), 4), &Device::Cpu).unwrap();
    let mask = Tensor::from_vec(mask.concat(), (mask.len(), 4), &Device::Cpu).unwrap();
    ModelInput::from_ids(ids).with_attention_mask(mask)
}

fn published(model: &GatedModel<LoraTransformer>) -> Vec<Vec<Vec<f32>>> {
    model.channel().get().unwrap().to_vec3::<f32>().unwrap()
}

#[test]
fn one_call_runs_one_shadow_pass_and_one_publication() {
    let model = gated(2, 3, gating_config());
    assert_eq!(model.n_layers(), 8);

    let out = model
        .forward(&input(&[[1, 2, 3, 4], [5, 6, 0, 0]], &[[1, 1, 1, 1], [1, 1, 0, 0]]))
        .unwrap();
    assert_eq!(out.logits.dims(), &[2, 4, 32]);
    assert!(out.hidden_states.is_none());

    let stats = model.coordinator().stats();
    assert_eq!(stats.shadow_passes, 1);
    assert_eq!(stats.publications, 1);
    assert_eq!(model.coordinator().state(), CoordinatorState::Idle);

    model
        .forward(&input(&[[1, 2, 3, 4]], &[[1, 1, 1, 1]]))
        .unwrap();
    let stats = model.coordinator().stats();
    assert_eq!(stats.shadow_passes, 2);
    assert_eq!(stats.publications, 2);
}

#[test]
fn published_coefficients_stay_after_the_call() {
    let model = gated(1, 3, gating_config());
    for _ in 0..2 {
        model
            .forward(&input(&[[1, 2, 3, 4]], &[[1, 1, 1, 0]]))
            .unwrap();
        assert_eq!(model.channel().accesses_remaining(), None);
        let coeffs = published(&model);
        assert_eq!(coeffs.len(), 1);
        assert_eq!(coeffs[0].len(), model.n_layers());
        for row in &coeffs[0] {
            assert_eq!(row.len(), 3);
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
            // Not the neutral shadow-pass value.
            assert!(row.iter().any(|v| (v - 1.0 / 3.0).abs() > 1e-6));
        }
    }
}

#[test]
fn aborted_call_does_not_leak_neutral_coefficients() {
    let model = gated(1, 2, gating_config());
    model
        .forward(&input(&[[1, 2, 3, 4]], &[[1, 1, 1, 1]]))
        .unwrap();
    let before = published(&model);

    // Wrong embedding width fails inside the shadow pass, after the
    // inhibitor override is published but before any layer reads it.
    let bad = ModelInput::from_embeds(Tensor::zeros((1, 4, HIDDEN + 1), DType::F32, &Device::Cpu).unwrap())
        .with_attention_mask(Tensor::ones((1, 4), DType::U32, &Device::Cpu).unwrap());
    let err = model.forward(&bad).unwrap_err();
    assert!(matches!(err, GatingError::ShapeMismatch { .. }));

    assert_eq!(model.coordinator().state(), CoordinatorState::Idle);
    assert_eq!(model.channel().accesses_remaining(), None);
    assert_eq!(published(&model), before);
}

#[test]
fn missing_mask_is_reported() {
    let model = gated(1, 2, gating_config());
    let ids = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
    let err = model.forward(&ModelInput::from_ids(ids)).unwrap_err();
    assert!(matches!(err, GatingError::MissingAttentionMask));
    assert_eq!(model.coordinator().stats().publications, 0);
    // Nothing was ever published, so the shadow override must not linger.
    assert!(matches!(model.channel().get(), Err(GatingError::ChannelUnset)));
    assert_eq!(model.channel().accesses_remaining(), None);
}

#[test]
fn stop_token_replaces_the_mask() {
    let model = gated(
        1,
        2,
        GatingConfig {
            stop_token_id: Some(7),
            ..gating_config()
        },
    );
    let ids = Tensor::new(&[[1u32, 7, 3], [4, 5, 6]], &Device::Cpu).unwrap();
    model.forward(&ModelInput::from_ids(ids)).unwrap();
    assert_eq!(model.coordinator().stats().publications, 1);
}

#[test]
fn zero_layers_attach_and_predict_empty_axis() {
    let model = gated(0, 3, gating_config());
    assert_eq!(model.n_layers(), 0);
    model
        .forward(&input(&[[1, 2, 3, 4]], &[[1, 1, 1, 1]]))
        .unwrap();
    let coeffs = model.channel().get().unwrap();
    assert_eq!(coeffs.dims(), &[1, 0, 3]);
}

#[test]
fn attach_rejects_mismatched_width_and_experts() {
    let config = backbone_config(1, 2);
    let build = || {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        LoraTransformer::new(vb, &config).unwrap()
    };

    let wide = GatingConfig {
        hidden_size: HIDDEN * 2,
        ..gating_config()
    };
    let err = GatedModel::attach(build(), config.expert_names(), wide, DType::F32, &Device::Cpu);
    assert!(matches!(err, Err(GatingError::ShapeMismatch { .. })));

    let names = vec!["other".to_string(), "e1".to_string()];
    let err = GatedModel::attach(build(), names, gating_config(), DType::F32, &Device::Cpu);
    assert!(matches!(err, Err(GatingError::InvalidConfig(_))));

    let err = GatedModel::attach(build(), Vec::new(), gating_config(), DType::F32, &Device::Cpu);
    assert!(matches!(err, Err(GatingError::InvalidConfig(_))));
}

#[test]
fn top_k_reaches_every_gated_slot() {
    let model = gated(
        2,
        3,
        GatingConfig {
            top_k_lora: Some(1),
            ..gating_config()
        },
    );
    let mut backbone = model.into_backbone();
    let slots = backbone.adapter_slots_mut();
    assert_eq!(slots.len(), 8);
    for (i, (_, slot)) in slots.into_iter().enumerate() {
        let layer = slot.as_gated().unwrap();
        assert_eq!(layer.layer_index(), i);
        assert_eq!(layer.top_k(), Some(1));
    }
}

#[test]
fn classifier_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let x = input(&[[1, 2, 3, 4]], &[[1, 1, 1, 1]]);

    let model = gated(1, 2, gating_config());
    model.forward(&x).unwrap();
    let expected = published(&model);
    model.save_classifier(dir.path()).unwrap();

    let mut other = gated(1, 2, gating_config());
    other.load_classifier(dir.path()).unwrap();
    other.forward(&x).unwrap();
    // Backbones differ, so only shapes and normalisation are comparable
    // across models; the classifier head itself must match exactly.
    let pooled = Tensor::ones((1, HIDDEN), DType::F32, &Device::Cpu).unwrap();
    let a = model.classifier().head(&pooled).unwrap().to_vec3::<f32>().unwrap();
    let b = other.classifier().head(&pooled).unwrap().to_vec3::<f32>().unwrap();
    assert_eq!(a, b);
    assert_eq!(published(&other).len(), expected.len());

    let mut wrong = gated(2, 2, gating_config());
    assert!(matches!(
        wrong.load_classifier(dir.path()),
        Err(GatingError::ShapeMismatch { .. })
    ));
}

#[test]
fn logged_coefficients_flush_to_npy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scalings.npy");
    let model = gated(1, 2, gating_config());

    assert!(matches!(model.flush_log(&path), Err(GatingError::LoggingDisabled)));
    model.enable_logging();
    assert!(matches!(model.flush_log(&path), Err(GatingError::EmptyLog)));

    model
        .forward(&input(&[[1, 2, 3, 4], [4, 3, 2, 1]], &[[1; 4], [1; 4]]))
        .unwrap();
    model
        .forward(&input(&[[1, 2, 3, 4]], &[[1; 4]]))
        .unwrap();
    model.flush_log(&path).unwrap();
    assert_eq!(model.classifier().logged_batches(), 0);

    let logged = Tensor::read_npy(&path).unwrap();
    assert_eq!(logged.dims(), &[3, model.n_layers(), 2]);
    let sums = logged.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));

    // Disabling keeps flush usable but stops recording.
    model.disable_logging();
    model.forward(&input(&[[1, 2, 3, 4]], &[[1; 4]])).unwrap();
    assert!(matches!(model.flush_log(&path), Err(GatingError::EmptyLog)));
}

#[test]
fn parameter_report_counts_classifier_and_experts() {
    let model = gated(1, 2, GatingConfig { gating_depth: 1, ..gating_config() });
    let report = model.parameter_report();
    assert_eq!(report.gated_layers, 4);
    // one linear 16 -> 2 * 4 layers, no bias
    assert_eq!(report.classifier_trainable, 16 * 8);
    assert_eq!(report.classifier_total, report.classifier_trainable);
    assert!(report.expert_parameters > 0);
}

#[test]
fn every_head_variant_publishes_well_formed_coefficients() {
    let prefix = input(&[[1, 2, 3, 4], [9, 8, 7, 6]], &[[1, 1, 0, 0], [1, 1, 1, 0]]);
    // Same rows up to each decision position, different afterwards.
    let other_tail = input(&[[1, 2, 30, 31], [9, 8, 7, 29]], &[[1, 1, 0, 0], [1, 1, 1, 0]]);

    for pooling in [PoolingMode::DecisionToken, PoolingMode::Mean] {
        for layerwise_scalings in [true, false] {
            for enable_softmax in [true, false] {
                for enable_relu_and_dropout in [true, false] {
                    for gating_depth in [1, 2] {
                        for training in [false, true] {
                            let config = GatingConfig {
                                pooling,
                                layerwise_scalings,
                                enable_softmax,
                                enable_relu_and_dropout,
                                gating_depth,
                                dropout_p: 0.5,
                                ..gating_config()
                            };
                            let label = format!("{config:?} training={training}");
                            let model = gated(1, 3, config);
                            model.set_training(training);

                            model.forward(&prefix).unwrap();
                            let coeffs = published(&model);
                            assert_eq!(coeffs.len(), 2, "{label}");
                            for row in &coeffs {
                                assert_eq!(row.len(), model.n_layers(), "{label}");
                                for layer in row {
                                    assert_eq!(layer.len(), 3, "{label}");
                                    assert!(layer.iter().all(|v| v.is_finite()), "{label}");
                                    if enable_softmax {
                                        let sum: f32 = layer.iter().sum();
                                        assert!((sum - 1.0).abs() < 1e-5, "{label}");
                                    }
                                }
                                if !layerwise_scalings {
                                    assert!(row.iter().all(|layer| layer == &row[0]), "{label}");
                                }
                            }

                            if !training {
                                model.forward(&other_tail).unwrap();
                                let again = published(&model);
                                for (a, b) in coeffs.iter().flatten().zip(again.iter().flatten()) {
                                    for (x, y) in a.iter().zip(b) {
                                        assert!((x - y).abs() < 1e-5, "{label}: {x} vs {y}");
                                    }
                                }
                            }

                            model.set_training(false);
                            assert!(!model.classifier().is_training(), "{label}");
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn print_budget_counts_down_and_stops() {
    let model = gated(1, 2, gating_config());
    let x = input(&[[1, 2, 3, 4]], &[[1; 4]]);
    assert_eq!(model.classifier().predictions_to_print(), 0);

    model.set_print_predictions(2);
    model.forward(&x).unwrap();
    assert_eq!(model.classifier().predictions_to_print(), 1);
    model.forward(&x).unwrap();
    model.forward(&x).unwrap();
    assert_eq!(model.classifier().predictions_to_print(), 0);
    model.forward(&x).unwrap();
    assert_eq!(model.classifier().predictions_to_print(), 0);
}

/// A backbone that hands out whatever slots it was built with.
struct SlotBackbone {
    slots: Vec<AdapterLinear>,
}

impl SlotBackbone {
    fn lora(name: &str) -> AdapterLinear {
        let device = Device::Cpu;
        let base = candle_nn::Linear::new(Tensor::eye(HIDDEN, DType::F32, &device).unwrap(), None);
        let a = Tensor::zeros((2, HIDDEN), DType::F32, &device).unwrap();
        let b = Tensor::zeros((HIDDEN, 2), DType::F32, &device).unwrap();
        let expert = LoraExpert::from_weights(name, a, b, 1.0);
        AdapterLinear::Lora(LoraLinear::from_parts(base, vec![expert]))
    }

    fn frozen() -> AdapterLinear {
        let weight = Tensor::eye(HIDDEN, DType::F32, &Device::Cpu).unwrap();
        AdapterLinear::Frozen(candle_nn::Linear::new(weight, None))
    }
}

impl ExpertBackbone for SlotBackbone {
    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn adapter_slots_mut(&mut self) -> Vec<(String, &mut AdapterLinear)> {
        self.slots
            .iter_mut()
            .enumerate()
            .map(|(i, slot)| (format!("slot.{i}"), slot))
            .collect()
    }

    fn forward(&self, _input: &ModelInput, _pass: &PassContext<'_>) -> Result<ModelOutput> {
        Err(GatingError::MissingInput)
    }
}

fn attach_slots(backbone: SlotBackbone) -> std::result::Result<GatedModel<SlotBackbone>, GatingError> {
    GatedModel::attach(backbone, vec!["e0".to_string()], gating_config(), DType::F32, &Device::Cpu)
}

#[test]
fn attach_names_frozen_and_regated_slots() {
    let frozen = SlotBackbone {
        slots: vec![SlotBackbone::lora("e0"), SlotBackbone::frozen()],
    };
    match attach_slots(frozen) {
        Err(GatingError::InvalidConfig(msg)) => {
            assert!(msg.contains("slot.1 carries no adapters"), "{msg}")
        }
        other => panic!("expected InvalidConfig, got {:?}", other.err()),
    }

    let model = attach_slots(SlotBackbone {
        slots: vec![SlotBackbone::lora("e0"), SlotBackbone::lora("e0")],
    })
    .unwrap();
    assert_eq!(model.n_layers(), 2);
    match attach_slots(model.into_backbone()) {
        Err(GatingError::InvalidConfig(msg)) => {
            assert!(msg.contains("slot.0 is already gated"), "{msg}")
        }
        other => panic!("expected InvalidConfig, got {:?}", other.err()),
    }
}
