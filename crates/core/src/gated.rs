//! A backbone with gating attached.
//!
//! [`GatedModel::attach`] walks the backbone's adapter slots once, turning
//! each into a gated [`ExpertLayer`](crate::ExpertLayer) whose layer index is
//! its traversal position, then wires the channel, classifier and
//! coordinator together. Every outer [`GatedModel::forward`] runs the
//! shadow pass, publishes real coefficients and then the real pass.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device};

use loramix_common::{GatingConfig, GatingError, Result};

use crate::backbone::{ExpertBackbone, ModelInput, ModelOutput, PassContext};
use crate::channel::CoefficientChannel;
use crate::classifier::GatingClassifier;
use crate::coordinator::{ForwardCoordinator, ForwardOptions, HookedForward};
use crate::expert::AdapterLinear;
use crate::lora::LoraExpert;

/// Parameter summary of a gated model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterReport {
    pub classifier_trainable: usize,
    pub classifier_total: usize,
    /// Frozen LoRA parameters across every gated layer.
    pub expert_parameters: usize,
    pub gated_layers: usize,
}

impl fmt::Display for ParameterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "classifier: {} trainable / {} total, experts: {} frozen over {} gated layers",
            self.classifier_trainable,
            self.classifier_total,
            self.expert_parameters,
            self.gated_layers
        )
    }
}

pub struct GatedModel<B: ExpertBackbone> {
    backbone: B,
    channel: CoefficientChannel,
    classifier: GatingClassifier,
    coordinator: ForwardCoordinator,
    slot_names: Vec<String>,
    expert_parameters: usize,
    dtype: DType,
    device: Device,
}

impl<B: ExpertBackbone> GatedModel<B> {
    /// Gate every adapter-bearing slot of `backbone` with a fresh classifier.
    ///
    /// Each slot must carry exactly `expert_names`, in that order. A backbone
    /// without adapter slots is accepted: the classifier then predicts over
    /// an empty layer axis.
    pub fn attach(
        mut backbone: B,
        expert_names: Vec<String>,
        config: GatingConfig,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if expert_names.is_empty() {
            return Err(GatingError::InvalidConfig(
                "gating needs at least one expert".into(),
            ));
        }
        if backbone.hidden_size() != config.hidden_size {
            return Err(GatingError::ShapeMismatch {
                what: "gating hidden_size",
                expected: backbone.hidden_size(),
                actual: config.hidden_size,
            });
        }

        // Check every slot before converting any.
        let mut slots = backbone.adapter_slots_mut();
        let mut expert_parameters = 0;
        for (name, slot) in &slots {
            let lora = match &**slot {
                AdapterLinear::Lora(lora) => lora,
                AdapterLinear::Frozen(_) => {
                    return Err(GatingError::InvalidConfig(format!(
                        "slot {name} carries no adapters"
                    )))
                }
                AdapterLinear::Gated(_) => {
                    return Err(GatingError::InvalidConfig(format!(
                        "slot {name} is already gated"
                    )))
                }
            };
            let names: Vec<&str> = lora.experts().iter().map(LoraExpert::name).collect();
            if names != expert_names {
                return Err(GatingError::InvalidConfig(format!(
                    "slot {name} carries experts {names:?}, expected {expert_names:?}"
                )));
            }
            expert_parameters += lora
                .experts()
                .iter()
                .map(LoraExpert::parameter_count)
                .sum::<usize>();
        }
        let mut slot_names = Vec::with_capacity(slots.len());
        for (layer_index, (name, slot)) in slots.iter_mut().enumerate() {
            slot.attach(layer_index, config.top_k_lora)?;
            slot_names.push(std::mem::take(name));
        }
        drop(slots);

        let n_layers = slot_names.len();
        let n_classes = expert_names.len();
        let classifier = GatingClassifier::new(config, expert_names, n_layers, dtype, device)?;
        let model = Self {
            backbone,
            channel: CoefficientChannel::new(),
            classifier,
            coordinator: ForwardCoordinator::new(n_layers, n_classes),
            slot_names,
            expert_parameters,
            dtype,
            device: device.clone(),
        };
        tracing::info!(
            n_layers,
            n_classes,
            experts = ?model.expert_names(),
            "attached gating: {}",
            model.parameter_report()
        );
        Ok(model)
    }

    /// Gated forward of one batch.
    pub fn forward(&self, input: &ModelInput) -> Result<ModelOutput> {
        self.forward_hooked(input, ForwardOptions::default())
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    /// Give the backbone back, keeping its slots gated.
    pub fn into_backbone(self) -> B {
        self.backbone
    }

    pub fn channel(&self) -> &CoefficientChannel {
        &self.channel
    }

    pub fn coordinator(&self) -> &ForwardCoordinator {
        &self.coordinator
    }

    pub fn classifier(&self) -> &GatingClassifier {
        &self.classifier
    }

    /// Names of the gated slots; position is the layer index.
    pub fn slot_names(&self) -> &[String] {
        &self.slot_names
    }

    pub fn n_layers(&self) -> usize {
        self.slot_names.len()
    }

    pub fn expert_names(&self) -> &[String] {
        self.classifier.expert_names()
    }

    pub fn set_training(&self, training: bool) {
        self.classifier.set_training(training);
    }

    pub fn set_print_predictions(&self, n: usize) {
        self.classifier.set_predictions_to_print(n);
    }

    pub fn enable_logging(&self) {
        self.classifier.set_logging(true);
    }

    pub fn disable_logging(&self) {
        self.classifier.set_logging(false);
    }

    pub fn flush_log(&self, path: &Path) -> Result<()> {
        self.classifier.flush_log(path)
    }

    pub fn save_classifier(&self, dir: &Path) -> Result<()> {
        self.classifier.save_pretrained(dir)
    }

    /// Replace the classifier by one saved with [`GatedModel::save_classifier`].
    ///
    /// The checkpoint must gate the same experts over the same number of
    /// layers. Its `top_k_lora` is applied to every gated slot.
    pub fn load_classifier(&mut self, dir: &Path) -> Result<()> {
        let classifier = GatingClassifier::from_pretrained(dir, self.dtype, &self.device)?;
        if classifier.n_layers() != self.n_layers() {
            return Err(GatingError::ShapeMismatch {
                what: "checkpoint layer count",
                expected: self.n_layers(),
                actual: classifier.n_layers(),
            });
        }
        if classifier.n_classes() != self.classifier.n_classes() {
            return Err(GatingError::ShapeMismatch {
                what: "checkpoint expert count",
                expected: self.classifier.n_classes(),
                actual: classifier.n_classes(),
            });
        }
        if classifier.expert_names() != self.expert_names() {
            return Err(GatingError::InvalidConfig(format!(
                "checkpoint gates experts {:?}, model has {:?}",
                classifier.expert_names(),
                self.expert_names()
            )));
        }
        if classifier.config().hidden_size != self.backbone.hidden_size() {
            return Err(GatingError::ShapeMismatch {
                what: "checkpoint hidden_size",
                expected: self.backbone.hidden_size(),
                actual: classifier.config().hidden_size,
            });
        }

        let top_k = classifier.config().top_k_lora;
        for (_, slot) in self.backbone.adapter_slots_mut() {
            if let Some(layer) = slot.as_gated_mut() {
                layer.set_top_k(top_k);
            }
        }
        self.classifier = classifier;
        Ok(())
    }

    pub fn parameter_report(&self) -> ParameterReport {
        let (classifier_trainable, classifier_total) = self.classifier.parameter_counts();
        ParameterReport {
            classifier_trainable,
            classifier_total,
            expert_parameters: self.expert_parameters,
            gated_layers: self.n_layers(),
        }
    }
}

impl<B: ExpertBackbone> HookedForward for GatedModel<B> {
    fn forward_hooked(&self, input: &ModelInput, options: ForwardOptions) -> Result<ModelOutput> {
        let pass = PassContext {
            channel: &self.channel,
            experts: options.experts,
            output_hidden_states: options.output_hidden_states,
        };

        // Shadow call from the classifier: neutral coefficients, no gating.
        if let Some(batch_size) = options.inhibitor {
            self.coordinator
                .inhibit(&self.channel, batch_size, self.dtype, &self.device)?;
            return self.backbone.forward(input, &pass);
        }

        let mut guard = self.coordinator.begin(&self.channel);
        let coefficients = self.classifier.compute(self, input)?;
        guard.publish(coefficients)?;
        guard.enter_real_pass();
        let output = self.backbone.forward(input, &pass)?;
        guard.finish();
        Ok(output)
    }
}
