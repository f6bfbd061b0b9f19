//! Component traits and the per-step execution context.

use crate::choice::ChoiceResolver;
use crate::error::{ModelError, ModelResult};
use crate::fault::{Activation, Fault, FaultId, FaultKind};
use crate::layout::{SlotReader, SlotWriter};
use crate::probability::Probability;
use crate::runtime::{ActivationMode, WeightMode};
use crate::slot::SchemaBuilder;
use std::cell::RefCell;
use std::rc::Rc;

use crate::object_table::ModelObject;

/// An object whose mutable state is part of the state vector.
///
/// The schema, `encode` and `decode` must agree on slot order; mismatches
/// are detected and reported as usage errors.
pub trait Stateful {
    /// Stable type name used to order the object table deterministically.
    fn type_name(&self) -> &'static str;

    /// Declare the serialized slots, in order.
    fn schema(&self, schema: &mut SchemaBuilder);

    /// Write the current values, one call per declared slot.
    fn encode(&self, w: &mut SlotWriter<'_>) -> ModelResult<()>;

    /// Restore values from a serialized state, one call per declared slot.
    fn decode(&mut self, r: &mut SlotReader<'_>) -> ModelResult<()>;

    /// Other stateful objects this object keeps alive; followed when the
    /// object table is built.
    fn references(&self) -> Vec<ModelObject> {
        Vec::new()
    }
}

/// A component: stateful object with a behavior executed once per step.
///
/// Fault effects are explicit branches on [`StepContext::fault_activated`]
/// inside `update`, composed in a fixed order, rather than subclass
/// overrides.
pub trait Component: Stateful {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> ModelResult<()>;
}

/// Execution context of one step path: resolves fault activations and
/// nondeterministic/probabilistic choices.
pub struct StepContext<'a> {
    pub(crate) faults: &'a [Rc<RefCell<Fault>>],
    pub(crate) resolver: &'a mut ChoiceResolver,
    pub(crate) activation_mode: ActivationMode,
    pub(crate) weighting: WeightMode,
}

impl StepContext<'_> {
    /// Whether `fault` is activated in the current step.
    ///
    /// The first query per step resolves the activation: forced and
    /// suppressed overrides pin it, a latched permanent fault stays
    /// occurred, and an undetermined fault either branches (full mode,
    /// probabilistic analysis) or occurs at its first opportunity
    /// (activation-minimal mode). Later queries within the same step see
    /// the same decision.
    pub fn fault_activated(&mut self, fault: FaultId) -> ModelResult<bool> {
        let cell = &self.faults[fault.0 as usize];
        let mut f = cell.borrow_mut();

        match f.activation() {
            Activation::Forced => {
                f.decide(true);
                return Ok(true);
            }
            Activation::Suppressed => {
                f.decide(false);
                return Ok(false);
            }
            Activation::Nondeterministic => {}
        }

        if let Some(decision) = f.step_decision() {
            return Ok(decision);
        }
        if f.kind() == FaultKind::Permanent && f.has_occurred() {
            f.decide(true);
            return Ok(true);
        }

        let activate = match self.weighting {
            WeightMode::Probability => {
                let p = f.probability().ok_or_else(|| {
                    ModelError::MissingActivationProbability {
                        fault: f.name().to_string(),
                    }
                })?;
                self.resolver
                    .choose_weighted(&[p.get(), p.complement().get()])
                    == 0
            }
            WeightMode::Multiplicity => match self.activation_mode {
                ActivationMode::ActivationMinimal => true,
                ActivationMode::Full => self.resolver.choose(2) == 0,
            },
        };
        f.decide(activate);
        Ok(activate)
    }

    /// Nondeterministic choice among `options` alternatives.
    pub fn choose(&mut self, options: usize) -> ModelResult<usize> {
        if options == 0 {
            return Err(ModelError::EmptyChoice);
        }
        Ok(self.resolver.choose(options))
    }

    /// Probabilistic choice; the option probabilities must sum to 1.
    ///
    /// During qualitative analysis the branches are explored with
    /// multiplicity 1 each; during probabilistic analysis the path weight
    /// picks up the chosen option's probability.
    pub fn choose_probability(&mut self, options: &[Probability]) -> ModelResult<usize> {
        if options.is_empty() {
            return Err(ModelError::EmptyChoice);
        }
        let sum: f64 = options.iter().map(|p| p.get()).sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ModelError::MalformedDistribution { sum });
        }
        match self.weighting {
            WeightMode::Probability => {
                let weights: Vec<f64> = options.iter().map(|p| p.get()).collect();
                Ok(self.resolver.choose_weighted(&weights))
            }
            WeightMode::Multiplicity => Ok(self.resolver.choose(options.len())),
        }
    }

    /// Probabilistic boolean choice: `true` with probability `p`.
    pub fn choose_bool(&mut self, p: Probability) -> ModelResult<bool> {
        Ok(self.choose_probability(&[p, p.complement()])? == 0)
    }
}
