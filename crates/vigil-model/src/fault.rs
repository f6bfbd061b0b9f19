//! Faults: nondeterministic failure modes of components.
//!
//! A fault either occurs or stays dormant each time a component's behavior
//! queries it. Transient faults re-decide at every step; permanent faults
//! latch once occurred, and the latch is part of the serialized state.

use crate::component::Stateful;
use crate::error::ModelResult;
use crate::layout::{SlotReader, SlotWriter};
use crate::probability::Probability;
use crate::slot::SchemaBuilder;
use std::fmt;

/// Index of a fault within its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Activation is re-decided at every step.
    Transient,
    /// Once occurred, the fault stays occurred; the latch is serialized.
    Permanent,
}

/// How activation is resolved when the fault is queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Left to the exploration mode (branch, or occur at first opportunity).
    #[default]
    Nondeterministic,
    /// Always occurs. Used to force candidate faults in cut set analysis.
    Forced,
    /// Never occurs.
    Suppressed,
}

/// A named failure mode with optional occurrence probability.
pub struct Fault {
    name: String,
    kind: FaultKind,
    probability: Option<Probability>,
    activation: Activation,
    /// Latched occurrence (meaningful for permanent faults).
    occurred: bool,
    /// Decision taken for the step currently being executed.
    step_decision: Option<bool>,
}

impl Fault {
    pub fn transient(name: impl Into<String>) -> Self {
        Self::new(name, FaultKind::Transient)
    }

    pub fn permanent(name: impl Into<String>) -> Self {
        Self::new(name, FaultKind::Permanent)
    }

    fn new(name: impl Into<String>, kind: FaultKind) -> Self {
        Self {
            name: name.into(),
            kind,
            probability: None,
            activation: Activation::Nondeterministic,
            occurred: false,
            step_decision: None,
        }
    }

    pub fn with_probability(mut self, probability: Probability) -> Self {
        self.probability = Some(probability);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FaultKind {
        self.kind
    }

    pub fn probability(&self) -> Option<Probability> {
        self.probability
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Override how this fault resolves (forced / suppressed / free).
    pub fn set_activation(&mut self, activation: Activation) {
        self.activation = activation;
    }

    /// Whether the fault was activated in the step that just executed.
    /// Usable from state formulas.
    pub fn is_activated(&self) -> bool {
        self.step_decision == Some(true)
    }

    /// Whether the fault has ever occurred (latched for permanent faults).
    pub fn has_occurred(&self) -> bool {
        self.occurred
    }

    pub(crate) fn step_decision(&self) -> Option<bool> {
        self.step_decision
    }

    pub(crate) fn decide(&mut self, activate: bool) {
        self.step_decision = Some(activate);
        if activate {
            self.occurred = true;
        }
    }

    /// Clear the per-step decision before executing a step path.
    pub(crate) fn reset_step(&mut self) {
        self.step_decision = None;
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("activation", &self.activation)
            .field("occurred", &self.occurred)
            .finish()
    }
}

impl Stateful for Fault {
    fn type_name(&self) -> &'static str {
        "vigil_model::Fault"
    }

    fn schema(&self, b: &mut SchemaBuilder) {
        if self.kind == FaultKind::Permanent {
            b.bool_slot("occurred");
        }
    }

    fn encode(&self, w: &mut SlotWriter<'_>) -> ModelResult<()> {
        if self.kind == FaultKind::Permanent {
            w.write_bool(self.occurred)?;
        }
        Ok(())
    }

    fn decode(&mut self, r: &mut SlotReader<'_>) -> ModelResult<()> {
        if self.kind == FaultKind::Permanent {
            self.occurred = r.read_bool()?;
        } else {
            self.occurred = false;
        }
        Ok(())
    }
}

/// A set of faults, as a bitmask over fault indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FaultSet(u64);

/// Largest number of faults a [`FaultSet`] can hold.
pub const MAX_FAULTS: usize = 64;

impl FaultSet {
    pub const EMPTY: FaultSet = FaultSet(0);

    pub fn from_indices(indices: &[u16]) -> Self {
        let mut set = FaultSet::EMPTY;
        for &i in indices {
            set = set.with(FaultId(i));
        }
        set
    }

    #[must_use]
    pub fn with(self, fault: FaultId) -> Self {
        FaultSet(self.0 | 1u64 << fault.0)
    }

    pub fn contains(self, fault: FaultId) -> bool {
        self.0 & (1u64 << fault.0) != 0
    }

    pub fn is_superset_of(self, other: FaultSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn cardinality(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate over the member fault indices, ascending.
    pub fn iter(self) -> impl Iterator<Item = FaultId> {
        (0..MAX_FAULTS as u16)
            .map(FaultId)
            .filter(move |&i| self.contains(i))
    }
}

impl fmt::Display for FaultSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (n, id) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id.0)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_set_basics() {
        let set = FaultSet::from_indices(&[1, 3]);
        assert_eq!(set.cardinality(), 2);
        assert!(set.contains(FaultId(1)));
        assert!(set.contains(FaultId(3)));
        assert!(!set.contains(FaultId(0)));
        assert_eq!(set.to_string(), "{1, 3}");
    }

    #[test]
    fn test_superset() {
        let small = FaultSet::from_indices(&[1, 3]);
        let big = FaultSet::from_indices(&[1, 2, 3]);
        assert!(big.is_superset_of(small));
        assert!(!small.is_superset_of(big));
        assert!(small.is_superset_of(small));
        assert!(small.is_superset_of(FaultSet::EMPTY));
    }

    #[test]
    fn test_permanent_fault_latches() {
        let mut fault = Fault::permanent("k1");
        assert!(!fault.has_occurred());
        fault.decide(true);
        assert!(fault.is_activated());
        assert!(fault.has_occurred());
        fault.reset_step();
        assert!(!fault.is_activated());
        assert!(fault.has_occurred());
    }
}
