//! Model runtime for component-based safety analysis.
//!
//! A model is a set of stateful objects (components and faults) whose entire
//! mutable state is declared through an explicit slot schema. The runtime
//! serializes that state into fixed-size byte vectors, enumerates every
//! resolution of a step's nondeterministic and probabilistic choices, and
//! exposes the result through the [`AnalysisModel`] boundary consumed by the
//! exploration engine.

pub mod choice;
pub mod component;
pub mod error;
pub mod fault;
pub mod formula;
pub mod layout;
pub mod object_table;
pub mod probability;
pub mod runtime;
pub mod slot;

pub use choice::ChoiceResolver;
pub use component::{Component, Stateful, StepContext};
pub use error::{ModelError, ModelResult};
pub use fault::{Activation, Fault, FaultId, FaultKind, FaultSet, MAX_FAULTS};
pub use formula::{FormulaSet, StateFormula, MAX_FORMULAS};
pub use layout::{SlotReader, SlotWriter, StateLayout};
pub use object_table::{ModelObject, ObjRef, ObjectTable};
pub use probability::Probability;
pub use runtime::{
    ActivationMode, AnalysisModel, RuntimeModel, RuntimeModelBuilder, Transition, WeightMode,
};
pub use slot::{OverflowPolicy, SchemaBuilder, SlotDescriptor, SlotKind};
