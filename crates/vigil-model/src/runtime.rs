//! Executable model: components + faults + formulas behind the
//! [`AnalysisModel`] boundary consumed by the exploration engine.

use crate::choice::ChoiceResolver;
use crate::component::{Component, StepContext};
use crate::error::{ModelError, ModelResult};
use crate::fault::{Activation, Fault, FaultId, FaultSet, MAX_FAULTS};
use crate::formula::{FormulaSet, StateFormula, MAX_FORMULAS};
use crate::layout::StateLayout;
use crate::object_table::{ModelObject, ObjectTable};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// How undetermined fault activations are scheduled during qualitative
/// exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationMode {
    /// Every undetermined fault is a nondeterministic branch.
    Full,
    /// An undetermined, unsuppressed fault occurs at its first opportunity,
    /// collapsing independent activation combinatorics into one
    /// representative branch.
    ///
    /// Sound only for properties insensitive to fault ordering and to a
    /// fault's non-occurrence; use [`ActivationMode::Full`] otherwise.
    #[default]
    ActivationMinimal,
}

/// How transition weights are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightMode {
    /// Weights are occurrence multiplicities (qualitative search).
    #[default]
    Multiplicity,
    /// Weights are probability mass; fault activations always branch with
    /// their occurrence probability.
    Probability,
}

/// One outgoing branch of a model step.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Multiplicity or probability mass, per [`WeightMode`].
    pub weight: f64,
    /// Serialized successor state.
    pub target: Box<[u8]>,
    /// Satisfaction bits of all registered formulas in the target state.
    pub labels: FormulaSet,
}

/// The boundary between a user model and the exploration engine.
///
/// Implementations must be deterministic: given the same byte-for-byte
/// input state, repeated calls yield the same transitions.
pub trait AnalysisModel {
    /// Fixed size of every serialized state.
    fn state_len(&self) -> usize;

    /// Names of the registered formulas, in label-bit order.
    fn formula_names(&self) -> &[String];

    /// The weighted initial states.
    fn initial_transitions(&mut self) -> ModelResult<Vec<Transition>>;

    /// All successor states reachable from `state` in one step.
    fn successors(&mut self, state: &[u8]) -> ModelResult<Vec<Transition>>;
}

type Initializer = Box<dyn Fn(&mut StepContext<'_>) -> ModelResult<()>>;

/// Builds a [`RuntimeModel`] from components, faults and formulas.
///
/// Registration order is execution order for components and label-bit
/// order for formulas.
#[derive(Default)]
pub struct RuntimeModelBuilder {
    components: Vec<Rc<RefCell<dyn Component>>>,
    faults: Vec<Rc<RefCell<Fault>>>,
    formulas: Vec<StateFormula>,
    objects: Vec<ModelObject>,
    activation: ActivationMode,
    weighting: WeightMode,
    successor_capacity: usize,
    initializer: Option<Initializer>,
}

impl RuntimeModelBuilder {
    pub fn new() -> Self {
        Self {
            successor_capacity: 1 << 16,
            ..Self::default()
        }
    }

    /// Register a component; returns the shared handle for wiring and
    /// formulas.
    pub fn add_component<C: Component + 'static>(&mut self, component: C) -> Rc<RefCell<C>> {
        let handle = Rc::new(RefCell::new(component));
        self.components.push(handle.clone());
        self.objects.push(handle.clone());
        handle
    }

    /// Register a fault; returns its identifier and shared handle.
    pub fn add_fault(&mut self, fault: Fault) -> (FaultId, Rc<RefCell<Fault>>) {
        let id = FaultId(self.faults.len() as u16);
        let handle = Rc::new(RefCell::new(fault));
        self.faults.push(handle.clone());
        self.objects.push(handle.clone());
        (id, handle)
    }

    /// Register a state formula; its label bit is the registration index.
    pub fn add_formula(&mut self, formula: StateFormula) -> usize {
        self.formulas.push(formula);
        self.formulas.len() - 1
    }

    /// Initialization behavior executed to produce the initial states;
    /// may use choices, producing several weighted initial states.
    pub fn initializer(
        &mut self,
        init: impl Fn(&mut StepContext<'_>) -> ModelResult<()> + 'static,
    ) -> &mut Self {
        self.initializer = Some(Box::new(init));
        self
    }

    pub fn activation_mode(&mut self, mode: ActivationMode) -> &mut Self {
        self.activation = mode;
        self
    }

    pub fn weighting(&mut self, mode: WeightMode) -> &mut Self {
        self.weighting = mode;
        self
    }

    /// Upper bound on branches produced from one source state.
    pub fn successor_capacity(&mut self, capacity: usize) -> &mut Self {
        self.successor_capacity = capacity;
        self
    }

    pub fn build(self) -> ModelResult<RuntimeModel> {
        if self.formulas.len() > MAX_FORMULAS {
            return Err(ModelError::TooManyFormulas {
                count: self.formulas.len(),
                max: MAX_FORMULAS,
            });
        }
        if self.faults.len() > MAX_FAULTS {
            return Err(ModelError::TooManyFaults {
                count: self.faults.len(),
                max: MAX_FAULTS,
            });
        }

        let table = ObjectTable::build(&self.objects);
        let layout = StateLayout::build(&table)?;
        let baseline = layout.encode(&table)?;
        let formula_names = self.formulas.iter().map(|f| f.name().to_string()).collect();

        debug!(
            components = self.components.len(),
            faults = self.faults.len(),
            formulas = self.formulas.len(),
            state_bytes = layout.state_len(),
            "runtime model built"
        );

        Ok(RuntimeModel {
            components: self.components,
            faults: self.faults,
            formulas: self.formulas,
            formula_names,
            table,
            layout,
            activation: self.activation,
            weighting: self.weighting,
            successor_capacity: self.successor_capacity,
            initializer: self.initializer,
            resolver: ChoiceResolver::new(),
            baseline,
        })
    }
}

/// An executable model over live component objects.
///
/// Not thread-safe; parallel exploration uses one instance per worker,
/// created from a factory closure.
pub struct RuntimeModel {
    components: Vec<Rc<RefCell<dyn Component>>>,
    faults: Vec<Rc<RefCell<Fault>>>,
    formulas: Vec<StateFormula>,
    formula_names: Vec<String>,
    table: ObjectTable,
    layout: StateLayout,
    activation: ActivationMode,
    weighting: WeightMode,
    successor_capacity: usize,
    initializer: Option<Initializer>,
    resolver: ChoiceResolver,
    baseline: Vec<u8>,
}

impl RuntimeModel {
    /// The object table backing reference slots.
    pub fn table(&self) -> &ObjectTable {
        &self.table
    }

    pub fn fault_count(&self) -> usize {
        self.faults.len()
    }

    pub fn fault_name(&self, id: FaultId) -> String {
        self.faults[id.0 as usize].borrow().name().to_string()
    }

    /// Override the activation of a single fault.
    pub fn set_fault_activation(&mut self, id: FaultId, activation: Activation) {
        self.faults[id.0 as usize]
            .borrow_mut()
            .set_activation(activation);
    }

    /// Force every fault in `forced` to occur and suppress all others.
    /// Used by cut set analysis.
    pub fn constrain_faults(&mut self, forced: FaultSet) {
        for i in 0..self.faults.len() {
            let id = FaultId(i as u16);
            let activation = if forced.contains(id) {
                Activation::Forced
            } else {
                Activation::Suppressed
            };
            self.set_fault_activation(id, activation);
        }
    }

    fn eval_formulas(&self) -> FormulaSet {
        let mut labels = FormulaSet::EMPTY;
        for (i, formula) in self.formulas.iter().enumerate() {
            if formula.eval() {
                labels = labels.with(i);
            }
        }
        labels
    }

    /// Enumerate all resolution paths of one step from `source`.
    ///
    /// `run_updates` distinguishes a regular step (component updates) from
    /// initial-state construction (initializer only).
    fn run_paths(&mut self, source: &[u8], run_updates: bool) -> ModelResult<Vec<Transition>> {
        let mut out = Vec::new();
        self.resolver.reset();

        loop {
            self.resolver.begin_path();
            self.layout.decode(&self.table, source)?;
            for fault in &self.faults {
                fault.borrow_mut().reset_step();
            }

            {
                let mut ctx = StepContext {
                    faults: &self.faults,
                    resolver: &mut self.resolver,
                    activation_mode: self.activation,
                    weighting: self.weighting,
                };
                if run_updates {
                    for component in &self.components {
                        component.borrow_mut().update(&mut ctx)?;
                    }
                } else if let Some(init) = &self.initializer {
                    init(&mut ctx)?;
                }
            }

            let labels = self.eval_formulas();
            let target = self.layout.encode(&self.table)?.into_boxed_slice();
            if out.len() >= self.successor_capacity {
                return Err(ModelError::SuccessorCapacityExceeded {
                    capacity: self.successor_capacity,
                });
            }
            out.push(Transition {
                weight: self.resolver.path_weight(),
                target,
                labels,
            });

            if !self.resolver.advance() {
                return Ok(out);
            }
        }
    }
}

impl AnalysisModel for RuntimeModel {
    fn state_len(&self) -> usize {
        self.layout.state_len()
    }

    fn formula_names(&self) -> &[String] {
        &self.formula_names
    }

    fn initial_transitions(&mut self) -> ModelResult<Vec<Transition>> {
        let baseline = self.baseline.clone();
        self.run_paths(&baseline, false)
    }

    fn successors(&mut self, state: &[u8]) -> ModelResult<Vec<Transition>> {
        self.run_paths(state, true)
    }
}
