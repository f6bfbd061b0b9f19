//! Discrete-time Markov chain construction for quantitative hazard
//! analysis.
//!
//! The same breadth-first exploration as the invariant checker, but each
//! expanded state accumulates an outgoing probability distribution from
//! the model's branch weights. Branches reaching byte-identical targets
//! are merged, rows are validated to sum to 1 within a tolerance, and the
//! finished chain carries the per-state formula labels for a downstream
//! numerical solver.

use crate::explorer::{CheckConfig, InconclusiveReason};
use crate::state::SerializedState;
use crate::store::{StateIndex, StateStore, StoreError};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info};
use vigil_model::{AnalysisModel, FormulaSet};

/// Outgoing distribution of one state: `(target, probability)` pairs.
pub type Distribution = SmallVec<[(StateIndex, f64); 4]>;

#[derive(Debug, Error)]
pub enum MarkovError {
    /// A state's outgoing probabilities drifted beyond the hard bound;
    /// the model's weights are malformed.
    #[error("outgoing probabilities of {state} sum to {sum}, drift exceeds {bound}")]
    ProbabilityDrift {
        state: StateIndex,
        sum: f64,
        bound: f64,
    },

    #[error("initial distribution sums to {sum}, drift exceeds {bound}")]
    InitialDistributionDrift { sum: f64, bound: f64 },

    #[error("formula '{name}' was not registered when the chain was built")]
    UnregisteredFormula { name: String },

    #[error("markov chain construction aborted: {reason}")]
    Aborted { reason: InconclusiveReason },
}

/// Configuration of the chain builder.
#[derive(Debug, Clone)]
pub struct MarkovConfig {
    pub explore: CheckConfig,
    /// Row-sum drift accepted without correction.
    pub tolerance: f64,
    /// Row-sum drift corrected by renormalization; beyond it the build
    /// fails.
    pub max_drift: f64,
}

impl Default for MarkovConfig {
    fn default() -> Self {
        Self {
            explore: CheckConfig::default(),
            tolerance: 1e-9,
            max_drift: 1e-3,
        }
    }
}

/// A validated discrete-time Markov chain with state formula labels.
#[derive(Debug)]
pub struct MarkovChain {
    formula_names: Vec<String>,
    initial: Vec<(StateIndex, f64)>,
    rows: Vec<Distribution>,
    state_labels: Vec<FormulaSet>,
}

impl MarkovChain {
    pub fn state_count(&self) -> usize {
        self.rows.len()
    }

    pub fn transition_count(&self) -> usize {
        self.rows.iter().map(|r| r.len()).sum()
    }

    pub fn formula_names(&self) -> &[String] {
        &self.formula_names
    }

    pub fn formula_index(&self, name: &str) -> Option<usize> {
        self.formula_names.iter().position(|n| n == name)
    }

    /// The initial probability distribution.
    pub fn initial_distribution(&self) -> &[(StateIndex, f64)] {
        &self.initial
    }

    /// The outgoing distribution of `state`; empty for absorbing states.
    pub fn transitions_from(&self, state: StateIndex) -> &[(StateIndex, f64)] {
        &self.rows[state.to_row()]
    }

    pub fn labels_of(&self, state: StateIndex) -> FormulaSet {
        self.state_labels[state.to_row()]
    }

    /// Probability of reaching a state satisfying `formula` within
    /// `steps` steps from the initial distribution.
    ///
    /// Target states are made absorbing, then the distribution vector is
    /// propagated `steps` times.
    pub fn bounded_reachability(&self, formula: &str, steps: usize) -> Result<f64, MarkovError> {
        let bit = self
            .formula_index(formula)
            .ok_or_else(|| MarkovError::UnregisteredFormula {
                name: formula.to_string(),
            })?;

        let n = self.rows.len();
        let mut mass = vec![0.0f64; n];
        for &(index, p) in &self.initial {
            mass[index.to_row()] += p;
        }

        for _ in 0..steps {
            let mut next = vec![0.0f64; n];
            for (row, &m) in mass.iter().enumerate() {
                if m == 0.0 {
                    continue;
                }
                let index = StateIndex::from_row(row);
                if self.state_labels[row].contains(bit) || self.rows[row].is_empty() {
                    // Absorbing: target states by construction, other
                    // states because they have no outgoing distribution.
                    next[row] += m;
                    continue;
                }
                for &(target, p) in &self.rows[row] {
                    next[target.to_row()] += m * p;
                }
            }
            mass = next;
        }

        Ok(mass
            .iter()
            .enumerate()
            .filter(|(row, _)| self.state_labels[*row].contains(bit))
            .map(|(_, m)| m)
            .sum())
    }

    /// GraphViz rendering for inspection and documentation.
    pub fn to_graphviz(&self) -> String {
        let mut out = String::from("digraph chain {\n");
        for row in 0..self.rows.len() {
            let index = StateIndex::from_row(row);
            let labels: Vec<&str> = self
                .formula_names
                .iter()
                .enumerate()
                .filter(|(bit, _)| self.state_labels[row].contains(*bit))
                .map(|(_, name)| name.as_str())
                .collect();
            let _ = writeln!(out, "  {index} [label=\"{index} {{{}}}\"];", labels.join(", "));
        }
        let _ = writeln!(out, "  init [shape=point];");
        for &(target, p) in &self.initial {
            let _ = writeln!(out, "  init -> {target} [label=\"{p}\"];");
        }
        for (row, distribution) in self.rows.iter().enumerate() {
            let source = StateIndex::from_row(row);
            for &(target, p) in distribution {
                let _ = writeln!(out, "  {source} -> {target} [label=\"{p}\"];");
            }
        }
        out.push_str("}\n");
        out
    }
}

type QueueEntry = (StateIndex, SerializedState, u32);

enum BuildResult {
    Expanded {
        source: StateIndex,
        row: Distribution,
        entries: Vec<(QueueEntry, FormulaSet)>,
    },
    Capacity,
    Failure { message: String },
    Skipped,
}

/// Builds a [`MarkovChain`] from a probabilistically weighted model.
pub struct MarkovChainBuilder<F> {
    factory: F,
    config: MarkovConfig,
}

impl<M, F> MarkovChainBuilder<F>
where
    M: AnalysisModel,
    F: Fn() -> M + Sync,
{
    pub fn new(factory: F, config: MarkovConfig) -> Self {
        Self { factory, config }
    }

    pub fn build(&self) -> Result<MarkovChain, MarkovError> {
        let store = StateStore::with_capacity(self.config.explore.capacity);
        let mut model = (self.factory)();
        let formula_names = model.formula_names().to_vec();

        let mut frontier: VecDeque<QueueEntry> = VecDeque::new();
        let mut state_labels: Vec<FormulaSet> = Vec::new();
        let mut rows: Vec<Option<Distribution>> = Vec::new();
        let mut initial: Distribution = Distribution::new();

        let transitions = model
            .initial_transitions()
            .map_err(|e| MarkovError::Aborted {
                reason: InconclusiveReason::ModelFailure {
                    message: e.to_string(),
                },
            })?;
        for transition in transitions {
            let state = SerializedState::new(transition.target);
            match store.try_add(state.clone(), StateIndex::NONE, 0) {
                Ok((index, is_new)) => {
                    if is_new {
                        grow_to(&mut state_labels, &mut rows, index);
                        state_labels[index.to_row()] = transition.labels;
                        frontier.push_back((index, state, 0));
                    }
                    accumulate(&mut initial, index, transition.weight);
                }
                Err(StoreError::CapacityExceeded { .. }) => {
                    return Err(aborted_capacity(&store));
                }
            }
        }

        if self.config.explore.parallel {
            self.build_parallel(&store, &mut frontier, &mut state_labels, &mut rows)?;
        } else {
            self.build_sequential(&mut model, &store, &mut frontier, &mut state_labels, &mut rows)?;
        }

        let initial = self.validate(initial, None)?;
        let mut validated_rows = Vec::with_capacity(rows.len());
        for (row, distribution) in rows.into_iter().enumerate() {
            let distribution = distribution.unwrap_or_default();
            let index = StateIndex::from_row(row);
            validated_rows.push(self.validate(distribution, Some(index))?);
        }

        info!(
            states = validated_rows.len(),
            transitions = validated_rows.iter().map(|r: &Distribution| r.len()).sum::<usize>(),
            "markov chain built"
        );
        Ok(MarkovChain {
            formula_names,
            initial: initial.into_vec(),
            rows: validated_rows,
            state_labels,
        })
    }

    /// Enforce the probability conservation invariant on one distribution.
    ///
    /// Empty distributions are absorbing states and pass unchanged.
    fn validate(
        &self,
        mut distribution: Distribution,
        state: Option<StateIndex>,
    ) -> Result<Distribution, MarkovError> {
        if distribution.is_empty() {
            return Ok(distribution);
        }
        let sum: f64 = distribution.iter().map(|(_, p)| p).sum();
        let drift = (sum - 1.0).abs();
        if drift <= self.config.tolerance {
            return Ok(distribution);
        }
        if drift > self.config.max_drift {
            return Err(match state {
                Some(state) => MarkovError::ProbabilityDrift {
                    state,
                    sum,
                    bound: self.config.max_drift,
                },
                None => MarkovError::InitialDistributionDrift {
                    sum,
                    bound: self.config.max_drift,
                },
            });
        }
        // Rounding drift within the correctable band: renormalize.
        for (_, p) in distribution.iter_mut() {
            *p /= sum;
        }
        Ok(distribution)
    }

    fn build_sequential(
        &self,
        model: &mut M,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
        state_labels: &mut Vec<FormulaSet>,
        rows: &mut Vec<Option<Distribution>>,
    ) -> Result<(), MarkovError> {
        let stop = AtomicBool::new(false);
        while let Some((index, state, depth)) = frontier.pop_front() {
            if self.external_stop() {
                return Err(MarkovError::Aborted {
                    reason: InconclusiveReason::Cancelled,
                });
            }
            match self.expand(model, store, &stop, index, &state, depth) {
                BuildResult::Expanded {
                    source,
                    row,
                    entries,
                } => commit(source, row, entries, frontier, state_labels, rows),
                BuildResult::Capacity => return Err(aborted_capacity(store)),
                BuildResult::Failure { message } => {
                    return Err(MarkovError::Aborted {
                        reason: InconclusiveReason::ModelFailure { message },
                    })
                }
                BuildResult::Skipped => unreachable!("no concurrent stop in sequential build"),
            }
        }
        Ok(())
    }

    fn build_parallel(
        &self,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
        state_labels: &mut Vec<FormulaSet>,
        rows: &mut Vec<Option<Distribution>>,
    ) -> Result<(), MarkovError> {
        let stop = AtomicBool::new(false);
        let batch_size = rayon::current_num_threads().max(1) * 256;

        while !frontier.is_empty() {
            if self.external_stop() {
                return Err(MarkovError::Aborted {
                    reason: InconclusiveReason::Cancelled,
                });
            }
            let batch: Vec<QueueEntry> = frontier.drain(..frontier.len().min(batch_size)).collect();

            let results: Vec<BuildResult> = batch
                .par_iter()
                .map_init(
                    || (self.factory)(),
                    |model, (index, state, depth)| {
                        self.expand(model, store, &stop, *index, state, *depth)
                    },
                )
                .collect();

            let mut fatal: Option<MarkovError> = None;
            for result in results {
                match result {
                    BuildResult::Expanded {
                        source,
                        row,
                        entries,
                    } => commit(source, row, entries, frontier, state_labels, rows),
                    BuildResult::Capacity => {
                        fatal.get_or_insert_with(|| aborted_capacity(store));
                    }
                    BuildResult::Failure { message } => {
                        fatal.get_or_insert(MarkovError::Aborted {
                            reason: InconclusiveReason::ModelFailure { message },
                        });
                    }
                    BuildResult::Skipped => {}
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }
        }
        Ok(())
    }

    fn external_stop(&self) -> bool {
        self.config
            .explore
            .stop_flag
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn expand(
        &self,
        model: &mut M,
        store: &StateStore,
        stop: &AtomicBool,
        index: StateIndex,
        state: &SerializedState,
        depth: u32,
    ) -> BuildResult {
        if stop.load(Ordering::Relaxed) {
            return BuildResult::Skipped;
        }
        let successors = match model.successors(state.bytes()) {
            Ok(s) => s,
            Err(e) => {
                stop.store(true, Ordering::Relaxed);
                error!(error = %e, "model failure during chain construction");
                return BuildResult::Failure {
                    message: e.to_string(),
                };
            }
        };

        let mut row = Distribution::new();
        let mut entries = Vec::new();
        for transition in successors {
            let target = SerializedState::new(transition.target);
            match store.try_add(target.clone(), index, depth + 1) {
                Ok((target_index, is_new)) => {
                    // Different branches reaching the same target state
                    // contribute to one matrix entry.
                    accumulate(&mut row, target_index, transition.weight);
                    if is_new {
                        entries.push(((target_index, target, depth + 1), transition.labels));
                    }
                }
                Err(StoreError::CapacityExceeded { .. }) => {
                    stop.store(true, Ordering::Relaxed);
                    return BuildResult::Capacity;
                }
            }
        }
        BuildResult::Expanded {
            source: index,
            row,
            entries,
        }
    }
}

fn accumulate(distribution: &mut Distribution, target: StateIndex, weight: f64) {
    match distribution.iter_mut().find(|(t, _)| *t == target) {
        Some((_, p)) => *p += weight,
        None => distribution.push((target, weight)),
    }
}

fn grow_to(
    state_labels: &mut Vec<FormulaSet>,
    rows: &mut Vec<Option<Distribution>>,
    index: StateIndex,
) {
    let needed = index.to_row() + 1;
    if state_labels.len() < needed {
        state_labels.resize(needed, FormulaSet::EMPTY);
        rows.resize(needed, None);
    }
}

fn commit(
    source: StateIndex,
    row: Distribution,
    entries: Vec<(QueueEntry, FormulaSet)>,
    frontier: &mut VecDeque<QueueEntry>,
    state_labels: &mut Vec<FormulaSet>,
    rows: &mut Vec<Option<Distribution>>,
) {
    grow_to(state_labels, rows, source);
    for (entry, labels) in entries {
        grow_to(state_labels, rows, entry.0);
        state_labels[entry.0.to_row()] = labels;
        frontier.push_back(entry);
    }
    rows[source.to_row()] = Some(row);
}

fn aborted_capacity(store: &StateStore) -> MarkovError {
    MarkovError::Aborted {
        reason: InconclusiveReason::CapacityExceeded {
            states: store.len(),
        },
    }
}
