//! State graph construction: exploration that retains every transition.
//!
//! The discovered graph can answer any number of later invariant checks
//! without re-invoking the model, provided the formula's satisfaction bits
//! were computed during the build. Checking a formula that was not
//! registered then is a usage error, rejected rather than silently wrong.

use crate::explorer::{CheckConfig, InconclusiveReason};
use crate::state::SerializedState;
use crate::store::{StateIndex, StateStore, StoreError};
use rayon::prelude::*;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info};
use vigil_model::{AnalysisModel, FormulaSet};

/// One outgoing edge of a graph state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphEdge {
    pub target: StateIndex,
    pub weight: f64,
    /// Satisfaction bits of the target state.
    pub labels: FormulaSet,
}

type Row = SmallVec<[GraphEdge; 4]>;

/// Error of graph construction or graph-based checking.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The formula's bits were not computed when the graph was built.
    #[error("formula '{name}' was not registered when the graph was built")]
    UnregisteredFormula { name: String },

    #[error("state graph construction aborted: {reason}")]
    Aborted { reason: InconclusiveReason },
}

/// Result of checking an invariant against a prebuilt graph.
#[derive(Debug)]
pub enum GraphOutcome {
    Holds,
    Violated {
        formula: String,
        /// State indices from an initial state to the violating state.
        path: Vec<StateIndex>,
    },
}

/// An immutable, fully explored state graph.
#[derive(Debug)]
pub struct StateGraph {
    formula_names: Vec<String>,
    /// Initial states with accumulated weights.
    initial: Vec<(StateIndex, f64)>,
    state_labels: Vec<FormulaSet>,
    rows: Vec<Row>,
    transition_count: usize,
}

impl StateGraph {
    pub fn state_count(&self) -> usize {
        self.state_labels.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transition_count
    }

    pub fn formula_names(&self) -> &[String] {
        &self.formula_names
    }

    pub fn initial_states(&self) -> &[(StateIndex, f64)] {
        &self.initial
    }

    pub fn successors(&self, state: StateIndex) -> &[GraphEdge] {
        &self.rows[state.to_row()]
    }

    pub fn labels_of(&self, state: StateIndex) -> FormulaSet {
        self.state_labels[state.to_row()]
    }

    /// Check that a formula registered during the build holds in every
    /// state, without re-invoking the model.
    pub fn check_invariant(&self, formula: &str) -> Result<GraphOutcome, GraphError> {
        let bit = self
            .formula_names
            .iter()
            .position(|n| n == formula)
            .ok_or_else(|| GraphError::UnregisteredFormula {
                name: formula.to_string(),
            })?;

        // Breadth-first walk over the retained edges, recording parents so
        // a violation can be reported with its path.
        let mut parents: HashMap<StateIndex, StateIndex> = HashMap::new();
        let mut queue: VecDeque<StateIndex> = VecDeque::new();
        for &(index, _) in &self.initial {
            if parents.contains_key(&index) {
                continue;
            }
            parents.insert(index, StateIndex::NONE);
            if !self.labels_of(index).contains(bit) {
                return Ok(self.violated(bit, index, &parents));
            }
            queue.push_back(index);
        }

        while let Some(index) = queue.pop_front() {
            for edge in self.successors(index) {
                if parents.contains_key(&edge.target) {
                    continue;
                }
                parents.insert(edge.target, index);
                if !edge.labels.contains(bit) {
                    return Ok(self.violated(bit, edge.target, &parents));
                }
                queue.push_back(edge.target);
            }
        }
        Ok(GraphOutcome::Holds)
    }

    fn violated(
        &self,
        bit: usize,
        index: StateIndex,
        parents: &HashMap<StateIndex, StateIndex>,
    ) -> GraphOutcome {
        let mut path = vec![index];
        let mut current = index;
        while let Some(&parent) = parents.get(&current) {
            if parent.is_none() {
                break;
            }
            path.push(parent);
            current = parent;
        }
        path.reverse();
        GraphOutcome::Violated {
            formula: self.formula_names[bit].clone(),
            path,
        }
    }
}

/// Frontier entry during the build.
type QueueEntry = (StateIndex, SerializedState, u32);

enum BuildResult {
    Expanded {
        source: StateIndex,
        row: Row,
        /// Newly discovered states with their labels.
        entries: Vec<(QueueEntry, FormulaSet)>,
    },
    Capacity,
    Failure {
        message: String,
    },
    Skipped,
}

/// Builds a [`StateGraph`] by exhaustive exploration.
pub struct StateGraphBuilder<F> {
    factory: F,
    config: CheckConfig,
}

impl<M, F> StateGraphBuilder<F>
where
    M: AnalysisModel,
    F: Fn() -> M + Sync,
{
    pub fn new(factory: F, config: CheckConfig) -> Self {
        Self { factory, config }
    }

    pub fn build(&self) -> Result<StateGraph, GraphError> {
        let store = StateStore::with_capacity(self.config.capacity);
        let mut model = (self.factory)();
        let formula_names = model.formula_names().to_vec();

        let mut frontier: VecDeque<QueueEntry> = VecDeque::new();
        let mut state_labels: Vec<FormulaSet> = Vec::new();
        let mut rows: Vec<Option<Row>> = Vec::new();
        let mut initial: Vec<(StateIndex, f64)> = Vec::new();

        let transitions = model
            .initial_transitions()
            .map_err(|e| GraphError::Aborted {
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
                    match initial.iter_mut().find(|(i, _)| *i == index) {
                        Some((_, w)) => *w += transition.weight,
                        None => initial.push((index, transition.weight)),
                    }
                }
                Err(StoreError::CapacityExceeded { .. }) => {
                    return Err(aborted_capacity(&store));
                }
            }
        }

        if self.config.parallel {
            self.build_parallel(&store, &mut frontier, &mut state_labels, &mut rows)?;
        } else {
            self.build_sequential(&mut model, &store, &mut frontier, &mut state_labels, &mut rows)?;
        }

        let rows: Vec<Row> = rows.into_iter().map(Option::unwrap_or_default).collect();
        let transition_count = rows.iter().map(|r| r.len()).sum();
        info!(
            states = state_labels.len(),
            transitions = transition_count,
            "state graph built"
        );
        Ok(StateGraph {
            formula_names,
            initial,
            state_labels,
            rows,
            transition_count,
        })
    }

    fn build_sequential(
        &self,
        model: &mut M,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
        state_labels: &mut Vec<FormulaSet>,
        rows: &mut Vec<Option<Row>>,
    ) -> Result<(), GraphError> {
        let stop = AtomicBool::new(false);
        while let Some((index, state, depth)) = frontier.pop_front() {
            if self.external_stop() {
                return Err(GraphError::Aborted {
                    reason: InconclusiveReason::Cancelled,
                });
            }
            match self.expand(model, store, &stop, index, &state, depth) {
                BuildResult::Expanded {
                    source,
                    row,
                    entries,
                } => {
                    commit(source, row, entries, frontier, state_labels, rows);
                }
                BuildResult::Capacity => return Err(aborted_capacity(store)),
                BuildResult::Failure { message } => {
                    return Err(GraphError::Aborted {
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
        rows: &mut Vec<Option<Row>>,
    ) -> Result<(), GraphError> {
        let stop = AtomicBool::new(false);
        let batch_size = rayon::current_num_threads().max(1) * 256;

        while !frontier.is_empty() {
            if self.external_stop() {
                return Err(GraphError::Aborted {
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

            let mut fatal: Option<GraphError> = None;
            for result in results {
                match result {
                    BuildResult::Expanded {
                        source,
                        row,
                        entries,
                    } => {
                        commit(source, row, entries, frontier, state_labels, rows);
                    }
                    BuildResult::Capacity => {
                        fatal.get_or_insert_with(|| aborted_capacity(store));
                    }
                    BuildResult::Failure { message } => {
                        fatal.get_or_insert(GraphError::Aborted {
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
                error!(error = %e, "model failure during graph construction");
                return BuildResult::Failure {
                    message: e.to_string(),
                };
            }
        };

        let mut row = Row::new();
        let mut entries = Vec::new();
        for transition in successors {
            let target = SerializedState::new(transition.target);
            match store.try_add(target.clone(), index, depth + 1) {
                Ok((target_index, is_new)) => {
                    row.push(GraphEdge {
                        target: target_index,
                        weight: transition.weight,
                        labels: transition.labels,
                    });
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

fn grow_to(state_labels: &mut Vec<FormulaSet>, rows: &mut Vec<Option<Row>>, index: StateIndex) {
    let needed = index.to_row() + 1;
    if state_labels.len() < needed {
        state_labels.resize(needed, FormulaSet::EMPTY);
        rows.resize(needed, None);
    }
}

fn commit(
    source: StateIndex,
    row: Row,
    entries: Vec<(QueueEntry, FormulaSet)>,
    frontier: &mut VecDeque<QueueEntry>,
    state_labels: &mut Vec<FormulaSet>,
    rows: &mut Vec<Option<Row>>,
) {
    grow_to(state_labels, rows, source);
    for (entry, labels) in entries {
        grow_to(state_labels, rows, entry.0);
        state_labels[entry.0.to_row()] = labels;
        frontier.push_back(entry);
    }
    rows[source.to_row()] = Some(row);
}

fn aborted_capacity(store: &StateStore) -> GraphError {
    GraphError::Aborted {
        reason: InconclusiveReason::CapacityExceeded {
            states: store.len(),
        },
    }
}
