//! Parallel breadth-first invariant checker.
//!
//! A shared frontier of unexpanded states is drained in batches; workers
//! generate successors through their own model instance and deduplicate
//! them in the shared store. Only the worker that first inserts a state
//! enqueues it, so each distinct state is expanded exactly once regardless
//! of worker count.

use crate::state::SerializedState;
use crate::store::{StateIndex, StateStore, StoreError, Trace};
use memory_stats::memory_stats;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, trace};
use vigil_model::{AnalysisModel, ModelError};

/// Returns current process memory usage in MB, or None if unavailable.
fn current_memory_mb() -> Option<usize> {
    memory_stats().map(|stats| stats.physical_mem / (1024 * 1024))
}

/// Usage error of the checker API.
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("formula index {index} out of range ({count} formulas registered)")]
    UnknownFormula { index: usize, count: usize },
}

/// Why a run ended without a verdict. Never conflated with "holds".
#[derive(Debug, Clone)]
pub enum InconclusiveReason {
    /// The state store capacity was exhausted.
    CapacityExceeded { states: usize },
    /// The process memory limit was reached.
    MemoryLimitReached { memory_mb: usize, states: usize },
    /// The model failed while generating transitions; partial results
    /// cannot be trusted.
    ModelFailure { message: String },
    /// An external stop was requested.
    Cancelled,
}

impl fmt::Display for InconclusiveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconclusiveReason::CapacityExceeded { states } => {
                write!(f, "state capacity exceeded after {states} states")
            }
            InconclusiveReason::MemoryLimitReached { memory_mb, states } => {
                write!(f, "memory limit reached at {memory_mb} MB after {states} states")
            }
            InconclusiveReason::ModelFailure { message } => {
                write!(f, "model failure: {message}")
            }
            InconclusiveReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of an invariant check.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The formula holds in every reachable state.
    Holds { states: usize, depth: usize },
    /// A reachable state falsifies the formula.
    Violated { formula: String, trace: Trace },
    /// The run was aborted; nothing can be concluded.
    Inconclusive { reason: InconclusiveReason },
}

/// Lock-free progress counters shared between the explorer and a
/// caller-side progress display. The explorer only ever writes them.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub states: AtomicUsize,
    pub depth: AtomicUsize,
    pub queue_len: AtomicUsize,
    /// States popped from the frontier and fully expanded.
    pub checked: AtomicUsize,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Configuration for one exploration run.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Use the parallel frontier loop.
    pub parallel: bool,
    /// Worker threads (0 = all available).
    pub workers: usize,
    /// Maximum number of distinct states (store capacity).
    pub capacity: usize,
    /// Maximum process memory in MB (0 = unlimited).
    pub memory_limit_mb: usize,
    /// Counters polled by the caller; never blocks the exploration.
    pub progress: Option<Arc<ProgressCounters>>,
    /// Cooperative cancellation, checked between state expansions.
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            workers: 0,
            capacity: 1 << 22,
            memory_limit_mb: 0,
            progress: None,
            stop_flag: None,
        }
    }
}

/// Frontier entry: (index, state, depth).
type QueueEntry = (StateIndex, SerializedState, u32);

/// Result of expanding one state in a worker.
enum ExpandResult {
    /// Successors inserted; the new ones and the deepest depth reached.
    NewStates {
        entries: Vec<QueueEntry>,
        max_depth: u32,
    },
    /// The formula is false in a newly discovered state.
    Violation { index: StateIndex },
    /// The store refused the insert.
    Capacity,
    /// The model failed during successor generation.
    Failure { message: String },
    /// Skipped because another worker already found a violation.
    Skipped,
}

/// Breadth-first invariant checker over an [`AnalysisModel`] family.
///
/// The factory is invoked once per worker thread; model instances never
/// cross threads.
pub struct Explorer<F> {
    factory: F,
    config: CheckConfig,
    formula_names: Vec<String>,
}

impl<M, F> Explorer<F>
where
    M: AnalysisModel,
    F: Fn() -> M + Sync,
{
    pub fn new(factory: F, config: CheckConfig) -> Self {
        let probe = factory();
        let formula_names = probe.formula_names().to_vec();
        Self {
            factory,
            config,
            formula_names,
        }
    }

    pub fn formula_names(&self) -> &[String] {
        &self.formula_names
    }

    /// Label-bit index of a registered formula.
    pub fn formula_index(&self, name: &str) -> Option<usize> {
        self.formula_names.iter().position(|n| n == name)
    }

    /// Check that formula `formula` holds in every reachable state.
    pub fn check_invariant(&self, formula: usize) -> Result<CheckOutcome, CheckError> {
        if formula >= self.formula_names.len() {
            return Err(CheckError::UnknownFormula {
                index: formula,
                count: self.formula_names.len(),
            });
        }

        let store = StateStore::with_capacity(self.config.capacity);
        let mut frontier: VecDeque<QueueEntry> = VecDeque::new();
        let mut model = (self.factory)();

        info!(
            formula = %self.formula_names[formula],
            parallel = self.config.parallel,
            capacity = self.config.capacity,
            "invariant check started"
        );

        // Seed the frontier with the initial states, checking the formula
        // on each of them.
        let initial = match model.initial_transitions() {
            Ok(t) => t,
            Err(e) => return Ok(inconclusive_model_failure(e)),
        };
        for transition in initial {
            let state = SerializedState::new(transition.target);
            match store.try_add(state.clone(), StateIndex::NONE, 0) {
                Ok((index, true)) => {
                    if !transition.labels.contains(formula) {
                        return Ok(self.violated(formula, &store, index));
                    }
                    frontier.push_back((index, state, 0));
                }
                Ok((_, false)) => {}
                Err(StoreError::CapacityExceeded { .. }) => {
                    return Ok(capacity_outcome(&store));
                }
            }
        }

        let outcome = if self.config.parallel {
            self.check_parallel(formula, &store, &mut frontier)
        } else {
            self.check_sequential(formula, &mut model, &store, &mut frontier)
        };
        Ok(outcome)
    }

    fn violated(&self, formula: usize, store: &StateStore, index: StateIndex) -> CheckOutcome {
        let trace = store.trace_to(index);
        info!(
            formula = %self.formula_names[formula],
            depth = trace.len(),
            "invariant violated"
        );
        CheckOutcome::Violated {
            formula: self.formula_names[formula].clone(),
            trace,
        }
    }

    fn cancelled(&self) -> Option<bool> {
        self.config
            .stop_flag
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
    }

    fn check_sequential(
        &self,
        formula: usize,
        model: &mut M,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
    ) -> CheckOutcome {
        let mut max_depth = 0u32;
        let mut expanded = 0usize;

        while let Some((index, state, depth)) = frontier.pop_front() {
            if self.cancelled() == Some(true) {
                return CheckOutcome::Inconclusive {
                    reason: InconclusiveReason::Cancelled,
                };
            }
            expanded += 1;
            if let Some(ref p) = self.config.progress {
                p.checked.fetch_add(1, Ordering::Relaxed);
            }
            trace!(depth, %index, "expanding state");

            if self.config.memory_limit_mb > 0 && expanded.is_multiple_of(1000) {
                if let Some(mem_mb) = current_memory_mb() {
                    if mem_mb >= self.config.memory_limit_mb {
                        info!(memory_mb = mem_mb, "reached memory limit");
                        return CheckOutcome::Inconclusive {
                            reason: InconclusiveReason::MemoryLimitReached {
                                memory_mb: mem_mb,
                                states: store.len(),
                            },
                        };
                    }
                }
            }

            let successors = match model.successors(state.bytes()) {
                Ok(s) => s,
                Err(e) => return inconclusive_model_failure(e),
            };
            for transition in successors {
                let target = SerializedState::new(transition.target);
                match store.try_add(target.clone(), index, depth + 1) {
                    Ok((target_index, true)) => {
                        if !transition.labels.contains(formula) {
                            return self.violated(formula, store, target_index);
                        }
                        max_depth = max_depth.max(depth + 1);
                        frontier.push_back((target_index, target, depth + 1));
                    }
                    Ok((_, false)) => {}
                    Err(StoreError::CapacityExceeded { .. }) => {
                        return capacity_outcome(store);
                    }
                }
            }

            if let Some(ref p) = self.config.progress {
                p.states.store(store.len(), Ordering::Relaxed);
                p.depth.store(max_depth as usize, Ordering::Relaxed);
                p.queue_len.store(frontier.len(), Ordering::Relaxed);
            }
        }

        info!(states = store.len(), max_depth, "exploration converged");
        CheckOutcome::Holds {
            states: store.len(),
            depth: max_depth as usize,
        }
    }

    fn check_parallel(
        &self,
        formula: usize,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
    ) -> CheckOutcome {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
        {
            Ok(pool) => pool.install(|| self.parallel_loop(formula, store, frontier)),
            Err(e) => {
                // Fall back to the global pool rather than aborting the run.
                error!(error = %e, "dedicated worker pool unavailable");
                self.parallel_loop(formula, store, frontier)
            }
        }
    }

    fn parallel_loop(
        &self,
        formula: usize,
        store: &StateStore,
        frontier: &mut VecDeque<QueueEntry>,
    ) -> CheckOutcome {
        // Cooperative short-circuit: set on violation or fatal condition,
        // checked by workers between state expansions.
        let stop = AtomicBool::new(false);
        let batch_size = rayon::current_num_threads() * 256;
        let mut max_depth = 0u32;

        while !frontier.is_empty() {
            if self.cancelled() == Some(true) {
                return CheckOutcome::Inconclusive {
                    reason: InconclusiveReason::Cancelled,
                };
            }
            if self.config.memory_limit_mb > 0 {
                if let Some(mem_mb) = current_memory_mb() {
                    if mem_mb >= self.config.memory_limit_mb {
                        info!(memory_mb = mem_mb, "reached memory limit");
                        return CheckOutcome::Inconclusive {
                            reason: InconclusiveReason::MemoryLimitReached {
                                memory_mb: mem_mb,
                                states: store.len(),
                            },
                        };
                    }
                }
            }

            let batch: Vec<QueueEntry> = frontier.drain(..frontier.len().min(batch_size)).collect();

            let results: Vec<ExpandResult> = batch
                .par_iter()
                .map_init(
                    || (self.factory)(),
                    |model, (index, state, depth)| {
                        self.expand(formula, model, store, &stop, *index, state, *depth)
                    },
                )
                .collect();

            let mut fatal: Option<ExpandResult> = None;
            for result in results {
                match result {
                    ExpandResult::NewStates { entries, max_depth: d } => {
                        max_depth = max_depth.max(d);
                        frontier.extend(entries);
                    }
                    ExpandResult::Violation { .. } => {
                        // A violation beats any other abort cause found in
                        // the same batch: its trace is real either way.
                        fatal = Some(result);
                        break;
                    }
                    ExpandResult::Capacity | ExpandResult::Failure { .. } => {
                        if fatal.is_none() {
                            fatal = Some(result);
                        }
                    }
                    ExpandResult::Skipped => {}
                }
            }
            match fatal {
                Some(ExpandResult::Violation { index }) => {
                    return self.violated(formula, store, index);
                }
                Some(ExpandResult::Capacity) => return capacity_outcome(store),
                Some(ExpandResult::Failure { message }) => {
                    return CheckOutcome::Inconclusive {
                        reason: InconclusiveReason::ModelFailure { message },
                    };
                }
                _ => {}
            }

            if let Some(ref p) = self.config.progress {
                p.states.store(store.len(), Ordering::Relaxed);
                p.depth.store(max_depth as usize, Ordering::Relaxed);
                p.queue_len.store(frontier.len(), Ordering::Relaxed);
            }
        }

        info!(states = store.len(), max_depth, "exploration converged");
        CheckOutcome::Holds {
            states: store.len(),
            depth: max_depth as usize,
        }
    }

    /// Expand one state inside a worker. Partial work after a stop signal
    /// is skipped, not committed.
    #[allow(clippy::too_many_arguments)]
    fn expand(
        &self,
        formula: usize,
        model: &mut M,
        store: &StateStore,
        stop: &AtomicBool,
        index: StateIndex,
        state: &SerializedState,
        depth: u32,
    ) -> ExpandResult {
        if stop.load(Ordering::Relaxed) {
            return ExpandResult::Skipped;
        }
        if let Some(ref p) = self.config.progress {
            p.checked.fetch_add(1, Ordering::Relaxed);
        }

        let successors = match model.successors(state.bytes()) {
            Ok(s) => s,
            Err(e) => {
                stop.store(true, Ordering::Relaxed);
                return ExpandResult::Failure {
                    message: e.to_string(),
                };
            }
        };

        let mut entries = Vec::new();
        let mut max_depth = depth;
        for transition in successors {
            let target = SerializedState::new(transition.target);
            match store.try_add(target.clone(), index, depth + 1) {
                Ok((target_index, true)) => {
                    if !transition.labels.contains(formula) {
                        stop.store(true, Ordering::Relaxed);
                        return ExpandResult::Violation {
                            index: target_index,
                        };
                    }
                    max_depth = max_depth.max(depth + 1);
                    entries.push((target_index, target, depth + 1));
                }
                Ok((_, false)) => {}
                Err(StoreError::CapacityExceeded { .. }) => {
                    stop.store(true, Ordering::Relaxed);
                    return ExpandResult::Capacity;
                }
            }
        }
        debug!(%index, new = entries.len(), "state expanded");
        ExpandResult::NewStates { entries, max_depth }
    }
}

fn inconclusive_model_failure(e: ModelError) -> CheckOutcome {
    CheckOutcome::Inconclusive {
        reason: InconclusiveReason::ModelFailure {
            message: e.to_string(),
        },
    }
}

fn capacity_outcome(store: &StateStore) -> CheckOutcome {
    CheckOutcome::Inconclusive {
        reason: InconclusiveReason::CapacityExceeded {
            states: store.len(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_model::{FormulaSet, ModelResult, Transition};

    /// Ring counter over `modulus` states with two formulas:
    /// 0 = "value below bound", 1 = "never" (always false).
    struct Ring {
        modulus: u8,
        bound: u8,
        names: Vec<String>,
    }

    impl Ring {
        fn new(modulus: u8, bound: u8) -> Self {
            Self {
                modulus,
                bound,
                names: vec!["below_bound".into(), "never".into()],
            }
        }

        fn labels_for(&self, value: u8) -> FormulaSet {
            let mut labels = FormulaSet::EMPTY;
            if value < self.bound {
                labels = labels.with(0);
            }
            labels
        }
    }

    impl AnalysisModel for Ring {
        fn state_len(&self) -> usize {
            1
        }
        fn formula_names(&self) -> &[String] {
            &self.names
        }
        fn initial_transitions(&mut self) -> ModelResult<Vec<Transition>> {
            Ok(vec![Transition {
                weight: 1.0,
                target: vec![0u8].into_boxed_slice(),
                labels: self.labels_for(0),
            }])
        }
        fn successors(&mut self, state: &[u8]) -> ModelResult<Vec<Transition>> {
            let next = (state[0] + 1) % self.modulus;
            Ok(vec![Transition {
                weight: 1.0,
                target: vec![next].into_boxed_slice(),
                labels: self.labels_for(next),
            }])
        }
    }

    fn explorer(modulus: u8, bound: u8, config: CheckConfig) -> Explorer<impl Fn() -> Ring + Sync> {
        Explorer::new(move || Ring::new(modulus, bound), config)
    }

    #[test]
    fn test_invariant_holds() {
        let e = explorer(10, 10, CheckConfig::default());
        let outcome = e.check_invariant(0).unwrap();
        match outcome {
            CheckOutcome::Holds { states, .. } => assert_eq!(states, 10),
            other => panic!("expected holds, got {other:?}"),
        }
    }

    #[test]
    fn test_violation_with_trace() {
        let e = explorer(
            10,
            5,
            CheckConfig {
                parallel: false,
                ..CheckConfig::default()
            },
        );
        let outcome = e.check_invariant(0).unwrap();
        match outcome {
            CheckOutcome::Violated { formula, trace } => {
                assert_eq!(formula, "below_bound");
                // 0 -> 1 -> ... -> 5, the first state with value >= 5.
                assert_eq!(trace.len(), 6);
                assert_eq!(trace.steps[0].1.bytes(), &[0]);
                assert_eq!(trace.steps[5].1.bytes(), &[5]);
                assert_eq!(trace.steps[0].0, StateIndex::from_row(0));
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_false_invariant_violated_at_initial_state() {
        let e = explorer(4, 4, CheckConfig::default());
        let outcome = e.check_invariant(1).unwrap();
        match outcome {
            CheckOutcome::Violated { formula, trace } => {
                assert_eq!(formula, "never");
                assert!(!trace.is_empty());
                // The path starts at an initial state.
                assert_eq!(trace.steps[0].1.bytes(), &[0]);
            }
            other => panic!("expected violation, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_formula_rejected() {
        let e = explorer(4, 4, CheckConfig::default());
        let err = e.check_invariant(7).unwrap_err();
        assert!(matches!(err, CheckError::UnknownFormula { index: 7, count: 2 }));
    }

    #[test]
    fn test_capacity_exceeded_is_inconclusive() {
        let e = explorer(
            100,
            100,
            CheckConfig {
                capacity: 10,
                ..CheckConfig::default()
            },
        );
        let outcome = e.check_invariant(0).unwrap();
        match outcome {
            CheckOutcome::Inconclusive {
                reason: InconclusiveReason::CapacityExceeded { .. },
            } => {}
            other => panic!("expected inconclusive, got {other:?}"),
        }
    }

    #[test]
    fn test_state_count_independent_of_workers() {
        for workers in [1, 2, 8] {
            let e = explorer(
                50,
                50,
                CheckConfig {
                    workers,
                    ..CheckConfig::default()
                },
            );
            match e.check_invariant(0).unwrap() {
                CheckOutcome::Holds { states, .. } => assert_eq!(states, 50),
                other => panic!("expected holds, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let seq = explorer(
            30,
            30,
            CheckConfig {
                parallel: false,
                ..CheckConfig::default()
            },
        );
        let par = explorer(30, 30, CheckConfig::default());
        let (a, b) = (seq.check_invariant(0).unwrap(), par.check_invariant(0).unwrap());
        match (a, b) {
            (
                CheckOutcome::Holds { states: s1, depth: d1 },
                CheckOutcome::Holds { states: s2, depth: d2 },
            ) => {
                assert_eq!(s1, s2);
                assert_eq!(d1, d2);
            }
            other => panic!("expected holds twice, got {other:?}"),
        }
    }

    #[test]
    fn test_cancellation() {
        let flag = Arc::new(AtomicBool::new(true));
        let e = explorer(
            10,
            10,
            CheckConfig {
                stop_flag: Some(flag),
                parallel: false,
                ..CheckConfig::default()
            },
        );
        match e.check_invariant(0).unwrap() {
            CheckOutcome::Inconclusive {
                reason: InconclusiveReason::Cancelled,
            } => {}
            other => panic!("expected cancelled, got {other:?}"),
        }
    }

    #[test]
    fn test_progress_counters_updated() {
        let progress = Arc::new(ProgressCounters::new());
        let e = explorer(
            20,
            20,
            CheckConfig {
                progress: Some(progress.clone()),
                parallel: false,
                ..CheckConfig::default()
            },
        );
        e.check_invariant(0).unwrap();
        assert_eq!(progress.states.load(Ordering::Relaxed), 20);
        assert_eq!(progress.checked.load(Ordering::Relaxed), 20);
    }
}
