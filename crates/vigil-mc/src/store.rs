//! Capacity-bounded concurrent state storage.
//!
//! The store is the only structure mutated concurrently during
//! exploration. It maps each distinct serialized state to a dense index
//! assigned in insertion order, records parent pointers for counterexample
//! replay, and fails fast when the configured capacity is exceeded —
//! silent truncation would make the search unsound.

use crate::state::SerializedState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::error;

/// Dense index of a stored state. Indices start at 1; [`StateIndex::NONE`]
/// (0) denotes "no state" and is used for initial-transition bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateIndex(u32);

impl StateIndex {
    pub const NONE: StateIndex = StateIndex(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Zero-based position, for indexing per-state arrays.
    #[inline]
    pub fn to_row(self) -> usize {
        debug_assert!(!self.is_none());
        (self.0 - 1) as usize
    }

    /// Inverse of [`StateIndex::to_row`].
    #[inline]
    pub fn from_row(row: usize) -> Self {
        StateIndex(row as u32 + 1)
    }
}

impl std::fmt::Display for StateIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "s{}", self.0)
        }
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The configured state capacity was exhausted. Fatal to the run:
    /// the exploration is aborted and reported inconclusive.
    #[error("state capacity of {capacity} states exceeded")]
    CapacityExceeded { capacity: usize },
}

/// How a stored state was first reached.
#[derive(Debug, Clone, Copy)]
pub struct StateInfo {
    pub index: StateIndex,
    /// Predecessor index ([`StateIndex::NONE`] for initial states).
    pub predecessor: StateIndex,
    /// Depth from an initial state.
    pub depth: u32,
}

/// A counterexample path from an initial state to a target state.
#[derive(Debug, Clone)]
pub struct Trace {
    /// `(index, state)` pairs, initial state first.
    pub steps: Vec<(StateIndex, SerializedState)>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The state indices along the path, initial state first.
    pub fn indices(&self) -> impl Iterator<Item = StateIndex> + '_ {
        self.steps.iter().map(|(i, _)| *i)
    }
}

/// Thread-safe, capacity-bounded deduplicating state store.
///
/// Keyed by the full serialized byte sequence (the cached fingerprint only
/// routes the shard), so deduplication is exact. Indices are dense,
/// assigned in insertion order, and never invalidated.
pub struct StateStore {
    states: DashMap<SerializedState, StateInfo>,
    by_index: DashMap<u32, SerializedState>,
    next_index: AtomicU32,
    capacity: usize,
}

impl StateStore {
    /// Create a store holding at most `capacity` distinct states.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize - 1);
        Self {
            states: DashMap::new(),
            by_index: DashMap::new(),
            next_index: AtomicU32::new(1),
            capacity,
        }
    }

    /// Insert a state if it is new.
    ///
    /// Returns the state's index and whether this call inserted it.
    /// Concurrent callers inserting the same bytes agree on the index, and
    /// exactly one of them observes `is_new = true`.
    pub fn try_add(
        &self,
        state: SerializedState,
        predecessor: StateIndex,
        depth: u32,
    ) -> Result<(StateIndex, bool), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.states.entry(state.clone()) {
            Entry::Occupied(occupied) => Ok((occupied.get().index, false)),
            Entry::Vacant(vacant) => {
                let raw = self.next_index.fetch_add(1, Ordering::Relaxed);
                if raw as usize > self.capacity {
                    error!(capacity = self.capacity, "state store capacity exceeded");
                    return Err(StoreError::CapacityExceeded {
                        capacity: self.capacity,
                    });
                }
                let index = StateIndex(raw);
                vacant.insert(StateInfo {
                    index,
                    predecessor,
                    depth,
                });
                self.by_index.insert(raw, state);
                Ok((index, true))
            }
        }
    }

    /// Number of states stored.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up how a state was first reached.
    pub fn get(&self, state: &SerializedState) -> Option<StateInfo> {
        self.states.get(state).map(|r| *r.value())
    }

    /// The state stored under `index`.
    pub fn state_at(&self, index: StateIndex) -> Option<SerializedState> {
        if index.is_none() {
            return None;
        }
        self.by_index.get(&index.get()).map(|r| r.value().clone())
    }

    /// Replay parent pointers from an initial state to `index`.
    pub fn trace_to(&self, index: StateIndex) -> Trace {
        let mut steps = Vec::new();
        let mut current = index;
        while !current.is_none() {
            let Some(state) = self.state_at(current) else {
                break;
            };
            let info = self
                .states
                .get(&state)
                .map(|r| *r.value())
                .expect("indexed state has an entry");
            steps.push((current, state));
            current = info.predecessor;
        }
        steps.reverse();
        Trace { steps }
    }
}
