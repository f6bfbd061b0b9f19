//! Parallel state-space exploration engine.
//!
//! Serialized model states are deduplicated in a capacity-bounded
//! concurrent store and expanded breadth first by a pool of workers, each
//! driving its own instance of the user model. The same machinery checks
//! invariants, retains full state graphs for repeated checks, and builds
//! discrete-time Markov chains for quantitative hazard analysis.

pub mod explorer;
pub mod graph;
pub mod markov;
pub mod state;
pub mod store;

pub use explorer::{
    CheckConfig, CheckError, CheckOutcome, Explorer, InconclusiveReason, ProgressCounters,
};
pub use graph::{GraphEdge, GraphError, GraphOutcome, StateGraph, StateGraphBuilder};
pub use markov::{Distribution, MarkovChain, MarkovChainBuilder, MarkovConfig, MarkovError};
pub use state::{Fingerprint, SerializedState};
pub use store::{StateIndex, StateStore, StoreError, Trace};
