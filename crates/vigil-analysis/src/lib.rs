//! Safety analysis over component models: minimal fault cut sets.

pub mod cutsets;

pub use cutsets::{hazard_probe, AnalysisError, CutSetResult, SafetyAnalysis};
