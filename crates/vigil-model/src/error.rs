//! Error type for model construction, serialization and step execution.

use thiserror::Error;

/// Model-level error.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A value written to a ranged slot with [`OverflowPolicy::Error`] was
    /// outside the declared bounds.
    ///
    /// [`OverflowPolicy::Error`]: crate::slot::OverflowPolicy::Error
    #[error("value {value} out of range [{min}, {max}] for slot '{slot}'")]
    RangeViolation {
        slot: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// An encode/decode call did not match the declared schema.
    #[error("schema mismatch at slot '{slot}': expected {expected}, wrote {found}")]
    SchemaMismatch {
        slot: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    /// An object wrote fewer or more slots than its schema declares.
    #[error("object '{object}' accessed {found} slots, schema declares {expected}")]
    SlotCountMismatch {
        object: &'static str,
        expected: usize,
        found: usize,
    },

    /// A serialized state had the wrong length for this layout.
    #[error("state has {found} bytes, layout requires {expected}")]
    StateSizeMismatch { expected: usize, found: usize },

    /// A decoded object reference points outside the object table.
    #[error("object reference {index} out of bounds (table has {len} objects)")]
    InvalidReference { index: u16, len: usize },

    /// A probability was outside [0, 1].
    #[error("invalid probability {value}")]
    InvalidProbability { value: f64 },

    /// The options of a probabilistic choice do not sum to 1.
    #[error("probabilistic choice weights sum to {sum}, expected 1")]
    MalformedDistribution { sum: f64 },

    /// A choice point was offered zero options.
    #[error("choice point with no options")]
    EmptyChoice,

    /// A fault without a configured occurrence probability was queried
    /// during probabilistic analysis.
    #[error("fault '{fault}' has no occurrence probability")]
    MissingActivationProbability { fault: String },

    /// More formulas registered than the label bitset can carry.
    #[error("{count} formulas registered, at most {max} supported")]
    TooManyFormulas { count: usize, max: usize },

    /// More faults registered than the fault bitset can carry.
    #[error("{count} faults registered, at most {max} supported")]
    TooManyFaults { count: usize, max: usize },

    /// One source state produced more successor branches than configured.
    #[error("successor capacity {capacity} exceeded")]
    SuccessorCapacityExceeded { capacity: usize },

    /// A ranged slot was declared with min > max.
    #[error("slot '{slot}' declares empty range [{min}, {max}]")]
    EmptyRange {
        slot: &'static str,
        min: i64,
        max: i64,
    },
}

pub type ModelResult<T> = Result<T, ModelError>;
