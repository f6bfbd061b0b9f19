//! Minimal cut set computation over the fault-subset lattice.
//!
//! A candidate fault set is probed by forcing its members to occur,
//! suppressing all other faults, and checking whether the hazard becomes
//! reachable. The lattice is walked breadth first by cardinality starting
//! from singletons, so every reported cut set is minimal within the
//! checked bound without a post-hoc filter; supersets of confirmed cut
//! sets are pruned because they cannot be minimal.

use thiserror::Error;
use tracing::{debug, info};
use vigil_mc::{CheckConfig, CheckError, CheckOutcome, Explorer};
use vigil_model::{AnalysisModel, FaultSet, MAX_FAULTS};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("models with more than {max} faults are not supported (got {count})")]
    TooManyFaults { count: usize, max: usize },

    /// A per-subset check ended without a verdict; the analysis cannot
    /// soundly classify the subset.
    #[error("hazard check inconclusive for fault set {set}: {reason}")]
    Inconclusive { set: FaultSet, reason: String },

    #[error(transparent)]
    Check(#[from] CheckError),
}

/// Result of a cut set analysis.
#[derive(Debug)]
pub struct CutSetResult {
    /// Minimal cut sets, in discovery order (ascending cardinality).
    pub cut_sets: Vec<FaultSet>,
    /// Fault names, indexed by fault identifier.
    pub fault_names: Vec<String>,
    /// Number of fault subsets actually probed.
    pub subsets_checked: usize,
    /// Theoretical maximum (2^n), communicating search efficiency.
    pub subsets_total: u64,
}

impl CutSetResult {
    /// Render a cut set with fault names.
    pub fn describe(&self, set: FaultSet) -> String {
        let names: Vec<&str> = set
            .iter()
            .map(|id| self.fault_names[id.0 as usize].as_str())
            .collect();
        format!("{{{}}}", names.join(", "))
    }
}

/// Breadth-first search over fault subsets for minimal cut sets.
#[derive(Debug, Clone)]
pub struct SafetyAnalysis {
    /// Largest subset cardinality to probe. Minimality of the reported
    /// sets is relative to this bound.
    pub max_cardinality: usize,
}

impl Default for SafetyAnalysis {
    fn default() -> Self {
        Self {
            max_cardinality: usize::MAX,
        }
    }
}

impl SafetyAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_cardinality(max_cardinality: usize) -> Self {
        Self { max_cardinality }
    }

    /// Compute the minimal cut sets among the named faults.
    ///
    /// `hazard_reachable` probes one candidate set; it is expected to run
    /// the invariant checker with the set's members forced to occur and
    /// every other fault suppressed. The fault-free nominal case is not
    /// probed here; check it with a plain invariant run first.
    pub fn compute_minimal_cut_sets<P>(
        &self,
        fault_names: Vec<String>,
        mut hazard_reachable: P,
    ) -> Result<CutSetResult, AnalysisError>
    where
        P: FnMut(FaultSet) -> Result<bool, AnalysisError>,
    {
        let n = fault_names.len();
        if n > MAX_FAULTS {
            return Err(AnalysisError::TooManyFaults {
                count: n,
                max: MAX_FAULTS,
            });
        }

        let mut cut_sets: Vec<FaultSet> = Vec::new();
        let mut checked = 0usize;
        let bound = self.max_cardinality.min(n);

        for cardinality in 1..=bound {
            let found_before = cut_sets.len();
            for_each_combination(n, cardinality, |indices| {
                let set = FaultSet::from_indices(indices);
                // Supersets of a known cut set cannot be minimal.
                if cut_sets.iter().any(|&c| set.is_superset_of(c)) {
                    return Ok(());
                }
                checked += 1;
                debug!(set = %set, "probing fault set");
                if hazard_reachable(set)? {
                    info!(set = %set, cardinality, "minimal cut set found");
                    cut_sets.push(set);
                }
                Ok::<(), AnalysisError>(())
            })?;
            debug!(
                cardinality,
                new_cut_sets = cut_sets.len() - found_before,
                checked,
                "lattice level finished"
            );
        }

        let subsets_total = if n >= 64 { u64::MAX } else { 1u64 << n };
        info!(
            cut_sets = cut_sets.len(),
            checked, subsets_total, "cut set analysis finished"
        );
        Ok(CutSetResult {
            cut_sets,
            fault_names,
            subsets_checked: checked,
            subsets_total,
        })
    }
}

/// Probe closure that classifies a fault set by running the invariant
/// checker: the hazard is reachable iff the safety formula is violated.
///
/// `build` receives the candidate set and returns the model factory for
/// that run; it is expected to force the set's members and suppress the
/// rest (see `RuntimeModel::constrain_faults`).
pub fn hazard_probe<M, F, B>(
    build: B,
    config: CheckConfig,
    formula: usize,
) -> impl FnMut(FaultSet) -> Result<bool, AnalysisError>
where
    M: AnalysisModel,
    F: Fn() -> M + Sync,
    B: Fn(FaultSet) -> F,
{
    move |set| {
        let explorer = Explorer::new(build(set), config.clone());
        match explorer.check_invariant(formula)? {
            CheckOutcome::Holds { .. } => Ok(false),
            CheckOutcome::Violated { .. } => Ok(true),
            CheckOutcome::Inconclusive { reason } => Err(AnalysisError::Inconclusive {
                set,
                reason: reason.to_string(),
            }),
        }
    }
}

/// Visit every k-combination of `0..n`, in lexicographic order.
fn for_each_combination<E>(
    n: usize,
    k: usize,
    mut visit: impl FnMut(&[u16]) -> Result<(), E>,
) -> Result<(), E> {
    debug_assert!(k >= 1);
    if k > n {
        return Ok(());
    }
    let mut indices: Vec<u16> = (0..k as u16).collect();
    loop {
        visit(&indices)?;
        // Advance the rightmost index that can still move.
        let mut i = k;
        loop {
            if i == 0 {
                return Ok(());
            }
            i -= 1;
            if indices[i] < (n - k + i) as u16 {
                break;
            }
        }
        indices[i] += 1;
        for j in i + 1..k {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{i}")).collect()
    }

    #[test]
    fn test_combinations_lexicographic() {
        let mut seen = Vec::new();
        for_each_combination(4, 2, |c| {
            seen.push(c.to_vec());
            Ok::<(), ()>(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
    }

    #[test]
    fn test_pair_cut_set_with_cardinality_bound() {
        // Hazard reachable only when faults 1 and 3 co-occur.
        let required = FaultSet::from_indices(&[1, 3]);
        let analysis = SafetyAnalysis::with_max_cardinality(2);
        let result = analysis
            .compute_minimal_cut_sets(names(5), |set| Ok(set.is_superset_of(required)))
            .unwrap();

        assert_eq!(result.cut_sets, vec![required]);
        // C(5,1) + C(5,2) = 15 of the 2^5 = 32 subsets.
        assert_eq!(result.subsets_checked, 15);
        assert_eq!(result.subsets_total, 32);
        assert_eq!(result.describe(required), "{f1, f3}");
    }

    #[test]
    fn test_superset_pruning_unbounded() {
        let required = FaultSet::from_indices(&[1, 3]);
        let analysis = SafetyAnalysis::new();
        let result = analysis
            .compute_minimal_cut_sets(names(5), |set| Ok(set.is_superset_of(required)))
            .unwrap();

        assert_eq!(result.cut_sets, vec![required]);
        // 5 singletons + 10 pairs + 7 triples + 2 quadruples; every
        // superset of the cut set is pruned, the empty set is never probed.
        assert_eq!(result.subsets_checked, 24);
    }

    #[test]
    fn test_multiple_disjoint_cut_sets() {
        let single = FaultSet::from_indices(&[0]);
        let pair = FaultSet::from_indices(&[1, 2]);
        let analysis = SafetyAnalysis::new();
        let result = analysis
            .compute_minimal_cut_sets(names(3), |set| {
                Ok(set.is_superset_of(single) || set.is_superset_of(pair))
            })
            .unwrap();

        assert_eq!(result.cut_sets, vec![single, pair]);
        // {0}, {1}, {2}, then {1,2}; everything containing fault 0 pruned.
        assert_eq!(result.subsets_checked, 4);
    }

    #[test]
    fn test_reported_sets_are_minimal() {
        let a = FaultSet::from_indices(&[0, 1]);
        let b = FaultSet::from_indices(&[1, 2, 3]);
        let analysis = SafetyAnalysis::new();
        let result = analysis
            .compute_minimal_cut_sets(names(6), |set| {
                Ok(set.is_superset_of(a) || set.is_superset_of(b))
            })
            .unwrap();

        for (i, x) in result.cut_sets.iter().enumerate() {
            for (j, y) in result.cut_sets.iter().enumerate() {
                if i != j {
                    assert!(!x.is_superset_of(*y), "{x} contains {y}");
                }
            }
        }
        assert_eq!(result.cut_sets, vec![a, b]);
    }

    #[test]
    fn test_no_cut_sets() {
        let analysis = SafetyAnalysis::new();
        let result = analysis
            .compute_minimal_cut_sets(names(4), |_| Ok(false))
            .unwrap();
        assert!(result.cut_sets.is_empty());
        // All 15 non-empty subsets probed.
        assert_eq!(result.subsets_checked, 15);
    }

    #[test]
    fn test_inconclusive_probe_aborts() {
        let analysis = SafetyAnalysis::new();
        let err = analysis
            .compute_minimal_cut_sets(names(3), |set| {
                Err(AnalysisError::Inconclusive {
                    set,
                    reason: "capacity".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Inconclusive { .. }));
    }
}
