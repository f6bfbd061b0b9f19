//! Backtracking resolver for the choice points of one model step.
//!
//! A step may hit several nondeterministic or probabilistic choice points.
//! The resolver enumerates every resolution: each path replays the recorded
//! decisions up to the deepest point that still has untried options, then
//! takes fresh defaults beyond it. Enumeration is exhaustive, deterministic,
//! and restartable from the same source state.

use smallvec::SmallVec;

#[derive(Debug)]
struct ChoicePoint {
    options: usize,
    chosen: usize,
    /// Branch weights; empty means every option has weight 1.
    weights: SmallVec<[f64; 4]>,
}

impl ChoicePoint {
    fn weight_of(&self, option: usize) -> f64 {
        self.weights.get(option).copied().unwrap_or(1.0)
    }
}

/// Enumerates all resolutions of a step's choice points, depth first.
#[derive(Debug, Default)]
pub struct ChoiceResolver {
    points: Vec<ChoicePoint>,
    cursor: usize,
    weight: f64,
}

impl ChoiceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all recorded decisions; call once per source state.
    pub fn reset(&mut self) {
        self.points.clear();
        self.cursor = 0;
        self.weight = 1.0;
    }

    /// Start replaying the current path from its first choice point.
    pub fn begin_path(&mut self) {
        self.cursor = 0;
        self.weight = 1.0;
    }

    /// Resolve an unweighted choice among `options` alternatives.
    pub fn choose(&mut self, options: usize) -> usize {
        debug_assert!(options > 0);
        self.resolve(options, SmallVec::new())
    }

    /// Resolve a weighted choice; the path weight is multiplied by the
    /// weight of the taken branch.
    pub fn choose_weighted(&mut self, weights: &[f64]) -> usize {
        debug_assert!(!weights.is_empty());
        self.resolve(weights.len(), SmallVec::from_slice(weights))
    }

    fn resolve(&mut self, options: usize, weights: SmallVec<[f64; 4]>) -> usize {
        let chosen = if self.cursor < self.points.len() {
            // Replaying a decision recorded on an earlier path.
            debug_assert_eq!(self.points[self.cursor].options, options);
            self.points[self.cursor].chosen
        } else {
            self.points.push(ChoicePoint {
                options,
                chosen: 0,
                weights,
            });
            0
        };
        self.weight *= self.points[self.cursor].weight_of(chosen);
        self.cursor += 1;
        chosen
    }

    /// The product of the taken branch weights along the current path.
    pub fn path_weight(&self) -> f64 {
        self.weight
    }

    /// Move to the next untried path. Returns false when enumeration is
    /// complete.
    pub fn advance(&mut self) -> bool {
        while let Some(point) = self.points.last_mut() {
            if point.chosen + 1 < point.options {
                point.chosen += 1;
                return true;
            }
            self.points.pop();
        }
        false
    }
}
