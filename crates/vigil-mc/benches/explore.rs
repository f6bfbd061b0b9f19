//! Criterion benchmarks for the exploration engine.
//!
//! Run with: cargo bench -p vigil-mc

use criterion::{criterion_group, criterion_main, Criterion};
use vigil_mc::{CheckConfig, Explorer};
use vigil_model::{FormulaSet, ModelResult, Transition};

/// Synthetic model: `width` independent counters modulo `modulus`,
/// yielding `modulus^width` states with `width` successors each.
#[derive(Clone)]
struct Lattice {
    width: usize,
    modulus: u8,
    names: Vec<String>,
}

impl Lattice {
    fn new(width: usize, modulus: u8) -> Self {
        Self {
            width,
            modulus,
            names: vec!["true".into()],
        }
    }
}

impl vigil_model::AnalysisModel for Lattice {
    fn state_len(&self) -> usize {
        self.width
    }

    fn formula_names(&self) -> &[String] {
        &self.names
    }

    fn initial_transitions(&mut self) -> ModelResult<Vec<Transition>> {
        Ok(vec![Transition {
            weight: 1.0,
            target: vec![0u8; self.width].into_boxed_slice(),
            labels: FormulaSet::EMPTY.with(0),
        }])
    }

    fn successors(&mut self, state: &[u8]) -> ModelResult<Vec<Transition>> {
        let mut out = Vec::with_capacity(self.width);
        for i in 0..self.width {
            let mut next = state.to_vec();
            next[i] = (next[i] + 1) % self.modulus;
            out.push(Transition {
                weight: 1.0,
                target: next.into_boxed_slice(),
                labels: FormulaSet::EMPTY.with(0),
            });
        }
        Ok(out)
    }
}

fn bench_check(c: &mut Criterion, name: &str, width: usize, modulus: u8, config: CheckConfig) {
    c.bench_function(name, |b| {
        b.iter(|| {
            let explorer = Explorer::new(move || Lattice::new(width, modulus), config.clone());
            explorer.check_invariant(0).unwrap()
        })
    });
}

fn benchmarks(c: &mut Criterion) {
    let sequential = CheckConfig {
        parallel: false,
        ..CheckConfig::default()
    };
    let parallel = CheckConfig::default();

    // 10^4 states, 4 successors each.
    bench_check(c, "lattice_4x10_sequential", 4, 10, sequential.clone());
    bench_check(c, "lattice_4x10_parallel", 4, 10, parallel.clone());

    // Wider fan-out.
    bench_check(c, "lattice_6x6_sequential", 6, 6, sequential);
    bench_check(c, "lattice_6x6_parallel", 6, 6, parallel);
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
