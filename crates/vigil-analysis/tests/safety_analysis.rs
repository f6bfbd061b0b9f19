//! End-to-end safety analysis of a pressure tank plant.
//!
//! The pump fills the tank one unit per step. Two independent protection
//! lines cut the pump: a level sensor at pressure 5 and a timer after 6
//! ticks. Overpressure (>= 10) therefore requires both protection lines
//! to fail at once; the other faults are harmless for the hazard.

use vigil_analysis::{hazard_probe, SafetyAnalysis};
use vigil_mc::{CheckConfig, CheckOutcome, Explorer, GraphOutcome, StateGraphBuilder};
use vigil_model::{
    Component, Fault, FaultId, FaultSet, ModelResult, OverflowPolicy, RuntimeModel,
    RuntimeModelBuilder, SchemaBuilder, SlotReader, SlotWriter, StateFormula, Stateful,
    StepContext,
};

struct PressureTank {
    pressure: i64,
    timer: i64,
    lamp_on: bool,
    switch_stuck: FaultId,
    sensor_stuck: FaultId,
    lamp_burnout: FaultId,
    timer_dead: FaultId,
    gauge_drift: FaultId,
    reading: i64,
}

impl Stateful for PressureTank {
    fn type_name(&self) -> &'static str {
        "safety_analysis::PressureTank"
    }

    fn schema(&self, b: &mut SchemaBuilder) {
        b.ranged("pressure", 0, 12, OverflowPolicy::Clamp);
        b.ranged("timer", 0, 8, OverflowPolicy::Clamp);
        b.bool_slot("lamp_on");
        b.ranged("reading", 0, 13, OverflowPolicy::Clamp);
    }

    fn encode(&self, w: &mut SlotWriter<'_>) -> ModelResult<()> {
        w.write_int(self.pressure)?;
        w.write_int(self.timer)?;
        w.write_bool(self.lamp_on)?;
        w.write_int(self.reading)
    }

    fn decode(&mut self, r: &mut SlotReader<'_>) -> ModelResult<()> {
        self.pressure = r.read_int()?;
        self.timer = r.read_int()?;
        self.lamp_on = r.read_bool()?;
        self.reading = r.read_int()?;
        Ok(())
    }
}

impl Component for PressureTank {
    fn update(&mut self, ctx: &mut StepContext<'_>) -> ModelResult<()> {
        // Indicator lamp and gauge model observable, hazard-irrelevant
        // fault effects.
        self.lamp_on = !ctx.fault_activated(self.lamp_burnout)?;
        self.reading = if ctx.fault_activated(self.gauge_drift)? {
            self.pressure + 1
        } else {
            self.pressure
        };

        // A stuck switch keeps the pump off entirely: the safe direction.
        if ctx.fault_activated(self.switch_stuck)? {
            return Ok(());
        }

        let sensor_reports_full = self.pressure >= 5 && !ctx.fault_activated(self.sensor_stuck)?;
        let timer_expired = self.timer >= 6 && !ctx.fault_activated(self.timer_dead)?;
        if sensor_reports_full || timer_expired {
            return Ok(());
        }

        self.pressure += 1;
        self.timer += 1;
        Ok(())
    }
}

const FAULT_NAMES: [&str; 5] = [
    "switch_stuck",
    "sensor_stuck",
    "lamp_burnout",
    "timer_dead",
    "gauge_drift",
];

fn build_model(constrained: Option<FaultSet>) -> RuntimeModel {
    let mut b = RuntimeModelBuilder::new();
    let ids: Vec<FaultId> = FAULT_NAMES
        .iter()
        .map(|name| b.add_fault(Fault::transient(*name)).0)
        .collect();
    let tank = b.add_component(PressureTank {
        pressure: 0,
        timer: 0,
        lamp_on: true,
        switch_stuck: ids[0],
        sensor_stuck: ids[1],
        lamp_burnout: ids[2],
        timer_dead: ids[3],
        gauge_drift: ids[4],
        reading: 0,
    });
    b.add_formula(StateFormula::new("pressure_safe", {
        let tank = tank.clone();
        move || tank.borrow().pressure < 10
    }));
    b.add_formula(StateFormula::new("lamp_on", {
        let tank = tank.clone();
        move || tank.borrow().lamp_on
    }));
    let mut model = b.build().unwrap();
    if let Some(forced) = constrained {
        model.constrain_faults(forced);
    }
    model
}

fn check_config() -> CheckConfig {
    CheckConfig {
        parallel: false,
        capacity: 1 << 16,
        ..CheckConfig::default()
    }
}

#[test]
fn nominal_plant_is_safe() {
    // No faults: both protection lines work.
    let explorer = Explorer::new(|| build_model(Some(FaultSet::EMPTY)), check_config());
    match explorer.check_invariant(0).unwrap() {
        CheckOutcome::Holds { states, .. } => assert!(states > 0),
        other => panic!("expected holds, got {other:?}"),
    }
}

#[test]
fn both_protection_faults_reach_the_hazard() {
    let both = FaultSet::from_indices(&[1, 3]);
    let explorer = Explorer::new(move || build_model(Some(both)), check_config());
    match explorer.check_invariant(0).unwrap() {
        CheckOutcome::Violated { formula, trace } => {
            assert_eq!(formula, "pressure_safe");
            // Filling one unit per step from pressure 0 to 10.
            assert_eq!(trace.len(), 11);
        }
        other => panic!("expected violation, got {other:?}"),
    }
}

#[test]
fn minimal_cut_set_is_the_two_protection_faults() {
    let analysis = SafetyAnalysis::with_max_cardinality(2);
    let probe = hazard_probe(
        |set| move || build_model(Some(set)),
        check_config(),
        0,
    );
    let result = analysis
        .compute_minimal_cut_sets(FAULT_NAMES.iter().map(|s| s.to_string()).collect(), probe)
        .unwrap();

    assert_eq!(result.cut_sets.len(), 1);
    assert_eq!(result.cut_sets[0], FaultSet::from_indices(&[1, 3]));
    assert_eq!(result.describe(result.cut_sets[0]), "{sensor_stuck, timer_dead}");
    // C(5,1) + C(5,2) of the 2^5 subsets, strictly fewer than all 32.
    assert_eq!(result.subsets_checked, 15);
    assert_eq!(result.subsets_total, 32);
}

#[test]
fn state_graph_answers_several_formulas_without_reexploration() {
    // Lamp burnout forced: the hazard stays unreachable but the lamp
    // formula is violated; both answered from one graph.
    let lamp_only = FaultSet::from_indices(&[2]);
    let builder = StateGraphBuilder::new(move || build_model(Some(lamp_only)), check_config());
    let graph = builder.build().unwrap();

    match graph.check_invariant("pressure_safe").unwrap() {
        GraphOutcome::Holds => {}
        other => panic!("expected holds, got {other:?}"),
    }
    match graph.check_invariant("lamp_on").unwrap() {
        GraphOutcome::Violated { formula, path } => {
            assert_eq!(formula, "lamp_on");
            assert!(!path.is_empty());
        }
        other => panic!("expected violation, got {other:?}"),
    }
}
