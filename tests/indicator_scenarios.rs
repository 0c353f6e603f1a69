use indicator_engine::{
    evaluate, BatchState, IndicatorDefinition, NoDependencies, RegistrationError, ResolveError,
    TimeRange, WorkRequest,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

mod common;
use common::*;

fn request(indicator: &str) -> WorkRequest {
    WorkRequest::new(SYMBOL, tf(), indicator, TimeRange::all())
}

fn assert_close(actual: &[Option<f64>], expected: &[Option<f64>]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?}");
    for (a, e) in actual.iter().zip(expected) {
        match (a, e) {
            (Some(a), Some(e)) => assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}"),
            (None, None) => {}
            _ => panic!("{actual:?} != {expected:?}"),
        }
    }
}

#[test]
fn sma5_over_closes_one_to_ten() {
    let engine = Engine::new(ramp(10));
    engine.define(
        IndicatorDefinition::new("sma5", "sma(close, period=5)")
            .with_dependencies(["sma"])
            .with_category("overlap"),
    );
    let report = engine.scheduler.run(vec![request("sma5")]).expect("batch");
    assert_eq!(report.state, BatchState::Completed);
    assert_close(
        &engine.values("sma5"),
        &[
            None,
            None,
            None,
            None,
            Some(3.0),
            Some(4.0),
            Some(5.0),
            Some(6.0),
            Some(7.0),
            Some(8.0),
        ],
    );
}

#[test]
fn spread_of_one_bar() {
    let engine = Engine::new(vec![bar(1, 7.0, 10.0, 4.0, 8.0)]);
    engine.define(IndicatorDefinition::new("spread", "high - low"));

    let plan = engine
        .registry
        .snapshot()
        .plan("spread", SYMBOL, tf(), &BTreeMap::new())
        .expect("plan");
    let direct: Vec<Option<f64>> = evaluate(Arc::new(plan), vec![bar(1, 7.0, 10.0, 4.0, 8.0)], &NoDependencies)
        .map(|row| row.expect("value").value)
        .collect();
    assert_eq!(direct, vec![Some(6.0)]);

    engine.scheduler.run(vec![request("spread")]).expect("batch");
    assert_eq!(engine.values("spread"), vec![Some(6.0)]);
}

#[test]
fn cyclic_redefinition_is_rejected_and_not_persisted() {
    let engine = Engine::new(ramp(3));
    engine.define(IndicatorDefinition::new("a", "close * 2"));
    engine.define(IndicatorDefinition::new("b", "a + 1").with_dependencies(["a"]));

    let err = engine
        .registry
        .register_indicator(IndicatorDefinition::new("a", "b - 1").with_dependencies(["b"]))
        .expect_err("a -> b -> a");
    match err {
        RegistrationError::Resolve(ResolveError::CyclicDependency { path }) => {
            assert_eq!(path, vec!["a", "b", "a"]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    let a = engine.registry.get("a").expect("a");
    assert_eq!((a.version, a.formula.as_str()), (1, "close * 2"));
    assert_eq!(engine.registry.list(10, 0).len(), 2);
}

#[test]
fn version_bump_writes_new_keys_and_keeps_old_rows() {
    let engine = Engine::new(ramp(5));
    engine.define(IndicatorDefinition::new("trend", "sma(close, period=3)").with_dependencies(["sma"]));
    engine.scheduler.run(vec![request("trend")]).expect("v1 batch");

    let v2 = engine.define(
        IndicatorDefinition::new("trend", "ema(close, period=3)").with_dependencies(["ema"]),
    );
    assert_eq!(v2.version, 2);
    let report = engine.scheduler.run(vec![request("trend")]).expect("v2 batch");
    assert_eq!(report.outcome("trend").map(|o| o.computed), Some(5));

    let rows = engine.store.series_rows(SYMBOL, tf(), "trend");
    assert_eq!(rows.len(), 10);
    let by_version = |version: u32| -> Vec<Option<f64>> {
        rows.iter()
            .filter(|row| row.key.series.version == version)
            .map(|row| row.value)
            .collect()
    };
    assert_close(&by_version(1), &[None, None, Some(2.0), Some(3.0), Some(4.0)]);
    assert_close(
        &by_version(2),
        &[Some(1.0), Some(1.5), Some(2.25), Some(3.125), Some(4.0625)],
    );
}

#[test]
fn repeated_batches_are_idempotent() {
    let engine = Engine::new(ramp(20));
    engine.define(IndicatorDefinition::new("sma5", "sma(close, period=5)").with_dependencies(["sma"]));
    engine.scheduler.run(vec![request("sma5")]).expect("first");
    let first = engine.store.series_rows(SYMBOL, tf(), "sma5");

    let again = engine.scheduler.run(vec![request("sma5")]).expect("second");
    let outcome = again.outcome("sma5").expect("outcome");
    assert_eq!((outcome.computed, outcome.reused), (0, 20));
    assert_eq!(engine.store.series_rows(SYMBOL, tf(), "sma5"), first);
}

#[test]
fn concurrent_batches_evaluate_each_key_once() {
    let engine = Engine::new(ramp(40));
    engine.define(IndicatorDefinition::new("sma5", "sma(close, period=5)").with_dependencies(["sma"]));

    let computed: u64 = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| engine.scheduler.run(vec![request("sma5")])))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                let report = h.join().expect("thread").expect("batch");
                assert_eq!(report.state, BatchState::Completed);
                report.outcome("sma5").map_or(0, |o| o.computed)
            })
            .sum()
    });
    assert_eq!(computed, 40);
    assert_eq!(engine.scheduler.cache().execution_count(), 40);
    assert_eq!(engine.store.len(), 40);
}

#[test]
fn dependent_submitted_before_its_dependency_fails_then_recovers() {
    let engine = Engine::new(ramp(5));
    engine.define(IndicatorDefinition::new("fast", "sma(close, period=2)").with_dependencies(["sma"]));
    engine.define(IndicatorDefinition::new("signal", "fast - close").with_dependencies(["fast"]));

    let early = engine.scheduler.run(vec![request("signal")]).expect("early batch");
    assert_eq!(early.state, BatchState::PartiallyFailed);
    assert_eq!(early.outcome("signal").map(|o| o.failed), Some(1));
    assert!(engine.values("signal").is_empty());

    let base = engine.scheduler.run(vec![request("fast")]).expect("dependency batch");
    assert_eq!(base.state, BatchState::Completed);

    let late = engine.scheduler.run(vec![request("signal")]).expect("late batch");
    assert_eq!(late.state, BatchState::Completed);
    assert_close(
        &engine.values("signal"),
        &[None, Some(-0.5), Some(-0.5), Some(-0.5), Some(-0.5)],
    );
}

#[test]
fn multi_step_rsi_through_a_batch() {
    let closes = [10.0, 11.0, 10.0, 12.0, 11.0];
    let bars = closes
        .iter()
        .enumerate()
        .map(|(i, c)| bar(i as i64 + 1, *c, *c, *c, *c))
        .collect();
    let engine = Engine::new(bars);
    engine.define(
        IndicatorDefinition::new("rsi", "100 - 100 / (1 + avg_gain / avg_loss)")
            .with_dependencies(["diff", "max", "wilder"])
            .with_parameter("period", 2.0)
            .with_step("change", "diff(close)")
            .with_step("gain", "max(change, 0)")
            .with_step("loss", "max(-change, 0)")
            .with_step("avg_gain", "wilder(gain, period=period)")
            .with_step("avg_loss", "wilder(loss, period=period)")
            .with_category("momentum"),
    );
    let report = engine.scheduler.run(vec![request("rsi")]).expect("batch");
    assert_eq!(report.state, BatchState::Completed);
    assert_close(
        &engine.values("rsi"),
        &[None, None, Some(50.0), Some(100.0 - 100.0 / 6.0), Some(50.0)],
    );
}
