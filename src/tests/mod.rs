use crate::compile::{compile_formula, CompiledFormula, FormulaSource, RefBinder};
use crate::config::EngineConfig;
use crate::error::{BindError, CompileError};
use crate::ops::FunctionCatalog;
use crate::plan::EvalPlan;
use crate::registry::{IndicatorDefinition, Registry};
use crate::runtime::evaluate;
use crate::runtime::DependencyValues;
use crate::types::{Bar, IndicatorValue, ParameterSnapshot, Timeframe};
use std::collections::BTreeMap;
use std::sync::Arc;

mod registry;

const SYMBOL: &str = "BTCUSDT";
const MINUTE_NS: i64 = 60_000_000_000;

fn tf() -> Timeframe {
    "1m".parse().expect("timeframe")
}

fn ohlc_bar(index: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: SYMBOL.to_string(),
        timeframe: tf(),
        ts_ns: index * MINUTE_NS,
        open,
        high,
        low,
        close,
        volume: 100.0,
    }
}

/// Bars at minutes 1, 2, ... whose close is the given value.
fn close_bars(closes: &[f64]) -> Vec<Bar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| ohlc_bar(i as i64 + 1, *close, *close, *close, *close))
        .collect()
}

/// Closes 1.0 ..= n.
fn ramp(n: usize) -> Vec<Bar> {
    close_bars(&(1..=n).map(|i| i as f64).collect::<Vec<_>>())
}

fn values(rows: &[IndicatorValue]) -> Vec<Option<f64>> {
    rows.iter().map(|row| row.value).collect()
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs()).max(1.0)
}

fn assert_series(actual: &[Option<f64>], expected: &[Option<f64>]) {
    assert_eq!(actual.len(), expected.len(), "length of {actual:?}");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        match (a, e) {
            (Some(a), Some(e)) => assert!(approx_eq(*a, *e), "point {idx}: {a} != {e}"),
            (None, None) => {}
            _ => panic!("point {idx}: {a:?} != {e:?}"),
        }
    }
}

fn registry_with(defs: Vec<IndicatorDefinition>) -> Registry {
    let registry = Registry::new();
    for def in defs {
        registry.register_indicator(def).expect("valid definition");
    }
    registry
}

fn sma5() -> IndicatorDefinition {
    IndicatorDefinition::new("sma5", "sma(close, period=5)").with_dependencies(["sma"])
}

fn spread() -> IndicatorDefinition {
    IndicatorDefinition::new("spread", "high - low")
}

fn plan_for(registry: &Registry, name: &str) -> Arc<EvalPlan> {
    Arc::new(
        registry
            .snapshot()
            .plan(name, SYMBOL, tf(), &BTreeMap::new())
            .expect("plan binds"),
    )
}

fn run_all(plan: Arc<EvalPlan>, bars: Vec<Bar>, deps: &dyn DependencyValues) -> Vec<IndicatorValue> {
    evaluate(plan, bars, deps)
        .collect::<Result<Vec<_>, _>>()
        .expect("evaluation succeeds")
}

/// Compiles a formula with no indicators in scope.
fn compile_standalone(
    formula: &str,
    dependencies: &[&str],
    parameters: &[(&str, f64)],
) -> Result<CompiledFormula, CompileError> {
    let catalog = FunctionCatalog::with_builtins();
    compile_in(&catalog, &BTreeMap::new(), formula, dependencies, parameters)
}

fn compile_in(
    catalog: &FunctionCatalog,
    indicators: &BTreeMap<String, BTreeMap<String, f64>>,
    formula: &str,
    dependencies: &[&str],
    parameters: &[(&str, f64)],
) -> Result<CompiledFormula, CompileError> {
    let dependencies: Vec<String> = dependencies.iter().map(|d| d.to_string()).collect();
    let parameters: BTreeMap<String, f64> = parameters
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect();
    compile_formula(
        catalog,
        indicators,
        &FormulaSource {
            name: "standalone",
            formula,
            dependencies: &dependencies,
            parameters: &parameters,
            steps: &[],
        },
    )
}

/// Binder for formulas that read no other indicator.
struct NoRefs;

impl RefBinder for NoRefs {
    fn bind_ref(
        &self,
        name: &str,
        _overrides: &BTreeMap<String, f64>,
    ) -> Result<(u32, ParameterSnapshot), BindError> {
        Err(BindError::UnknownIndicator {
            name: name.to_string(),
        })
    }
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scheduler.workers = Some(2);
    config.scheduler.dependency_retries = 2;
    config.scheduler.retry_backoff_ms = 1;
    config.store.base_backoff_ms = 1;
    config
}
