//! Property-based checks for dependency ordering and rolling-window warm-up.

use indicator_engine::{evaluate, DependencyGraph, IndicatorDefinition, NoDependencies, Registry};
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::BTreeMap;
use std::sync::Arc;

mod common;
use common::*;

fn closes_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(1.0..100.0f64, 1..40)
}

/// Node `i` may only point at nodes `< i`, so every generated graph is acyclic.
fn dag_strategy() -> impl Strategy<Value = Vec<Vec<Index>>> {
    prop::collection::vec(prop::collection::vec(any::<Index>(), 0..4), 1..16)
}

proptest! {
    #[test]
    fn resolved_order_puts_dependencies_first(picks in dag_strategy()) {
        let names: Vec<String> = (0..picks.len()).map(|i| format!("n{i}")).collect();
        let deps: Vec<Vec<&str>> = picks
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if i == 0 {
                    Vec::new()
                } else {
                    row.iter().map(|ix| names[ix.index(i)].as_str()).collect()
                }
            })
            .collect();
        let graph = DependencyGraph::from_edges(
            names.iter().map(String::as_str).zip(deps.iter().map(|d| d.iter().copied())),
        );

        let order = graph.resolve().expect("acyclic by construction");
        for (name, node_deps) in names.iter().zip(&deps) {
            let rank = order.rank_of(name).expect("every node is ranked");
            for dep in node_deps {
                let dep_rank = order.rank_of(dep).expect("dependency is ranked");
                prop_assert!(dep_rank < rank, "{dep} ranked after {name}");
            }
        }
    }

    #[test]
    fn sma_warms_up_then_matches_naive_mean(closes in closes_strategy(), period in 2usize..8) {
        let registry = Registry::new();
        registry
            .register_indicator(
                IndicatorDefinition::new("avg", format!("sma(close, period={period})"))
                    .with_dependencies(["sma"]),
            )
            .expect("valid definition");
        let plan = registry
            .snapshot()
            .plan("avg", SYMBOL, tf(), &BTreeMap::new())
            .expect("plan");
        let bars: Vec<_> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i as i64 + 1, c, c, c, c))
            .collect();

        let values: Vec<Option<f64>> = evaluate(Arc::new(plan), bars, &NoDependencies)
            .map(|row| row.expect("clean input").value)
            .collect();
        prop_assert_eq!(values.len(), closes.len());

        for (i, value) in values.iter().enumerate() {
            if i + 1 < period {
                prop_assert!(value.is_none(), "bar {i} should still be warming up");
            } else {
                let window = &closes[i + 1 - period..=i];
                let expected = window.iter().sum::<f64>() / period as f64;
                let actual = value.expect("full window");
                prop_assert!((actual - expected).abs() < 1e-9, "bar {i}: {actual} vs {expected}");
            }
        }
    }
}
