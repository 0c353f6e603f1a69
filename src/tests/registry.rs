use super::*;
use crate::error::{RegistrationError, ResolveError};
use crate::compile::FormulaStep;
use crate::ops::{CatalogEntryDef, Implementation, NativeOp};
use crate::plan::Step;
use crate::registry::RegistryDocument;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn chain() -> Registry {
    registry_with(vec![
        IndicatorDefinition::new("a", "sma(close, period=period)")
            .with_dependencies(["sma"])
            .with_parameter("period", 3.0),
        IndicatorDefinition::new("b", "a * 2").with_dependencies(["a"]),
        IndicatorDefinition::new("c", "b - close").with_dependencies(["b"]),
    ])
}

fn series_of(registry: &Registry, name: &str) -> crate::types::SeriesKey {
    plan_for(registry, name).series.clone()
}

#[test]
fn registration_assigns_id_and_first_version() {
    let registry = Registry::new();
    let def = registry.register_indicator(sma5()).expect("register");
    assert_eq!(def.version, 1);
    assert!(uuid::Uuid::parse_str(&def.id).is_ok());
    assert_eq!(registry.get(&def.id).map(|d| d.name), Some("sma5".to_string()));
    assert_eq!(registry.snapshot().generation(), 1);
}

#[test]
fn reregistration_bumps_version_and_keeps_id() {
    let registry = Registry::new();
    let first = registry.register_indicator(sma5()).expect("v1");
    let same = registry.register_indicator(sma5()).expect("identical");
    assert_eq!(same, first);
    assert_eq!(registry.snapshot().generation(), 1);

    let changed = IndicatorDefinition::new("sma5", "sma(close, period=5) * 1")
        .with_dependencies(["sma"]);
    let second = registry.register_indicator(changed).expect("v2");
    assert_eq!(second.version, 2);
    assert_eq!(second.id, first.id);
    assert_eq!(registry.snapshot().generation(), 2);
}

#[test]
fn dependency_version_bump_changes_dependent_keys() {
    let registry = chain();
    let before_b = series_of(&registry, "b");
    let before_c = series_of(&registry, "c");

    registry
        .register_indicator(
            IndicatorDefinition::new("a", "ema(close, period=period)")
                .with_dependencies(["ema"])
                .with_parameter("period", 3.0),
        )
        .expect("bump a");

    let after_b = series_of(&registry, "b");
    let after_c = series_of(&registry, "c");
    assert_eq!(after_b.version, before_b.version);
    assert_ne!(after_b.params, before_b.params);
    // c reads a only through b.
    assert_eq!(after_c.version, 1);
    assert_ne!(after_c.params, before_c.params);
    assert_eq!(
        registry
            .snapshot()
            .snapshot_for("c", &BTreeMap::new())
            .expect("snapshot")
            .1
            .dependency_versions()
            .get("a"),
        Some(&2)
    );
}

#[test]
fn cycle_is_rejected_and_not_persisted() {
    let registry = chain();
    let generation = registry.snapshot().generation();

    let err = registry
        .register_indicator(IndicatorDefinition::new("a", "c + 1").with_dependencies(["c"]))
        .expect_err("a -> c -> b -> a");
    match err {
        RegistrationError::Resolve(ResolveError::CyclicDependency { path }) => {
            assert_eq!(path.first(), path.last());
            assert_eq!(path.len(), 4);
        }
        other => panic!("unexpected error {other:?}"),
    }
    let a = registry.get("a").expect("a still registered");
    assert_eq!(a.version, 1);
    assert_eq!(a.formula, "sma(close, period=period)");
    assert_eq!(registry.snapshot().generation(), generation);
}

#[test]
fn self_reference_is_a_cycle() {
    let registry = Registry::new();
    let err = registry
        .register_indicator(IndicatorDefinition::new("x", "x + 1").with_dependencies(["x"]))
        .expect_err("self loop");
    assert!(matches!(
        err,
        RegistrationError::Resolve(ResolveError::CyclicDependency { ref path })
            if path == &["x".to_string(), "x".to_string()]
    ));
    assert!(registry.get("x").is_none());
}

#[test]
fn change_breaking_a_dependent_is_rejected() {
    let registry = registry_with(vec![
        IndicatorDefinition::new("base", "sma(close, period=period)")
            .with_dependencies(["sma"])
            .with_parameter("period", 5.0),
        IndicatorDefinition::new("fast", "base(period=3)").with_dependencies(["base"]),
    ]);
    let err = registry
        .register_indicator(IndicatorDefinition::new("base", "close"))
        .expect_err("fast overrides a parameter base no longer has");
    assert!(matches!(err, RegistrationError::InvalidDefinition { ref name, .. } if name == "base"));
    assert_eq!(registry.get("base").map(|d| d.version), Some(1));
}

#[test]
fn unknown_dependency_is_rejected() {
    let registry = Registry::new();
    let err = registry
        .register_indicator(IndicatorDefinition::new("b", "a * 2").with_dependencies(["a"]))
        .expect_err("a does not exist");
    assert!(matches!(
        err,
        RegistrationError::Compile(CompileError::UnresolvedReference { ref name, .. }) if name == "a"
    ));
    assert!(registry.snapshot().is_empty());
}

#[test]
fn invalid_definitions_are_rejected() {
    let registry = Registry::new();
    let cases = [
        IndicatorDefinition::new("1abc", "close"),
        IndicatorDefinition::new("dup", "sma(close, period=3)").with_dependencies(["sma", "sma"]),
        IndicatorDefinition::new("bad_param", "close").with_parameter("period", f64::NAN),
    ];
    for def in cases {
        let name = def.name.clone();
        let err = registry.register_indicator(def).expect_err(&name);
        assert!(
            matches!(err, RegistrationError::InvalidDefinition { .. }),
            "{name}: {err:?}"
        );
    }

    for taken in ["sma", "close"] {
        let err = registry
            .register_indicator(IndicatorDefinition::new(taken, "open"))
            .expect_err(taken);
        assert!(matches!(
            err,
            RegistrationError::Compile(CompileError::AmbiguousIdentifier { .. })
        ));
    }
    assert!(registry.snapshot().is_empty());
}

#[test]
fn deeply_nested_formula_is_returned_as_an_error() {
    let registry = Registry::new();
    for formula in [
        format!("{}close{}", "(".repeat(100_000), ")".repeat(100_000)),
        format!("{}close{}", "abs(".repeat(1_000), ")".repeat(1_000)),
        format!("{}close", "-".repeat(600)),
    ] {
        let err = registry
            .register_indicator(IndicatorDefinition::new("deep", formula).with_dependencies(["abs"]))
            .expect_err("too deep");
        assert!(
            matches!(err, RegistrationError::Compile(CompileError::InvalidExpression { .. })),
            "{err}"
        );
    }
    assert!(registry.snapshot().is_empty());
}

#[test]
fn removal_requires_no_dependents() {
    let registry = chain();
    let err = registry.remove_indicator("a").expect_err("b reads a");
    match err {
        RegistrationError::InUse { name, dependents } => {
            assert_eq!(name, "a");
            assert_eq!(dependents, vec!["b".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }

    let c_id = registry.get("c").expect("c").id;
    let removed = registry.remove_indicator(&c_id).expect("remove c by id");
    assert_eq!(removed.name, "c");
    assert!(registry.get("c").is_none());
    assert!(matches!(
        registry.remove_indicator("c"),
        Err(RegistrationError::NotFound { .. })
    ));
}

#[test]
fn list_pages_by_name() {
    let registry = chain();
    let names = |defs: Vec<IndicatorDefinition>| -> Vec<String> {
        defs.into_iter().map(|d| d.name).collect()
    };
    assert_eq!(names(registry.list(10, 0)), vec!["a", "b", "c"]);
    assert_eq!(names(registry.list(1, 1)), vec!["b"]);
    assert!(registry.list(5, 3).is_empty());
}

#[test]
fn overrides_are_validated_and_change_the_key() {
    let registry = chain();
    let snapshot = registry.snapshot();
    let (_, defaults) = snapshot.snapshot_for("a", &BTreeMap::new()).expect("defaults");
    let mut overrides = BTreeMap::new();
    overrides.insert("period".to_string(), 4.0);
    let (_, custom) = snapshot.snapshot_for("a", &overrides).expect("override");
    assert_ne!(defaults.hash(), custom.hash());
    assert_eq!(custom.get("period"), Some(4.0));

    overrides.insert("window".to_string(), 4.0);
    assert!(matches!(
        snapshot.snapshot_for("a", &overrides),
        Err(BindError::UnknownParameter { .. })
    ));

    let mut bad = BTreeMap::new();
    bad.insert("period".to_string(), f64::INFINITY);
    assert!(matches!(
        snapshot.snapshot_for("a", &bad),
        Err(BindError::InvalidParameterValue { .. })
    ));
    assert!(matches!(
        snapshot.plan("missing", SYMBOL, tf(), &BTreeMap::new()),
        Err(BindError::UnknownIndicator { .. })
    ));
}

#[test]
fn registered_catalog_function_is_callable() {
    let registry = Registry::new();
    registry
        .register_function(CatalogEntryDef {
            name: "mid".to_string(),
            version: 1,
            arity: 2,
            category: "custom".to_string(),
            description: "midpoint of two series".to_string(),
            params: Vec::new(),
            implementation: Implementation::Declarative {
                formals: vec!["a".to_string(), "b".to_string()],
                expression: "(a + b) / 2".to_string(),
            },
        })
        .expect("register mid");
    registry
        .register_indicator(IndicatorDefinition::new("hl2", "mid(high, low)").with_dependencies(["mid"]))
        .expect("register hl2");
    let rows = run_all(
        plan_for(&registry, "hl2"),
        vec![ohlc_bar(1, 5.0, 10.0, 4.0, 6.0)],
        &crate::runtime::NoDependencies,
    );
    assert_eq!(values(&rows), vec![Some(7.0)]);

    let err = registry
        .register_function(CatalogEntryDef {
            name: "hl2".to_string(),
            version: 1,
            arity: 1,
            category: "custom".to_string(),
            description: String::new(),
            params: Vec::new(),
            implementation: Implementation::Declarative {
                formals: vec!["x".to_string()],
                expression: "x".to_string(),
            },
        })
        .expect_err("name taken by an indicator");
    assert!(matches!(
        err,
        RegistrationError::Compile(CompileError::AmbiguousIdentifier { .. })
    ));
}

#[test]
fn export_and_reload_preserve_ids_and_versions() {
    let registry = chain();
    registry
        .register_indicator(
            IndicatorDefinition::new("c", "b + close").with_dependencies(["b"]),
        )
        .expect("bump c");
    let doc = registry.export();
    let order: Vec<&str> = doc.indicators.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);

    let raw = serde_json::to_string(&doc).expect("serialize");
    let reloaded = Registry::new();
    reloaded.load_json(&raw).expect("reload");
    assert_eq!(reloaded.export(), doc);
    assert_eq!(reloaded.get("c").map(|d| d.version), Some(2));
    assert_eq!(series_of(&reloaded, "c"), series_of(&registry, "c"));
}

#[test]
fn snapshot_functions_may_appear_in_any_order() {
    let raw = r#"{
        "functions": [
            {"name": "wrap", "arity": 1,
             "implementation": {"kind": "declarative", "formals": ["x"], "expression": "base_avg(x) * 2"}},
            {"name": "base_avg", "arity": 1,
             "implementation": {"kind": "declarative", "formals": ["x"], "expression": "sma(x, period=2)"}}
        ],
        "indicators": [
            {"name": "w", "formula": "wrap(close)", "dependencies": ["wrap"]}
        ]
    }"#;
    let registry = Registry::new();
    registry.load_json(raw).expect("load");
    let rows = run_all(plan_for(&registry, "w"), ramp(3), &crate::runtime::NoDependencies);
    assert_series(&values(&rows), &[None, Some(3.0), Some(5.0)]);
}

#[test]
fn invalid_snapshot_leaves_registry_unchanged() {
    let registry = chain();
    let before = registry.export();
    let doc = RegistryDocument {
        functions: Vec::new(),
        indicators: vec![
            IndicatorDefinition::new("p", "q").with_dependencies(["q"]),
            IndicatorDefinition::new("q", "p").with_dependencies(["p"]),
        ],
    };
    let err = registry.load_snapshot(doc).expect_err("cycle");
    assert!(matches!(err, RegistrationError::Resolve(ResolveError::CyclicDependency { .. })));
    assert_eq!(registry.export(), before);

    assert!(matches!(
        registry.load_json("{not json"),
        Err(RegistrationError::Snapshot(_))
    ));
}

#[test]
fn lease_blocks_redefinition_until_released() {
    let registry = Arc::new(chain());
    let lease = registry.lease(["c"]);
    let leased: Vec<&str> = lease.names().iter().map(String::as_str).collect();
    assert_eq!(leased, vec!["a", "b", "c"]);

    let done = Arc::new(AtomicBool::new(false));
    let writer = {
        let registry = Arc::clone(&registry);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            registry
                .register_indicator(IndicatorDefinition::new("b", "a * 3").with_dependencies(["a"]))
                .expect("redefine b");
            done.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst), "writer must wait for the lease");
    assert_eq!(lease.snapshot().indicator("b").map(|r| r.definition.version), Some(1));

    drop(lease);
    writer.join().expect("writer thread");
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(registry.get("b").map(|d| d.version), Some(2));
}

#[test]
fn waiting_redefinition_holds_off_new_leases() {
    let registry = Arc::new(chain());
    let first = registry.lease(["b"]);

    let redefined = Arc::new(AtomicBool::new(false));
    let writer = {
        let registry = Arc::clone(&registry);
        let redefined = Arc::clone(&redefined);
        thread::spawn(move || {
            registry
                .register_indicator(IndicatorDefinition::new("b", "a * 3").with_dependencies(["a"]))
                .expect("redefine b");
            redefined.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!redefined.load(Ordering::SeqCst));

    let leased = Arc::new(AtomicBool::new(false));
    let reader = {
        let registry = Arc::clone(&registry);
        let leased = Arc::clone(&leased);
        let redefined = Arc::clone(&redefined);
        thread::spawn(move || {
            let lease = registry.lease(["b"]);
            leased.store(true, Ordering::SeqCst);
            assert!(redefined.load(Ordering::SeqCst), "lease granted ahead of the waiting writer");
            lease.snapshot().indicator("b").map(|r| r.definition.version)
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!leased.load(Ordering::SeqCst), "new lease must queue behind the writer");

    drop(first);
    writer.join().expect("writer thread");
    assert_eq!(reader.join().expect("reader thread"), Some(2));
}

fn rsi() -> IndicatorDefinition {
    IndicatorDefinition::new("rsi", "100 - 100 / (1 + avg_gain / avg_loss)")
        .with_dependencies(["diff", "max", "wilder"])
        .with_parameter("period", 2.0)
        .with_step("change", "diff(close)")
        .with_step("gain", "max(change, 0)")
        .with_step("loss", "max(-change, 0)")
        .with_step("avg_gain", "wilder(gain, period=period)")
        .with_step("avg_loss", "wilder(loss, period=period)")
}

#[test]
fn steps_lower_to_shared_plan_steps() {
    let registry = registry_with(vec![rsi()]);
    let plan = plan_for(&registry, "rsi");
    let count = |wanted: NativeOp| {
        plan.steps
            .iter()
            .filter(|step| matches!(step, Step::Native { op, .. } if *op == wanted))
            .count()
    };
    assert_eq!(count(NativeOp::Diff), 1);
    assert_eq!(count(NativeOp::Neg), 1);
    assert_eq!(count(NativeOp::Max), 2);
    assert_eq!(count(NativeOp::Wilder), 2);

    // change: -, 1, -1, 2, -1; both averages seed at bar 2 and emit from bar 3.
    let rows = run_all(
        Arc::clone(&plan),
        close_bars(&[10.0, 11.0, 10.0, 12.0, 11.0]),
        &crate::runtime::NoDependencies,
    );
    assert_series(
        &values(&rows),
        &[None, None, Some(50.0), Some(100.0 - 100.0 / 6.0), Some(50.0)],
    );
}

#[test]
fn steps_are_part_of_the_stored_definition() {
    let registry = registry_with(vec![rsi()]);
    let unchanged = registry.register_indicator(rsi()).expect("identical");
    assert_eq!(unchanged.version, 1);

    let mut slower = rsi();
    slower.steps[3] = FormulaStep::new("avg_gain", "wilder(gain, period=3)");
    let bumped = registry.register_indicator(slower).expect("changed step");
    assert_eq!(bumped.version, 2);

    let raw = serde_json::to_string(&registry.export()).expect("serialize");
    let reloaded = Registry::new();
    reloaded.load_json(&raw).expect("reload");
    let steps = reloaded.get("rsi").map(|d| d.steps).unwrap_or_default();
    assert_eq!(steps.len(), 5);
    assert_eq!(steps[3].expr, "wilder(gain, period=3)");
}

#[test]
fn invalid_steps_are_rejected() {
    let registry = Registry::new();
    let base = || IndicatorDefinition::new("s", "x").with_dependencies(["abs"]);
    let cases = [
        base().with_step("2x", "close"),
        base().with_step("x", "close").with_step("x", "open"),
    ];
    for def in cases {
        let err = registry.register_indicator(def).expect_err("bad step");
        assert!(matches!(err, RegistrationError::InvalidDefinition { .. }), "{err:?}");
    }

    let ambiguous = [
        (base().with_step("close", "open").with_step("x", "close"), "raw field, step"),
        (base().with_step("abs", "open").with_step("x", "abs"), "catalog function, step"),
        (
            base().with_parameter("x", 1.0).with_step("x", "open"),
            "parameter, step",
        ),
        (base().with_step("s", "open").with_step("x", "s"), "indicator, step"),
    ];
    for (def, expected) in ambiguous {
        let err = registry.register_indicator(def).expect_err(expected);
        assert!(
            matches!(
                &err,
                RegistrationError::Compile(CompileError::AmbiguousIdentifier { matches, .. })
                    if matches == expected
            ),
            "{err:?}"
        );
    }

    let forward = base().with_step("x", "y").with_step("y", "close");
    let err = registry.register_indicator(forward).expect_err("forward step reference");
    assert!(matches!(
        err,
        RegistrationError::Compile(CompileError::UnresolvedReference { ref name, .. }) if name == "y"
    ));
    assert!(registry.snapshot().is_empty());
}

#[test]
fn step_references_cannot_expand_without_bound() {
    let mut def = IndicatorDefinition::new("wide", "s40");
    def = def.with_step("s0", "close");
    for i in 1..=40 {
        def = def.with_step(format!("s{i}"), format!("s{} + s{}", i - 1, i - 1));
    }
    let err = Registry::new().register_indicator(def).expect_err("exponential expansion");
    assert!(
        matches!(err, RegistrationError::Compile(CompileError::InvalidExpression { .. })),
        "{err:?}"
    );
}
