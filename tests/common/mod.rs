use indicator_engine::{
    Bar, BarSource, EngineConfig, InMemoryBarSource, InMemoryResultStore, IndicatorDefinition,
    Registry, ResultStore, Scheduler, Timeframe,
};
use std::sync::Arc;

pub const SYMBOL: &str = "BTCUSDT";
pub const MINUTE_NS: i64 = 60_000_000_000;

pub fn tf() -> Timeframe {
    "1m".parse().expect("timeframe")
}

pub fn bar(index: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: SYMBOL.to_string(),
        timeframe: tf(),
        ts_ns: index * MINUTE_NS,
        open,
        high,
        low,
        close,
        volume: 1_000.0,
    }
}

/// Bars at minutes 1..=n with close equal to the minute index.
#[allow(dead_code)]
pub fn ramp(n: i64) -> Vec<Bar> {
    (1..=n)
        .map(|i| bar(i, i as f64, i as f64 + 0.5, i as f64 - 0.5, i as f64))
        .collect()
}

#[allow(dead_code)]
pub fn config() -> EngineConfig {
    EngineConfig::from_toml_str(
        r#"
        [scheduler]
        workers = 2
        dependency_retries = 2
        retry_backoff_ms = 1

        [store]
        max_attempts = 2
        base_backoff_ms = 1
        "#,
    )
    .expect("valid config")
}

#[allow(dead_code)]
pub struct Engine {
    pub registry: Arc<Registry>,
    pub store: Arc<InMemoryResultStore>,
    pub scheduler: Scheduler,
}

impl Engine {
    #[allow(dead_code)]
    pub fn new(bars: Vec<Bar>) -> Self {
        let registry = Arc::new(Registry::new());
        let source = Arc::new(InMemoryBarSource::new());
        source.extend(bars).expect("ordered bars");
        let store = Arc::new(InMemoryResultStore::new());
        let bars: Arc<dyn BarSource> = source;
        let results: Arc<dyn ResultStore> = store.clone();
        let scheduler =
            Scheduler::new(Arc::clone(&registry), bars, results, &config()).expect("scheduler");
        Self {
            registry,
            store,
            scheduler,
        }
    }

    #[allow(dead_code)]
    pub fn define(&self, def: IndicatorDefinition) -> IndicatorDefinition {
        self.registry.register_indicator(def).expect("valid definition")
    }

    #[allow(dead_code)]
    pub fn values(&self, indicator: &str) -> Vec<Option<f64>> {
        self.store
            .series_rows(SYMBOL, tf(), indicator)
            .iter()
            .map(|row| row.value)
            .collect()
    }
}
