use crate::config::WriteRetryConfig;
use crate::error::StoreError;
use crate::runtime::DependencyValues;
use crate::types::{Bar, ComputationKey, IndicatorValue, Preceding, TimeRange, Timeframe};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same key, same value: the write was a no-op.
    Unchanged,
}

/// Persisted indicator rows keyed by [`ComputationKey`].
pub trait ResultStore: Send + Sync {
    /// Idempotent write. A different value under an existing key is a
    /// [`StoreError::ConflictingWrite`], never an overwrite.
    fn upsert(&self, value: &IndicatorValue) -> Result<UpsertOutcome, StoreError>;
    fn lookup(&self, key: &ComputationKey) -> Result<Option<IndicatorValue>, StoreError>;
    /// Deletes every row of one indicator version; returns the number removed.
    fn purge_version(&self, indicator: &str, version: u32) -> Result<usize, StoreError>;
}

/// Ordered bars per (symbol, timeframe).
pub trait BarSource: Send + Sync {
    /// Bars inside `range` plus up to `preceding` bars before its start, in
    /// timestamp order.
    fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
        preceding: Preceding,
    ) -> Result<Vec<Bar>, StoreError>;
}

fn check_value(value: &IndicatorValue) -> Result<(), StoreError> {
    match value.value {
        Some(v) if !v.is_finite() => Err(StoreError::InvalidValue {
            key: value.key.to_string(),
            value: v,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResultStore {
    rows: RwLock<HashMap<ComputationKey, IndicatorValue>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows of one indicator (any version) for a symbol and timeframe, by timestamp.
    pub fn series_rows(&self, symbol: &str, timeframe: Timeframe, indicator: &str) -> Vec<IndicatorValue> {
        let mut rows: Vec<IndicatorValue> = self
            .rows
            .read()
            .values()
            .filter(|row| {
                let series = &row.key.series;
                &*series.symbol == symbol
                    && series.timeframe == timeframe
                    && &*series.indicator == indicator
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }
}

impl ResultStore for InMemoryResultStore {
    fn upsert(&self, value: &IndicatorValue) -> Result<UpsertOutcome, StoreError> {
        check_value(value)?;
        let mut rows = self.rows.write();
        if let Some(existing) = rows.get(&value.key) {
            if existing.evaluated().same_value(&value.evaluated()) {
                return Ok(UpsertOutcome::Unchanged);
            }
            return Err(StoreError::ConflictingWrite {
                key: value.key.to_string(),
                existing: existing.value,
                attempted: value.value,
            });
        }
        rows.insert(value.key.clone(), value.clone());
        Ok(UpsertOutcome::Inserted)
    }

    fn lookup(&self, key: &ComputationKey) -> Result<Option<IndicatorValue>, StoreError> {
        Ok(self.rows.read().get(key).cloned())
    }

    fn purge_version(&self, indicator: &str, version: u32) -> Result<usize, StoreError> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|key, _| {
            !(&*key.series.indicator == indicator && key.series.version == version)
        });
        Ok(before - rows.len())
    }
}

/// Append-only bar history. Rejects bars that do not advance their series.
#[derive(Debug, Default)]
pub struct InMemoryBarSource {
    series: RwLock<HashMap<(String, Timeframe), Vec<Bar>>>,
}

impl InMemoryBarSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bar: Bar) -> Result<(), StoreError> {
        let mut series = self.series.write();
        let bars = series
            .entry((bar.symbol.clone(), bar.timeframe))
            .or_default();
        if let Some(last) = bars.last() {
            if bar.ts_ns <= last.ts_ns {
                return Err(StoreError::OutOfOrderBar {
                    series: format!("{}@{}", bar.symbol, bar.timeframe),
                    ts_ns: bar.ts_ns,
                    last_ts_ns: last.ts_ns,
                });
            }
        }
        bars.push(bar);
        Ok(())
    }

    pub fn extend<I: IntoIterator<Item = Bar>>(&self, bars: I) -> Result<(), StoreError> {
        for bar in bars {
            self.append(bar)?;
        }
        Ok(())
    }
}

impl BarSource for InMemoryBarSource {
    fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: TimeRange,
        preceding: Preceding,
    ) -> Result<Vec<Bar>, StoreError> {
        let series = self.series.read();
        let Some(bars) = series.get(&(symbol.to_string(), timeframe)) else {
            return Ok(Vec::new());
        };
        let first = bars.partition_point(|bar| bar.ts_ns < range.start_ns);
        let end = bars.partition_point(|bar| bar.ts_ns <= range.end_ns);
        let begin = match preceding {
            Preceding::Bars(n) => first.saturating_sub(n),
            Preceding::All => 0,
        };
        Ok(bars[begin..end.max(begin)].to_vec())
    }
}

/// Write boundary: retries transient store failures with exponential backoff.
#[derive(Clone)]
pub struct RetryingWriter {
    store: Arc<dyn ResultStore>,
    config: WriteRetryConfig,
}

impl RetryingWriter {
    pub fn new(store: Arc<dyn ResultStore>, config: WriteRetryConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn write(&self, value: &IndicatorValue) -> Result<UpsertOutcome, StoreError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.upsert(value) {
                Ok(outcome) => {
                    if attempt > 1 {
                        debug!(key = %value.key, attempt, "write succeeded after retry");
                    }
                    return Ok(outcome);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    warn!(
                        key = %value.key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "result write failed, retrying"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                Err(err) => {
                    if let StoreError::ConflictingWrite { .. } = err {
                        warn!(key = %value.key, error = %err, "conflicting result write rejected");
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Dependency lookups served from persisted rows. A store error reads as
/// "not materialized" so the caller's retry path handles it.
pub struct StoreDependencies<'a> {
    store: &'a dyn ResultStore,
}

impl<'a> StoreDependencies<'a> {
    pub fn new(store: &'a dyn ResultStore) -> Self {
        Self { store }
    }
}

impl DependencyValues for StoreDependencies<'_> {
    fn lookup(&self, key: &ComputationKey) -> Option<Option<f64>> {
        match self.store.lookup(key) {
            Ok(row) => row.map(|row| row.value),
            Err(err) => {
                warn!(key = %key, error = %err, "dependency lookup failed");
                None
            }
        }
    }
}
