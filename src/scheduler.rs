use crate::cache::ComputationCache;
use crate::config::{EngineConfig, SchedulerConfig};
use crate::error::{BindError, EvalError, SchedulerError, StoreError};
use crate::plan::EvalPlan;
use crate::registry::{Registry, RegistrySnapshot};
use crate::runtime::WindowEvaluator;
use crate::store::{BarSource, ResultStore, RetryingWriter, StoreDependencies, UpsertOutcome};
use crate::types::{ComputationKey, IndicatorValue, Preceding, SeriesKey, TimeRange, Timeframe};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One indicator over one (symbol, timeframe) and an inclusive time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub indicator: String,
    pub range: TimeRange,
    /// Parameter values replacing the indicator's defaults.
    #[serde(default)]
    pub overrides: BTreeMap<String, f64>,
}

impl WorkRequest {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        indicator: impl Into<String>,
        range: TimeRange,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            indicator: indicator.into(),
            range,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, param: impl Into<String>, value: f64) -> Self {
        self.overrides.insert(param.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl BatchState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyFailed | Self::Cancelled
        )
    }

    pub const fn can_transition(self, to: BatchState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::PartiallyFailed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// Lifecycle of one submitted work-set.
#[derive(Debug, Clone)]
pub struct Batch {
    id: Uuid,
    state: BatchState,
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: BatchState::Pending,
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn transition(&mut self, to: BatchState) -> Result<(), SchedulerError> {
        if !self.state.can_transition(to) {
            return Err(SchedulerError::InvalidTransition {
                from: self.state.name(),
                to: to.name(),
            });
        }
        debug!(batch_id = %self.id, from = self.state.name(), to = to.name(), "batch transition");
        self.state = to;
        Ok(())
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative cancel flag, checked between work items.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-indicator tallies for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorOutcome {
    /// Keys this batch evaluated and wrote.
    pub computed: u64,
    /// Keys already materialized by an earlier or concurrent computation.
    pub reused: u64,
    /// Computed keys whose value is an explicit null.
    pub skipped: u64,
    /// Work items that ended in failure.
    pub failed: u64,
    pub failures: Vec<String>,
    /// Keys that could not be written and may be re-submitted.
    pub unwritten: Vec<ComputationKey>,
}

impl IndicatorOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.unwritten.is_empty()
    }

    fn record_failure(&mut self, reason: String) {
        self.failed += 1;
        self.failures.push(reason);
    }

    fn merge(&mut self, other: IndicatorOutcome) {
        self.computed += other.computed;
        self.reused += other.reused;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failures.extend(other.failures);
        self.unwritten.extend(other.unwritten);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub state: BatchState,
    pub registry_generation: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub indicators: BTreeMap<String, IndicatorOutcome>,
}

impl BatchReport {
    pub fn outcome(&self, indicator: &str) -> Option<&IndicatorOutcome> {
        self.indicators.get(indicator)
    }

    /// Every key that failed to persist, for re-submission.
    pub fn unwritten_keys(&self) -> impl Iterator<Item = &ComputationKey> {
        self.indicators.values().flat_map(|o| o.unwritten.iter())
    }
}

/// Lifecycle notifications for the task-queue collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    Started {
        batch_id: Uuid,
        requests: usize,
        at: DateTime<Utc>,
    },
    Finished(BatchReport),
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &BatchEvent);
}

/// Emits events as JSON through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn publish(&self, event: &BatchEvent) {
        match serde_json::to_string(event) {
            Ok(json) => debug!(event = %json, "batch event"),
            Err(err) => warn!(error = %err, "failed to encode batch event"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<BatchEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemoryEventSink {
    fn publish(&self, event: &BatchEvent) {
        self.events.lock().push(event.clone());
    }
}

/// A bound request inside a lane. Requests for the same series are merged.
#[derive(Debug, Clone)]
struct LaneItem {
    indicator: String,
    rank: usize,
    range: TimeRange,
    plan: Arc<EvalPlan>,
}

#[derive(Debug)]
struct Lane {
    symbol: String,
    timeframe: Timeframe,
    items: Vec<LaneItem>,
}

#[derive(Debug)]
enum ItemError {
    /// A dependency value is missing; retried within the budget.
    NotReady(EvalError),
    Failed(String),
}

impl From<EvalError> for ItemError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::DependencyNotMaterialized { .. } => Self::NotReady(err),
            other => Self::Failed(other.to_string()),
        }
    }
}

impl From<StoreError> for ItemError {
    fn from(err: StoreError) -> Self {
        Self::Failed(format!("bar source: {err}"))
    }
}

enum ItemProgress {
    Done,
    Cancelled,
}

/// Timestamps below this are already accounted for in the item's tallies.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    accounted_until: i64,
}

impl Cursor {
    fn covers(&self, ts_ns: i64) -> bool {
        ts_ns < self.accounted_until
    }

    fn advance(&mut self, ts_ns: i64) {
        self.accounted_until = self.accounted_until.max(ts_ns.saturating_add(1));
    }
}

/// Runs work-sets against the registry, one lane per (symbol, timeframe).
pub struct Scheduler {
    registry: Arc<Registry>,
    bars: Arc<dyn BarSource>,
    writer: RetryingWriter,
    cache: Arc<ComputationCache>,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
    pool: rayon::ThreadPool,
}

impl Scheduler {
    pub fn new(
        registry: Arc<Registry>,
        bars: Arc<dyn BarSource>,
        store: Arc<dyn ResultStore>,
        config: &EngineConfig,
    ) -> Result<Self, SchedulerError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.scheduler.worker_count())
            .thread_name(|i| format!("indicator-lane-{i}"))
            .build()?;
        Ok(Self {
            registry,
            bars,
            writer: RetryingWriter::new(store, config.store.clone()),
            cache: Arc::new(ComputationCache::new()),
            events: Arc::new(LogEventSink),
            config: config.scheduler.clone(),
            pool,
        })
    }

    /// Shares a dedup cache with other schedulers in the process.
    pub fn with_cache(mut self, cache: Arc<ComputationCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    #[inline]
    pub fn cache(&self) -> &Arc<ComputationCache> {
        &self.cache
    }

    #[inline]
    pub fn store(&self) -> &Arc<dyn ResultStore> {
        self.writer.store()
    }

    /// Adds a request for every indicator series the given requests read,
    /// transitively, over the same symbol, timeframe and range.
    pub fn with_dependencies(
        &self,
        requests: Vec<WorkRequest>,
    ) -> Result<Vec<WorkRequest>, BindError> {
        let snapshot = self.registry.snapshot();
        let mut seen: BTreeSet<SeriesKey> = BTreeSet::new();
        let mut out = Vec::with_capacity(requests.len());
        let mut queue = requests;
        while let Some(request) = queue.pop() {
            let plan = snapshot.plan(
                &request.indicator,
                &request.symbol,
                request.timeframe,
                &request.overrides,
            )?;
            if !seen.insert(plan.series.clone()) {
                continue;
            }
            for binding in &plan.refs {
                queue.push(WorkRequest {
                    symbol: request.symbol.clone(),
                    timeframe: request.timeframe,
                    indicator: binding.name.clone(),
                    range: request.range,
                    overrides: binding.overrides.clone(),
                });
            }
            out.push(request);
        }
        Ok(out)
    }

    pub fn run(&self, requests: Vec<WorkRequest>) -> Result<BatchReport, SchedulerError> {
        self.run_with_cancel(requests, &CancellationToken::new())
    }

    pub fn run_with_cancel(
        &self,
        requests: Vec<WorkRequest>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, SchedulerError> {
        let mut batch = Batch::new();
        let started_at = Utc::now();
        self.events.publish(&BatchEvent::Started {
            batch_id: batch.id(),
            requests: requests.len(),
            at: started_at,
        });

        let mut indicators: BTreeMap<String, IndicatorOutcome> = BTreeMap::new();
        if cancel.is_cancelled() {
            batch.transition(BatchState::Cancelled)?;
            return Ok(self.finish(batch, 0, started_at, indicators));
        }

        let lease = self
            .registry
            .lease(requests.iter().map(|r| r.indicator.as_str()));
        let snapshot = Arc::clone(lease.snapshot());
        batch.transition(BatchState::Running)?;
        info!(
            batch_id = %batch.id(),
            requests = requests.len(),
            generation = snapshot.generation(),
            "batch started"
        );

        let lanes = self.build_lanes(&snapshot, requests, &mut indicators);
        let lane_outcomes: Vec<BTreeMap<String, IndicatorOutcome>> = self.pool.install(|| {
            lanes
                .into_par_iter()
                .map(|lane| self.run_lane(lane, cancel))
                .collect()
        });
        drop(lease);

        for outcomes in lane_outcomes {
            for (name, outcome) in outcomes {
                indicators.entry(name).or_default().merge(outcome);
            }
        }

        let next = if cancel.is_cancelled() {
            BatchState::Cancelled
        } else if indicators.values().all(IndicatorOutcome::is_success) {
            BatchState::Completed
        } else {
            BatchState::PartiallyFailed
        };
        batch.transition(next)?;
        Ok(self.finish(batch, snapshot.generation(), started_at, indicators))
    }

    fn finish(
        &self,
        batch: Batch,
        registry_generation: u64,
        started_at: DateTime<Utc>,
        indicators: BTreeMap<String, IndicatorOutcome>,
    ) -> BatchReport {
        let report = BatchReport {
            batch_id: batch.id(),
            state: batch.state(),
            registry_generation,
            started_at,
            finished_at: Utc::now(),
            indicators,
        };
        match report.state {
            BatchState::PartiallyFailed => {
                for (name, outcome) in report.indicators.iter().filter(|(_, o)| !o.is_success()) {
                    warn!(
                        batch_id = %report.batch_id,
                        indicator = %name,
                        failed = outcome.failed,
                        unwritten = outcome.unwritten.len(),
                        reasons = ?outcome.failures,
                        "indicator failed in batch"
                    );
                }
            }
            state => info!(batch_id = %report.batch_id, state = state.name(), "batch finished"),
        }
        self.events.publish(&BatchEvent::Finished(report.clone()));
        report
    }

    /// Binds every request, merges requests for the same series, orders each
    /// lane by dependency rank and widens dependency ranges to cover the
    /// warm-up replay of their dependents.
    fn build_lanes(
        &self,
        snapshot: &RegistrySnapshot,
        requests: Vec<WorkRequest>,
        indicators: &mut BTreeMap<String, IndicatorOutcome>,
    ) -> Vec<Lane> {
        let mut lanes: BTreeMap<(String, Timeframe), BTreeMap<SeriesKey, LaneItem>> =
            BTreeMap::new();
        for request in requests {
            let outcome = indicators.entry(request.indicator.clone()).or_default();
            let plan = match snapshot.plan(
                &request.indicator,
                &request.symbol,
                request.timeframe,
                &request.overrides,
            ) {
                Ok(plan) => plan,
                Err(err) => {
                    outcome.record_failure(err.to_string());
                    continue;
                }
            };
            let rank = snapshot
                .order()
                .rank_of(&request.indicator)
                .unwrap_or(usize::MAX);
            let items = lanes
                .entry((request.symbol.clone(), request.timeframe))
                .or_default();
            match items.get_mut(&plan.series) {
                Some(item) => {
                    item.range.start_ns = item.range.start_ns.min(request.range.start_ns);
                    item.range.end_ns = item.range.end_ns.max(request.range.end_ns);
                }
                None => {
                    items.insert(
                        plan.series.clone(),
                        LaneItem {
                            indicator: request.indicator,
                            rank,
                            range: request.range,
                            plan: Arc::new(plan),
                        },
                    );
                }
            }
        }

        lanes
            .into_iter()
            .map(|((symbol, timeframe), items)| {
                let mut items: Vec<LaneItem> = items.into_values().collect();
                items.sort_by(|a, b| {
                    (a.rank, &a.plan.series).cmp(&(b.rank, &b.plan.series))
                });
                self.widen_dependency_ranges(&symbol, timeframe, &mut items);
                Lane {
                    symbol,
                    timeframe,
                    items,
                }
            })
            .collect()
    }

    fn widen_dependency_ranges(&self, symbol: &str, timeframe: Timeframe, items: &mut [LaneItem]) {
        for idx in (0..items.len()).rev() {
            if items[idx].plan.refs.is_empty() {
                continue;
            }
            let replay_start = match self.bars.bars(
                symbol,
                timeframe,
                items[idx].range,
                items[idx].plan.preceding(),
            ) {
                Ok(bars) => bars.first().map(|bar| bar.ts_ns),
                Err(err) => {
                    warn!(series = %items[idx].plan.series, error = %err, "could not size warm-up replay");
                    None
                }
            };
            let (start, end) = match replay_start {
                Some(start) => (start, items[idx].range.end_ns),
                None => continue,
            };
            let wanted: Vec<SeriesKey> = items[idx]
                .plan
                .refs
                .iter()
                .map(|binding| binding.series.clone())
                .collect();
            for dep in items[..idx]
                .iter_mut()
                .filter(|item| wanted.contains(&item.plan.series))
            {
                dep.range.start_ns = dep.range.start_ns.min(start);
                dep.range.end_ns = dep.range.end_ns.max(end);
            }
        }
    }

    fn run_lane(&self, lane: Lane, cancel: &CancellationToken) -> BTreeMap<String, IndicatorOutcome> {
        let mut outcomes: BTreeMap<String, IndicatorOutcome> = BTreeMap::new();
        let mut failed_series: BTreeSet<SeriesKey> = BTreeSet::new();
        for item in &lane.items {
            if cancel.is_cancelled() {
                debug!(symbol = %lane.symbol, timeframe = %lane.timeframe, "lane cancelled");
                break;
            }
            let outcome = outcomes.entry(item.indicator.clone()).or_default();
            if let Some(dep) = item
                .plan
                .refs
                .iter()
                .find(|binding| failed_series.contains(&binding.series))
            {
                outcome.record_failure(format!("dependency `{}` failed", dep.series));
                failed_series.insert(item.plan.series.clone());
                continue;
            }
            let failed_before = outcome.failed;
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                self.run_item(&lane, item, cancel, outcome)
            }));
            if let Err(payload) = run {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(series = %item.plan.series, panic = %message, "work item panicked");
                outcome.record_failure(format!("panicked: {message}"));
            }
            if outcome.failed > failed_before {
                failed_series.insert(item.plan.series.clone());
            }
        }
        outcomes
    }

    /// Computes one item, retrying while a dependency is not materialized.
    fn run_item(
        &self,
        lane: &Lane,
        item: &LaneItem,
        cancel: &CancellationToken,
        outcome: &mut IndicatorOutcome,
    ) {
        let attempts = self.config.dependency_retries.saturating_add(1);
        let mut cursor = Cursor {
            accounted_until: i64::MIN,
        };
        for attempt in 1..=attempts {
            match self.compute_item(lane, item, cancel, outcome, &mut cursor) {
                Ok(ItemProgress::Done) | Ok(ItemProgress::Cancelled) => return,
                Err(ItemError::NotReady(err)) if attempt < attempts => {
                    let backoff = self.config.retry_backoff() * attempt;
                    debug!(
                        series = %item.plan.series,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "dependency not ready, retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(ItemError::NotReady(err)) => {
                    outcome.record_failure(format!(
                        "{err} (gave up after {attempts} attempts)"
                    ));
                    return;
                }
                Err(ItemError::Failed(reason)) => {
                    outcome.record_failure(reason);
                    return;
                }
            }
        }
    }

    /// Holds the series' flight for one attempt. Another batch computing the
    /// same series finishes first; its rows are then found by the pre-scan.
    fn compute_item(
        &self,
        lane: &Lane,
        item: &LaneItem,
        cancel: &CancellationToken,
        outcome: &mut IndicatorOutcome,
        cursor: &mut Cursor,
    ) -> Result<ItemProgress, ItemError> {
        self.cache.get_or_compute(&item.plan.series, |admission| {
            if admission.waited {
                debug!(series = %item.plan.series, "series was in flight elsewhere");
            }
            self.compute_series(lane, item, cancel, outcome, cursor)
        })
    }

    fn compute_series(
        &self,
        lane: &Lane,
        item: &LaneItem,
        cancel: &CancellationToken,
        outcome: &mut IndicatorOutcome,
        cursor: &mut Cursor,
    ) -> Result<ItemProgress, ItemError> {
        let plan = &item.plan;
        let in_range = self
            .bars
            .bars(&lane.symbol, lane.timeframe, item.range, Preceding::NONE)?;

        let mut first_missing = None;
        for bar in &in_range {
            if !self.is_materialized(&plan.series.at(bar.ts_ns)) {
                first_missing = Some(bar.ts_ns);
                break;
            }
            if !cursor.covers(bar.ts_ns) {
                outcome.reused += 1;
                cursor.advance(bar.ts_ns);
            }
        }
        let Some(emit_from) = first_missing else {
            return Ok(ItemProgress::Done);
        };

        let replay_range = TimeRange::new(emit_from, item.range.end_ns);
        let bars = self
            .bars
            .bars(&lane.symbol, lane.timeframe, replay_range, plan.preceding())?;
        let deps = StoreDependencies::new(self.writer.store().as_ref());
        let mut evaluation =
            WindowEvaluator::new(Arc::clone(plan)).evaluate(bars, &deps, Some(emit_from));
        let progress = self.persist(&mut evaluation, cancel, outcome, cursor);
        self.cache
            .record_executions(evaluation.into_evaluator().bars_evaluated());
        progress
    }

    fn persist<I>(
        &self,
        values: I,
        cancel: &CancellationToken,
        outcome: &mut IndicatorOutcome,
        cursor: &mut Cursor,
    ) -> Result<ItemProgress, ItemError>
    where
        I: Iterator<Item = Result<IndicatorValue, EvalError>>,
    {
        for result in values {
            if cancel.is_cancelled() {
                return Ok(ItemProgress::Cancelled);
            }
            let value = result?;
            let ts_ns = value.key.ts_ns;
            if cursor.covers(ts_ns) {
                continue;
            }
            cursor.advance(ts_ns);
            match self.writer.write(&value) {
                Ok(UpsertOutcome::Inserted) => {
                    outcome.computed += 1;
                    if value.value.is_none() {
                        outcome.skipped += 1;
                    }
                }
                Ok(UpsertOutcome::Unchanged) => outcome.reused += 1,
                Err(err) => {
                    warn!(key = %value.key, error = %err, "result not written");
                    outcome.failures.push(format!("write {}: {err}", value.key));
                    outcome.unwritten.push(value.key);
                }
            }
        }
        Ok(ItemProgress::Done)
    }

    /// Whether the result store already holds `key`.
    fn is_materialized(&self, key: &ComputationKey) -> bool {
        match self.writer.store().lookup(key) {
            Ok(row) => row.is_some(),
            Err(err) => {
                warn!(key = %key, error = %err, "result lookup failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}
