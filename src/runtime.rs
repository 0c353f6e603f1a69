use crate::error::EvalError;
use crate::ops::{NativeRegistry, Slot};
use crate::plan::{EvalPlan, Step};
use crate::state::PlanState;
use crate::types::{Bar, ComputationKey, Evaluated, IndicatorValue, SkipReason};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Inputs of a native step are gathered into a fixed buffer; no builtin takes more.
pub const MAX_NATIVE_INPUTS: usize = 2;

/// Read access to already-materialized dependency series.
pub trait DependencyValues {
    /// `None` when nothing is materialized for `key`; `Some(None)` for a stored null.
    fn lookup(&self, key: &ComputationKey) -> Option<Option<f64>>;
}

impl DependencyValues for HashMap<ComputationKey, Option<f64>> {
    fn lookup(&self, key: &ComputationKey) -> Option<Option<f64>> {
        self.get(key).copied()
    }
}

/// Lookup for plans without indicator references.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDependencies;

impl DependencyValues for NoDependencies {
    fn lookup(&self, _key: &ComputationKey) -> Option<Option<f64>> {
        None
    }
}

pub trait Evaluator {
    fn load(&mut self, plan: Arc<EvalPlan>);
    /// Evaluates one bar. Either emits a value (or explicit skip) for the bar's
    /// timestamp and advances window state, or fails without touching state.
    fn on_bar(
        &mut self,
        bar: &Bar,
        deps: &dyn DependencyValues,
    ) -> Result<IndicatorValue, EvalError>;
    fn last_ts_ns(&self) -> Option<i64>;
}

/// Walks time-ordered bars for one output series with bounded per-step state.
#[derive(Debug, Clone)]
pub struct WindowEvaluator {
    plan: Arc<EvalPlan>,
    state: PlanState,
    ref_values: Vec<Slot>,
    bars_evaluated: u64,
    #[cfg(test)]
    kernel_exec_count: u64,
}

impl WindowEvaluator {
    pub fn new(plan: Arc<EvalPlan>) -> Self {
        let state = PlanState::from_plan(&plan);
        let ref_values = vec![Err(SkipReason::NullInput); plan.refs.len()];
        Self {
            plan,
            state,
            ref_values,
            bars_evaluated: 0,
            #[cfg(test)]
            kernel_exec_count: 0,
        }
    }

    #[inline]
    pub fn plan(&self) -> &Arc<EvalPlan> {
        &self.plan
    }

    /// Bars run through the plan since construction, replayed ones included.
    #[inline]
    pub fn bars_evaluated(&self) -> u64 {
        self.bars_evaluated
    }

    /// Drops all window state; the next bar starts a fresh stream.
    pub fn reset(&mut self) {
        self.state.reset(&self.plan);
    }

    /// Lazily evaluates `bars`, emitting only timestamps at or after `emit_from`.
    /// Earlier bars are replayed to warm window state.
    pub fn evaluate<'d, I>(
        self,
        bars: I,
        deps: &'d dyn DependencyValues,
        emit_from: Option<i64>,
    ) -> Evaluation<'d, I::IntoIter>
    where
        I: IntoIterator<Item = Bar>,
    {
        Evaluation {
            evaluator: self,
            bars: bars.into_iter(),
            deps,
            emit_from: emit_from.unwrap_or(i64::MIN),
            done: false,
        }
    }

    fn check_bar(&self, bar: &Bar) -> Result<(), EvalError> {
        let series = &self.plan.series;
        if bar.symbol.as_str() != &*series.symbol || bar.timeframe != series.timeframe {
            return Err(EvalError::ForeignBar {
                symbol: bar.symbol.clone(),
                timeframe: bar.timeframe.to_string(),
                expected: series.to_string(),
            });
        }
        if let Some(last_ts_ns) = self.state.last_ts_ns() {
            if bar.ts_ns <= last_ts_ns {
                return Err(EvalError::NonMonotonicBar {
                    current_ts_ns: bar.ts_ns,
                    last_ts_ns,
                });
            }
        }
        Ok(())
    }

    fn gather_refs(&mut self, ts_ns: i64, deps: &dyn DependencyValues) -> Result<(), EvalError> {
        for (idx, binding) in self.plan.refs.iter().enumerate() {
            let key = binding.series.at(ts_ns);
            self.ref_values[idx] = match deps.lookup(&key) {
                None => {
                    return Err(EvalError::DependencyNotMaterialized {
                        dependency: binding.series.to_string(),
                        ts_ns,
                    })
                }
                Some(None) => Err(SkipReason::NullInput),
                Some(Some(value)) if value.is_finite() => Ok(value),
                Some(Some(_)) => Err(SkipReason::NonFinite),
            };
        }
        Ok(())
    }

    fn run_steps(&mut self, bar: &Bar) -> Slot {
        let plan = Arc::clone(&self.plan);
        for (idx, step) in plan.steps.iter().enumerate() {
            let slot = match step {
                Step::Field(field) => {
                    let value = field.read(bar);
                    if value.is_finite() {
                        Ok(value)
                    } else {
                        Err(SkipReason::NullInput)
                    }
                }
                Step::Const(value) => Ok(*value),
                Step::Ref(ref_idx) => self.ref_values[*ref_idx],
                Step::Native {
                    op, inputs, param, ..
                } => {
                    debug_assert!(
                        inputs.len() <= MAX_NATIVE_INPUTS,
                        "native step has {} inputs",
                        inputs.len()
                    );
                    let mut buf: [Slot; MAX_NATIVE_INPUTS] = [Ok(0.0); MAX_NATIVE_INPUTS];
                    for (slot_idx, input) in inputs.iter().enumerate() {
                        buf[slot_idx] = self.state.slot(*input);
                    }
                    let kernel = NativeRegistry::get_by_op(*op).kernel;
                    #[cfg(test)]
                    {
                        self.kernel_exec_count += 1;
                    }
                    match kernel(self.state.kernel_mut(idx), &buf[..inputs.len()], *param) {
                        Ok(value) if !value.is_finite() => Err(SkipReason::NonFinite),
                        other => other,
                    }
                }
            };
            self.state.set_slot(idx, slot);
        }
        self.state.slot(plan.root)
    }

    #[cfg(test)]
    pub(crate) fn kernel_exec_count(&self) -> u64 {
        self.kernel_exec_count
    }
}

impl Evaluator for WindowEvaluator {
    fn load(&mut self, plan: Arc<EvalPlan>) {
        *self = Self::new(plan);
    }

    fn on_bar(
        &mut self,
        bar: &Bar,
        deps: &dyn DependencyValues,
    ) -> Result<IndicatorValue, EvalError> {
        self.check_bar(bar)?;
        // Dependencies first: a missing one must leave window state untouched.
        self.gather_refs(bar.ts_ns, deps)?;
        let slot = self.run_steps(bar);
        self.state.mark(bar.ts_ns);
        self.bars_evaluated += 1;

        let evaluated = Evaluated::from(slot);
        if let Some(reason) = evaluated.skip {
            if reason != SkipReason::InsufficientLookback {
                debug!(
                    series = %self.plan.series,
                    ts_ns = bar.ts_ns,
                    reason = ?reason,
                    "evaluation skipped"
                );
            }
        }
        Ok(IndicatorValue::new(self.plan.series.at(bar.ts_ns), evaluated))
    }

    #[inline]
    fn last_ts_ns(&self) -> Option<i64> {
        self.state.last_ts_ns()
    }
}

/// Lazy, timestamp-ordered sequence of values for one series. Stops after the
/// first error.
pub struct Evaluation<'d, I> {
    evaluator: WindowEvaluator,
    bars: I,
    deps: &'d dyn DependencyValues,
    emit_from: i64,
    done: bool,
}

impl<'d, I> Evaluation<'d, I> {
    /// Hands back the evaluator with whatever state it reached.
    pub fn into_evaluator(self) -> WindowEvaluator {
        self.evaluator
    }
}

impl<'d, I> Iterator for Evaluation<'d, I>
where
    I: Iterator<Item = Bar>,
{
    type Item = Result<IndicatorValue, EvalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        for bar in self.bars.by_ref() {
            match self.evaluator.on_bar(&bar, self.deps) {
                Ok(value) if bar.ts_ns < self.emit_from => drop(value),
                Ok(value) => return Some(Ok(value)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        self.done = true;
        None
    }
}

/// Evaluates a bound plan over a bar stream from a cold start.
pub fn evaluate<'d, I>(
    plan: Arc<EvalPlan>,
    bars: I,
    deps: &'d dyn DependencyValues,
) -> Evaluation<'d, I::IntoIter>
where
    I: IntoIterator<Item = Bar>,
{
    WindowEvaluator::new(plan).evaluate(bars, deps, None)
}
