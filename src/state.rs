use crate::ops::{LookbackSpec, Slot, StateSpec};
use crate::plan::{EvalPlan, KernelParam, Step};

/// Fixed-capacity ring of the most recent values. `NaN` marks a null point.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    data: Vec<f64>,
    cap: usize,
    len: usize,
    write: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: vec![f64::NAN; cap.max(1)],
            cap: cap.max(1),
            len: 0,
            write: 0,
        }
    }

    /// Appends `value`, returning the evicted oldest value once the ring is full.
    #[inline]
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = (self.len == self.cap).then(|| self.data[self.write]);
        self.data[self.write] = value;
        self.write += 1;
        if self.write == self.cap {
            self.write = 0;
        }
        if self.len < self.cap {
            self.len += 1;
        }
        evicted
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.cap
    }

    #[inline]
    pub fn get_lag(&self, lag: usize) -> Option<f64> {
        if lag >= self.len {
            return None;
        }
        let last = if self.write == 0 {
            self.cap - 1
        } else {
            self.write - 1
        };
        let idx = if last >= lag {
            last - lag
        } else {
            self.cap + last - lag
        };
        Some(self.data[idx])
    }

    /// Values from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len).rev().filter_map(move |lag| self.get_lag(lag))
    }

    pub fn clear(&mut self) {
        self.data.fill(f64::NAN);
        self.len = 0;
        self.write = 0;
    }
}

/// Bounded window with a running sum over its non-null values.
#[derive(Debug, Clone)]
pub struct WindowState {
    ring: RingBuffer,
    sum: f64,
    nulls: usize,
}

impl WindowState {
    pub fn new(cap: usize) -> Self {
        Self {
            ring: RingBuffer::new(cap),
            sum: 0.0,
            nulls: 0,
        }
    }

    pub fn push(&mut self, value: Option<f64>) {
        let value = value.unwrap_or(f64::NAN);
        if let Some(old) = self.ring.push(value) {
            if old.is_nan() {
                self.nulls -= 1;
            } else {
                self.sum -= old;
            }
        }
        if value.is_nan() {
            self.nulls += 1;
        } else {
            self.sum += value;
        }
        // Re-derive the sum once per lap so subtraction error cannot accumulate.
        if self.ring.write == 0 {
            self.sum = self.ring.iter().filter(|v| !v.is_nan()).sum();
        }
    }

    #[inline]
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    #[inline]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[inline]
    pub fn nulls(&self) -> usize {
        self.nulls
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.ring.is_full()
    }
}

/// Recursive smoother memory (ema, wilder).
#[derive(Debug, Clone, Copy, Default)]
pub struct SmootherState {
    pub value: Option<f64>,
    pub seen: usize,
}

#[derive(Debug, Clone)]
pub enum KernelState {
    Stateless,
    Window(WindowState),
    Smoother(SmootherState),
    Running { sum: f64 },
}

impl KernelState {
    pub fn for_step(spec: StateSpec, history: usize) -> Self {
        match spec {
            StateSpec::None => Self::Stateless,
            StateSpec::Window => Self::Window(WindowState::new(history)),
            StateSpec::Smoother => Self::Smoother(SmootherState::default()),
            StateSpec::Running => Self::Running { sum: 0.0 },
        }
    }
}

/// Per-lane evaluation state for one plan: one kernel state and one output
/// slot per step. Owned by exactly one evaluator and never shared.
#[derive(Debug, Clone)]
pub struct PlanState {
    kernels: Vec<KernelState>,
    slots: Vec<Slot>,
    last_ts_ns: Option<i64>,
}

impl PlanState {
    pub fn from_plan(plan: &EvalPlan) -> Self {
        let kernels = plan
            .steps
            .iter()
            .map(|step| match step {
                Step::Native { state, history, .. } => KernelState::for_step(*state, *history),
                _ => KernelState::Stateless,
            })
            .collect();
        Self {
            kernels,
            slots: vec![Ok(f64::NAN); plan.steps.len()],
            last_ts_ns: None,
        }
    }

    #[inline]
    pub fn last_ts_ns(&self) -> Option<i64> {
        self.last_ts_ns
    }

    #[inline]
    pub(crate) fn mark(&mut self, ts_ns: i64) {
        self.last_ts_ns = Some(ts_ns);
    }

    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> Slot {
        self.slots[idx]
    }

    #[inline]
    pub(crate) fn set_slot(&mut self, idx: usize, value: Slot) {
        self.slots[idx] = value;
    }

    #[inline]
    pub(crate) fn kernel_mut(&mut self, idx: usize) -> &mut KernelState {
        &mut self.kernels[idx]
    }

    pub fn reset(&mut self, plan: &EvalPlan) {
        *self = Self::from_plan(plan);
    }
}

/// Capacity of the ring a windowed step needs for its bound parameter.
pub fn history_for(spec: LookbackSpec, param: KernelParam) -> usize {
    match spec {
        LookbackSpec::One | LookbackSpec::Unbounded => 1,
        LookbackSpec::Fixed(n) => n,
        LookbackSpec::Param => param.count().unwrap_or(1),
        LookbackSpec::ParamPlusOne => param.count().map_or(1, |n| n + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_reports_evictions_and_lags() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push(1.0), None);
        assert_eq!(ring.push(2.0), None);
        assert_eq!(ring.push(3.0), None);
        assert_eq!(ring.push(4.0), Some(1.0));
        assert_eq!(ring.get_lag(0), Some(4.0));
        assert_eq!(ring.get_lag(2), Some(2.0));
        assert_eq!(ring.get_lag(3), None);
        assert_eq!(ring.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn window_tracks_sum_and_nulls_through_evictions() {
        let mut window = WindowState::new(2);
        window.push(Some(1.0));
        window.push(None);
        assert_eq!(window.nulls(), 1);
        assert_eq!(window.sum(), 1.0);
        window.push(Some(5.0));
        assert_eq!(window.nulls(), 1);
        assert_eq!(window.sum(), 5.0);
        window.push(Some(7.0));
        assert_eq!(window.nulls(), 0);
        assert_eq!(window.sum(), 12.0);
    }
}
