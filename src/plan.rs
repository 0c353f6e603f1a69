use crate::ops::{NativeOp, StateSpec};
use crate::types::{ParameterSnapshot, Preceding, RawField, SeriesKey};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelParam {
    None,
    Window(usize),
    Lag(usize),
}

impl KernelParam {
    #[inline]
    pub const fn window(self) -> Option<usize> {
        match self {
            Self::Window(window) => Some(window),
            _ => None,
        }
    }

    #[inline]
    pub const fn lag(self) -> Option<usize> {
        match self {
            Self::Lag(lag) => Some(lag),
            _ => None,
        }
    }

    #[inline]
    pub const fn count(self) -> Option<usize> {
        match self {
            Self::Window(n) | Self::Lag(n) => Some(n),
            Self::None => None,
        }
    }
}

/// Bars a step needs, counting the current one, before its output is fully warmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Warmup {
    Bars(usize),
    /// Recursive memory: every earlier bar influences the result.
    Unbounded,
}

impl Warmup {
    pub const ONE: Warmup = Warmup::Bars(1);

    #[inline]
    pub fn max(self, other: Warmup) -> Warmup {
        match (self, other) {
            (Self::Bars(a), Self::Bars(b)) => Self::Bars(a.max(b)),
            _ => Self::Unbounded,
        }
    }

    /// Extends a child's warm-up by `extra` additional bars of own history.
    #[inline]
    pub fn extend(self, extra: usize) -> Warmup {
        match self {
            Self::Bars(n) => Self::Bars(n.saturating_add(extra)),
            Self::Unbounded => Self::Unbounded,
        }
    }

    /// Bars that must be replayed before a restart point.
    #[inline]
    pub fn preceding(self) -> Preceding {
        match self {
            Self::Bars(n) => Preceding::Bars(n.saturating_sub(1)),
            Self::Unbounded => Preceding::All,
        }
    }
}

/// A dependency series the plan reads instead of re-evaluating its formula.
#[derive(Debug, Clone, PartialEq)]
pub struct RefBinding {
    pub name: String,
    /// Override values bound for this reference.
    pub overrides: BTreeMap<String, f64>,
    pub snapshot: ParameterSnapshot,
    pub series: SeriesKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Field(RawField),
    Const(f64),
    /// Index into [`EvalPlan::refs`].
    Ref(usize),
    Native {
        op: NativeOp,
        inputs: Vec<usize>,
        param: KernelParam,
        state: StateSpec,
        history: usize,
    },
}

/// Flattened, parameter-bound form of a compiled formula for one output series.
/// Steps are ordered so every input precedes its consumer; `root` is the output.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalPlan {
    pub series: SeriesKey,
    pub steps: Vec<Step>,
    pub root: usize,
    pub refs: Vec<RefBinding>,
    pub warmup: Warmup,
    pub manifest: PlanManifest,
}

impl EvalPlan {
    #[inline]
    pub fn preceding(&self) -> Preceding {
        self.warmup.preceding()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanManifest {
    pub step_count: usize,
    pub native_count: usize,
    /// Duplicate sub-expressions folded onto an existing step.
    pub cse_hit_count: usize,
    pub ref_count: usize,
}

impl PlanManifest {
    #[inline]
    pub fn summary_line(&self) -> String {
        format!(
            "steps={} natives={} cse_hits={} refs={}",
            self.step_count, self.native_count, self.cse_hit_count, self.ref_count
        )
    }
}
