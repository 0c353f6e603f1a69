#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Stateful over a bounded or unbounded history of its input.
    Window,
    /// Pure function of the current inputs.
    Elem,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    Sma,
    Ema,
    Wilder,
    Stdev,
    RollingMax,
    RollingMin,
    Diff,
    Shift,
    Cumsum,
    Abs,
    Max,
    Min,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
}

impl NativeOp {
    pub const COUNT: usize = Self::Neg as usize + 1;

    #[inline]
    pub const fn as_usize(self) -> usize {
        self as usize
    }
}

/// History a native function needs before it yields a warmed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookbackSpec {
    /// Current value only.
    One,
    /// Fixed number of points including the current one.
    Fixed(usize),
    /// `param` points including the current one.
    Param,
    /// `param + 1` points (e.g. shift by `n`).
    ParamPlusOne,
    /// Recursive smoother: every earlier point influences the result.
    Unbounded,
}
