//! Native function layer.
//!
//! Extension path (minimal touch points):
//! 1) implement the kernel in `elem.rs` / `window.rs`,
//! 2) add the opcode in `spec.rs` and register meta in `catalog.rs` (`NATIVE_METAS`),
//! 3) add evaluator tests covering warm-up and null handling.

use crate::plan::KernelParam;
use crate::state::KernelState;
use crate::types::SkipReason;

/// Output of one step at one bar: a finite value or the reason it is null.
pub type Slot = Result<f64, SkipReason>;

/// Uniform native contract: consume this bar's inputs, update own state, emit one slot.
pub type Kernel = fn(state: &mut KernelState, inputs: &[Slot], p: KernelParam) -> Slot;

/// Kind of per-lane memory a native kernel keeps between bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateSpec {
    None,
    Window,
    Smoother,
    Running,
}

pub mod arg_spec;
pub mod catalog;
pub mod spec;

mod elem;
mod window;

pub use arg_spec::{NativeParam, ParamKind, ParamSpec};
pub use catalog::{
    CatalogEntry, CatalogEntryDef, FunctionCatalog, FunctionKind, Implementation,
    KernelParamSpec, NativeMeta, NativeRegistry,
};
pub use elem::{elem_abs, elem_add, elem_div, elem_max, elem_min, elem_mul, elem_neg, elem_pow, elem_sub};
pub use spec::{Domain, LookbackSpec, NativeOp};
pub use window::{
    win_cumsum, win_diff, win_ema, win_rolling_max, win_rolling_min, win_shift, win_sma,
    win_stdev, win_wilder,
};
