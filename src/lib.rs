pub mod cache;
pub mod compile;
mod compile_expr;
pub mod config;
pub mod error;
pub mod ops;
pub mod plan;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod types;

pub use cache::{Admission, ComputationCache};
pub use compile::{CallBody, CatalogPlanner, CompiledFormula, FormulaStep, Node, Planner};
pub use compile_expr::{parse_expression, ExprAst};
pub use config::{EngineConfig, SchedulerConfig, WriteRetryConfig};
pub use error::{
    BindError, CatalogError, CompileError, ConfigError, EvalError, RegistrationError,
    ResolveError, SchedulerError, StoreError,
};
pub use ops::{CatalogEntry, CatalogEntryDef, FunctionCatalog, Implementation};
pub use registry::{IndicatorDefinition, Registry, RegistryDocument, RegistrySnapshot};
pub use resolver::{DependencyGraph, DependencyOrder};
pub use runtime::{evaluate, DependencyValues, Evaluator, NoDependencies, WindowEvaluator};
pub use scheduler::{
    BatchEvent, BatchReport, BatchState, CancellationToken, EventSink, IndicatorOutcome,
    MemoryEventSink, Scheduler, WorkRequest,
};
pub use store::{
    BarSource, InMemoryBarSource, InMemoryResultStore, ResultStore, RetryingWriter, UpsertOutcome,
};
pub use types::{
    Bar, ComputationKey, Evaluated, IndicatorValue, ParameterSnapshot, RawField, SeriesKey,
    SkipReason, TimeRange, Timeframe,
};

#[cfg(test)]
mod tests;
