use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error("catalog entry `{name}` version {version} already exists")]
    DuplicateName { name: String, version: u32 },
    #[error("catalog entry `{name}` must take at least one argument, got {arity}")]
    InvalidArity { name: String, arity: usize },
    #[error("unknown catalog function `{name}`")]
    UnknownFunction { name: String },
    #[error("no native implementation for `{name}`")]
    NoNativeImplementation { name: String },
    #[error("native function `{name}` takes {expected} args, entry declares {declared}")]
    NativeSignatureMismatch {
        name: String,
        expected: usize,
        declared: usize,
    },
    #[error("native function `{name}` has no parameter `{param}`")]
    NativeParameterMismatch { name: String, param: String },
    #[error("declarative entry `{name}` is invalid: {reason}")]
    InvalidTemplate { name: String, reason: String },
    #[error("invalid catalog entry name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("invalid expression `{expr}`: {reason}")]
    InvalidExpression { expr: String, reason: String },
    #[error("unresolved reference `{name}` in `{expr}`")]
    UnresolvedReference { name: String, expr: String },
    #[error("identifier `{name}` is ambiguous: matches {matches}")]
    AmbiguousIdentifier { name: String, matches: String },
    #[error("`{name}` requires {expected} args, got {actual}")]
    ArityMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("`{name}` is referenced by `{indicator}` but not declared as a dependency")]
    UndeclaredDependency { name: String, indicator: String },
    #[error("`{function}` has no parameter `{param}`")]
    UnknownParameter { function: String, param: String },
    #[error("invalid parameter `{param}` for `{function}`: {reason}")]
    InvalidParameter {
        function: String,
        param: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<String> },
    #[error("indicator `{from}` references unknown indicator `{name}`")]
    UnknownIndicator { from: String, name: String },
}

/// Failures binding a compiled formula to a concrete parameter snapshot.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BindError {
    #[error("unknown indicator `{name}`")]
    UnknownIndicator { name: String },
    #[error("indicator `{indicator}` has no parameter `{param}`")]
    UnknownParameter { indicator: String, param: String },
    #[error("parameter `{param}` of `{indicator}` is {value}: {reason}")]
    InvalidParameterValue {
        indicator: String,
        param: String,
        value: f64,
        reason: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("invalid definition `{name}`: {reason}")]
    InvalidDefinition { name: String, reason: String },
    #[error("indicator `{name}` is still referenced by {}", dependents.join(", "))]
    InUse {
        name: String,
        dependents: Vec<String>,
    },
    #[error("indicator `{id_or_name}` not found")]
    NotFound { id_or_name: String },
    #[error("invalid snapshot document: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("dependency `{dependency}` not materialized at ts={ts_ns}")]
    DependencyNotMaterialized { dependency: String, ts_ns: i64 },
    #[error("bar ts must be strictly increasing: current={current_ts_ns}, last={last_ts_ns}")]
    NonMonotonicBar { current_ts_ns: i64, last_ts_ns: i64 },
    #[error("bar {symbol}@{timeframe} does not belong to series {expected}")]
    ForeignBar {
        symbol: String,
        timeframe: String,
        expected: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("write of `{key}` failed: {reason}")]
    WriteFailed { key: String, reason: String },
    #[error("conflicting write for `{key}`: stored {existing:?}, attempted {attempted:?}")]
    ConflictingWrite {
        key: String,
        existing: Option<f64>,
        attempted: Option<f64>,
    },
    #[error("value for `{key}` is not finite: {value}")]
    InvalidValue { key: String, value: f64 },
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("bar for `{series}` at ts={ts_ns} is not after last ts={last_ts_ns}")]
    OutOfOrderBar {
        series: String,
        ts_ns: i64,
        last_ts_ns: i64,
    },
}

impl StoreError {
    /// Whether a retry at the write boundary may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteFailed { .. } | Self::Unavailable { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("batch cannot move from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}
