use crate::compile;
use crate::compile_expr::{self, ExprAst};
use crate::error::CatalogError;
use crate::ops::{
    self, Domain, Kernel, LookbackSpec, NativeOp, NativeParam, ParamKind, ParamSpec, StateSpec,
};
use crate::plan::KernelParam;
use crate::types::RawField;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

/// Category of the hidden entries that arithmetic operators lower to.
pub const OPERATOR_CATEGORY: &str = "operator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelParamSpec {
    /// Native does not consume a numeric setting.
    None,
    /// Native expects one `window`-kind setting.
    Window,
    /// Native expects one `lag`-kind setting.
    Lag,
}

impl KernelParamSpec {
    /// Converts the bound value of the native's only setting into a kernel param.
    #[inline]
    pub fn build(self, value: Option<f64>) -> Result<KernelParam, &'static str> {
        match self {
            Self::None => Ok(KernelParam::None),
            Self::Window => {
                let raw = value.ok_or("missing window")?;
                ops::arg_spec::positive_count(raw).map(KernelParam::Window)
            }
            Self::Lag => {
                let raw = value.ok_or("missing lag")?;
                ops::arg_spec::positive_count(raw).map(KernelParam::Lag)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NativeMeta {
    /// Catalog name of the builtin entry.
    pub name: &'static str,
    /// Opcode persisted into evaluation plans.
    pub op: NativeOp,
    pub domain: Domain,
    pub category: &'static str,
    pub description: &'static str,
    /// Number of positional series arguments.
    pub arity: usize,
    /// Keyword settings, in kernel order.
    pub params: &'static [NativeParam],
    pub param_spec: KernelParamSpec,
    /// History needed before the first fully-warmed output.
    pub lookback: LookbackSpec,
    pub state: StateSpec,
    pub kernel: Kernel,
    /// Whether the two inputs can be swapped when deduplicating plan steps.
    pub commutative: bool,
}

pub struct NativeRegistry;

impl NativeRegistry {
    pub fn get(name: &str) -> Option<&'static NativeMeta> {
        let index = NATIVE_INDEX.get_or_init(build_native_index);
        index.by_name.get(name).map(|idx| &NATIVE_METAS[*idx])
    }

    pub fn get_by_op(op: NativeOp) -> &'static NativeMeta {
        let index = NATIVE_INDEX.get_or_init(build_native_index);
        &NATIVE_METAS[index.by_op[op.as_usize()]]
    }

    pub fn all() -> &'static [NativeMeta] {
        &NATIVE_METAS
    }
}

struct NativeIndex {
    by_name: HashMap<&'static str, usize>,
    by_op: [usize; NATIVE_OP_COUNT],
}

static NATIVE_INDEX: OnceLock<NativeIndex> = OnceLock::new();
const MISSING_IDX: usize = usize::MAX;
const NATIVE_OP_COUNT: usize = NativeOp::COUNT;

fn build_native_index() -> NativeIndex {
    let mut by_name = HashMap::with_capacity(NATIVE_METAS.len());
    let mut by_op = [MISSING_IDX; NATIVE_OP_COUNT];

    for (idx, meta) in NATIVE_METAS.iter().enumerate() {
        validate_meta(meta);
        if by_name.insert(meta.name, idx).is_some() {
            panic!("duplicate native name in registry: {}", meta.name);
        }
        let op_slot = meta.op.as_usize();
        if by_op[op_slot] != MISSING_IDX {
            panic!("duplicate opcode in registry: {:?}", meta.op);
        }
        by_op[op_slot] = idx;
    }

    for (op_slot, idx) in by_op.iter().enumerate() {
        if *idx == MISSING_IDX {
            panic!("opcode slot not registered: {}", op_slot);
        }
    }

    NativeIndex { by_name, by_op }
}

fn validate_meta(meta: &NativeMeta) {
    if meta.arity == 0 {
        panic!("native `{}` must take at least one series", meta.name);
    }
    if meta.commutative && meta.arity != 2 {
        panic!("native `{}` is commutative but not binary", meta.name);
    }
    let expected_kind = match meta.param_spec {
        KernelParamSpec::None => None,
        KernelParamSpec::Window => Some(ParamKind::Window),
        KernelParamSpec::Lag => Some(ParamKind::Lag),
    };
    match (expected_kind, meta.params) {
        (None, []) => {}
        (Some(kind), [param]) if param.kind == kind => {}
        _ => panic!(
            "native `{}` has params {:?} incompatible with {:?}",
            meta.name, meta.params, meta.param_spec
        ),
    }
    let state_matches = match meta.state {
        StateSpec::None => {
            matches!(meta.domain, Domain::Elem) && matches!(meta.lookback, LookbackSpec::One)
        }
        StateSpec::Window => matches!(
            meta.lookback,
            LookbackSpec::Fixed(_) | LookbackSpec::Param | LookbackSpec::ParamPlusOne
        ),
        StateSpec::Smoother | StateSpec::Running => {
            matches!(meta.lookback, LookbackSpec::Unbounded)
        }
    };
    if !state_matches || (matches!(meta.domain, Domain::Window) == (meta.state == StateSpec::None))
    {
        panic!(
            "native `{}` has incompatible domain {:?}, state {:?} and lookback {:?}",
            meta.name, meta.domain, meta.state, meta.lookback
        );
    }
    if matches!(meta.lookback, LookbackSpec::Param | LookbackSpec::ParamPlusOne)
        && matches!(meta.param_spec, KernelParamSpec::None)
    {
        panic!(
            "native `{}` sizes its history from a param it does not take",
            meta.name
        );
    }
}

const PERIOD: &[NativeParam] = &[NativeParam {
    name: "period",
    kind: ParamKind::Window,
}];
const SHIFT_N: &[NativeParam] = &[NativeParam {
    name: "n",
    kind: ParamKind::Lag,
}];
const NO_PARAMS: &[NativeParam] = &[];

const fn window_period(
    name: &'static str,
    op: NativeOp,
    category: &'static str,
    description: &'static str,
    kernel: Kernel,
) -> NativeMeta {
    NativeMeta {
        name,
        op,
        domain: Domain::Window,
        category,
        description,
        arity: 1,
        params: PERIOD,
        param_spec: KernelParamSpec::Window,
        lookback: LookbackSpec::Param,
        state: StateSpec::Window,
        kernel,
        commutative: false,
    }
}

const fn smoother(
    name: &'static str,
    op: NativeOp,
    description: &'static str,
    kernel: Kernel,
) -> NativeMeta {
    NativeMeta {
        name,
        op,
        domain: Domain::Window,
        category: "overlap",
        description,
        arity: 1,
        params: PERIOD,
        param_spec: KernelParamSpec::Window,
        lookback: LookbackSpec::Unbounded,
        state: StateSpec::Smoother,
        kernel,
        commutative: false,
    }
}

const fn elem(
    name: &'static str,
    op: NativeOp,
    category: &'static str,
    arity: usize,
    kernel: Kernel,
    commutative: bool,
) -> NativeMeta {
    NativeMeta {
        name,
        op,
        domain: Domain::Elem,
        category,
        description: "",
        arity,
        params: NO_PARAMS,
        param_spec: KernelParamSpec::None,
        lookback: LookbackSpec::One,
        state: StateSpec::None,
        kernel,
        commutative,
    }
}

const NATIVE_METAS: [NativeMeta; NativeOp::COUNT] = [
    window_period(
        "sma",
        NativeOp::Sma,
        "overlap",
        "simple moving average",
        ops::win_sma,
    ),
    smoother(
        "ema",
        NativeOp::Ema,
        "exponential moving average, alpha = 2 / (period + 1)",
        ops::win_ema,
    ),
    smoother(
        "wilder",
        NativeOp::Wilder,
        "Wilder smoothing, alpha = 1 / period",
        ops::win_wilder,
    ),
    window_period(
        "stdev",
        NativeOp::Stdev,
        "volatility",
        "sample standard deviation",
        ops::win_stdev,
    ),
    window_period(
        "rolling_max",
        NativeOp::RollingMax,
        "volatility",
        "highest value in window",
        ops::win_rolling_max,
    ),
    window_period(
        "rolling_min",
        NativeOp::RollingMin,
        "volatility",
        "lowest value in window",
        ops::win_rolling_min,
    ),
    NativeMeta {
        name: "diff",
        op: NativeOp::Diff,
        domain: Domain::Window,
        category: "momentum",
        description: "x[t] - x[t-1]",
        arity: 1,
        params: NO_PARAMS,
        param_spec: KernelParamSpec::None,
        lookback: LookbackSpec::Fixed(2),
        state: StateSpec::Window,
        kernel: ops::win_diff,
        commutative: false,
    },
    NativeMeta {
        name: "shift",
        op: NativeOp::Shift,
        domain: Domain::Window,
        category: "momentum",
        description: "x[t-n]",
        arity: 1,
        params: SHIFT_N,
        param_spec: KernelParamSpec::Lag,
        lookback: LookbackSpec::ParamPlusOne,
        state: StateSpec::Window,
        kernel: ops::win_shift,
        commutative: false,
    },
    NativeMeta {
        name: "cumsum",
        op: NativeOp::Cumsum,
        domain: Domain::Window,
        category: "momentum",
        description: "running sum",
        arity: 1,
        params: NO_PARAMS,
        param_spec: KernelParamSpec::None,
        lookback: LookbackSpec::Unbounded,
        state: StateSpec::Running,
        kernel: ops::win_cumsum,
        commutative: false,
    },
    elem("abs", NativeOp::Abs, "math", 1, ops::elem_abs, false),
    elem("max", NativeOp::Max, "math", 2, ops::elem_max, true),
    elem("min", NativeOp::Min, "math", 2, ops::elem_min, true),
    elem("add", NativeOp::Add, OPERATOR_CATEGORY, 2, ops::elem_add, true),
    elem("sub", NativeOp::Sub, OPERATOR_CATEGORY, 2, ops::elem_sub, false),
    elem("mul", NativeOp::Mul, OPERATOR_CATEGORY, 2, ops::elem_mul, true),
    elem("div", NativeOp::Div, OPERATOR_CATEGORY, 2, ops::elem_div, false),
    elem("pow", NativeOp::Pow, OPERATOR_CATEGORY, 2, ops::elem_pow, false),
    elem("neg", NativeOp::Neg, OPERATOR_CATEGORY, 1, ops::elem_neg, false),
];

/// Wire form of a catalog entry as read from the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntryDef {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub arity: usize,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub implementation: Implementation,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Implementation {
    /// Backed by a builtin routine; `params` may only supply defaults.
    Native { routine: String },
    /// Formula template over `formals` and `params`.
    Declarative {
        formals: Vec<String>,
        expression: String,
    },
}

#[derive(Debug, Clone)]
pub enum FunctionKind {
    Native(NativeOp),
    Declarative {
        formals: Vec<String>,
        expression: String,
        template: Arc<ExprAst>,
        /// Catalog versions the template resolved to when it was registered.
        pins: BTreeMap<String, u32>,
    },
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub name: String,
    pub version: u32,
    pub arity: usize,
    pub category: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub kind: FunctionKind,
}

impl CatalogEntry {
    fn from_native(meta: &NativeMeta) -> Self {
        Self {
            name: meta.name.to_string(),
            version: 1,
            arity: meta.arity,
            category: meta.category.to_string(),
            description: meta.description.to_string(),
            params: meta.params.iter().map(|p| p.to_spec()).collect(),
            kind: FunctionKind::Native(meta.op),
        }
    }

    #[inline]
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    #[inline]
    pub fn is_operator(&self) -> bool {
        self.category == OPERATOR_CATEGORY
    }

    pub fn native(&self) -> Option<&'static NativeMeta> {
        match self.kind {
            FunctionKind::Native(op) => Some(NativeRegistry::get_by_op(op)),
            FunctionKind::Declarative { .. } => None,
        }
    }

    pub fn to_def(&self) -> CatalogEntryDef {
        let implementation = match &self.kind {
            FunctionKind::Native(op) => Implementation::Native {
                routine: NativeRegistry::get_by_op(*op).name.to_string(),
            },
            FunctionKind::Declarative {
                formals,
                expression,
                ..
            } => Implementation::Declarative {
                formals: formals.clone(),
                expression: expression.clone(),
            },
        };
        CatalogEntryDef {
            name: self.name.clone(),
            version: self.version,
            arity: self.arity,
            category: self.category.clone(),
            description: self.description.clone(),
            params: self.params.clone(),
            implementation,
        }
    }
}

/// Versioned map of named computation primitives. Published behind an `Arc`
/// and never mutated once shared; writers clone and swap.
#[derive(Debug, Clone, Default)]
pub struct FunctionCatalog {
    entries: BTreeMap<String, BTreeMap<u32, Arc<CatalogEntry>>>,
}

impl FunctionCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalog holding every builtin native at version 1.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::default();
        for meta in NativeRegistry::all() {
            let entry = CatalogEntry::from_native(meta);
            catalog
                .entries
                .entry(entry.name.clone())
                .or_default()
                .insert(entry.version, Arc::new(entry));
        }
        catalog
    }

    pub fn register(&mut self, def: CatalogEntryDef) -> Result<Arc<CatalogEntry>, CatalogError> {
        if def.arity == 0 {
            return Err(CatalogError::InvalidArity {
                name: def.name,
                arity: def.arity,
            });
        }
        self.check_name(&def.name)?;
        if self
            .entries
            .get(&def.name)
            .is_some_and(|versions| versions.contains_key(&def.version))
        {
            return Err(CatalogError::DuplicateName {
                name: def.name,
                version: def.version,
            });
        }

        let entry = match def.implementation {
            Implementation::Native { routine } => {
                let meta = NativeRegistry::get(&routine)
                    .filter(|meta| meta.category != OPERATOR_CATEGORY)
                    .ok_or_else(|| CatalogError::NoNativeImplementation {
                        name: routine.clone(),
                    })?;
                if meta.arity != def.arity {
                    return Err(CatalogError::NativeSignatureMismatch {
                        name: def.name,
                        expected: meta.arity,
                        declared: def.arity,
                    });
                }
                let mut params: Vec<ParamSpec> = meta.params.iter().map(|p| p.to_spec()).collect();
                for declared in def.params {
                    let Some(slot) = params.iter_mut().find(|p| p.name == declared.name) else {
                        return Err(CatalogError::NativeParameterMismatch {
                            name: def.name,
                            param: declared.name,
                        });
                    };
                    if let Some(default) = declared.default {
                        slot.kind.check(default).map_err(|reason| {
                            CatalogError::InvalidTemplate {
                                name: def.name.clone(),
                                reason: format!("default of `{}` {reason}", declared.name),
                            }
                        })?;
                    }
                    slot.default = declared.default;
                }
                CatalogEntry {
                    name: def.name,
                    version: def.version,
                    arity: def.arity,
                    category: def.category,
                    description: def.description,
                    params,
                    kind: FunctionKind::Native(meta.op),
                }
            }
            Implementation::Declarative {
                formals,
                expression,
            } => self.build_declarative(
                def.name,
                def.version,
                def.arity,
                def.category,
                def.description,
                def.params,
                formals,
                expression,
            )?,
        };

        let entry = Arc::new(entry);
        self.entries
            .entry(entry.name.clone())
            .or_default()
            .insert(entry.version, Arc::clone(&entry));
        Ok(entry)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_declarative(
        &self,
        name: String,
        version: u32,
        arity: usize,
        category: String,
        description: String,
        params: Vec<ParamSpec>,
        formals: Vec<String>,
        expression: String,
    ) -> Result<CatalogEntry, CatalogError> {
        let invalid = |reason: String| CatalogError::InvalidTemplate {
            name: name.clone(),
            reason,
        };
        if formals.len() != arity {
            return Err(invalid(format!(
                "declares {} formal arguments for arity {arity}",
                formals.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for local in formals.iter().chain(params.iter().map(|p| &p.name)) {
            if !compile_expr::is_valid_identifier(local) {
                return Err(invalid(format!("`{local}` is not a valid identifier")));
            }
            if !seen.insert(local.as_str()) {
                return Err(invalid(format!("`{local}` is declared twice")));
            }
        }
        for param in &params {
            if let Some(default) = param.default {
                param.kind.check(default).map_err(|reason| {
                    invalid(format!("default of `{}` {reason}", param.name))
                })?;
            }
        }
        let template =
            compile_expr::parse_expression(&expression).map_err(|err| invalid(err.to_string()))?;
        let mut entry = CatalogEntry {
            name: name.clone(),
            version,
            arity,
            category,
            description,
            params,
            kind: FunctionKind::Declarative {
                formals,
                expression,
                template: Arc::new(template),
                pins: BTreeMap::new(),
            },
        };
        let resolved = compile::check_template(self, &entry).map_err(|err| invalid(err.to_string()))?;
        if let FunctionKind::Declarative { pins, .. } = &mut entry.kind {
            *pins = resolved;
        }
        Ok(entry)
    }

    fn check_name(&self, name: &str) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        if !compile_expr::is_valid_identifier(name) {
            return Err(invalid("not a valid identifier"));
        }
        if RawField::from_name(name).is_some() {
            return Err(invalid("collides with a raw field"));
        }
        if self.latest(name).is_some_and(|entry| entry.is_operator()) {
            return Err(invalid("reserved for an arithmetic operator"));
        }
        Ok(())
    }

    /// Latest published version of `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<CatalogEntry>, CatalogError> {
        self.latest(name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownFunction {
                name: name.to_string(),
            })
    }

    pub fn resolve_version(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Arc<CatalogEntry>, CatalogError> {
        self.entries
            .get(name)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| CatalogError::UnknownFunction {
                name: format!("{name}@v{version}"),
            })
    }

    #[inline]
    fn latest(&self, name: &str) -> Option<&Arc<CatalogEntry>> {
        self.entries
            .get(name)
            .and_then(|versions| versions.values().next_back())
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Every entry version that did not come from the builtin table.
    pub fn registered_defs(&self) -> Vec<CatalogEntryDef> {
        self.entries
            .values()
            .flat_map(|versions| versions.values())
            .filter(|entry| {
                !(entry.version == 1
                    && matches!(entry.kind, FunctionKind::Native(op) if NativeRegistry::get_by_op(op).name == entry.name))
            })
            .map(|entry| entry.to_def())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
