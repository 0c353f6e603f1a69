use crate::compile_expr::{parse_expression, BinaryOp, ExprAst, UnaryOp};
use crate::error::{BindError, CompileError};
use crate::ops::{CatalogEntry, FunctionCatalog, FunctionKind, LookbackSpec, NativeMeta};
use crate::plan::{EvalPlan, KernelParam, PlanManifest, RefBinding, Step, Warmup};
use crate::state::history_for;
use crate::types::{ParameterSnapshot, RawField, SeriesKey, Timeframe};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

/// Upper bound on tree nodes contributed by step references in one formula.
pub const MAX_EXPANDED_NODES: usize = 65_536;

pub trait Planner {
    fn compile(
        &self,
        source: &FormulaSource<'_>,
        indicators: &dyn IndicatorLookup,
    ) -> Result<CompiledFormula, CompileError>;
    fn bind(
        &self,
        compiled: &CompiledFormula,
        target: BindTarget,
        refs: &dyn RefBinder,
    ) -> Result<EvalPlan, BindError>;
}

/// Indicator definitions visible to the compiler: name to declared parameters.
pub trait IndicatorLookup {
    fn indicator_parameters(&self, name: &str) -> Option<&BTreeMap<String, f64>>;
}

impl IndicatorLookup for BTreeMap<String, BTreeMap<String, f64>> {
    fn indicator_parameters(&self, name: &str) -> Option<&BTreeMap<String, f64>> {
        self.get(name)
    }
}

/// Resolves an indicator reference with bound overrides to the version and
/// parameter snapshot of the dependency series it reads.
pub trait RefBinder {
    fn bind_ref(
        &self,
        name: &str,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<(u32, ParameterSnapshot), BindError>;
}

/// Named intermediate series. Later steps and the formula read it by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaStep {
    pub name: String,
    pub expr: String,
}

impl FormulaStep {
    pub fn new(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormulaSource<'a> {
    pub name: &'a str,
    pub formula: &'a str,
    pub dependencies: &'a [String],
    pub parameters: &'a BTreeMap<String, f64>,
    /// Compiled in order before the formula; each sees the ones before it.
    pub steps: &'a [FormulaStep],
}

/// Where a compiled formula is bound: one output series.
#[derive(Debug, Clone)]
pub struct BindTarget {
    pub symbol: Arc<str>,
    pub timeframe: Timeframe,
    pub indicator: Arc<str>,
    pub version: u32,
    pub snapshot: ParameterSnapshot,
}

/// Numeric setting that is either fixed at compile time or bound from the
/// parameter snapshot when a plan is built.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Number(f64),
    Param(String),
}

/// Compiled formula tree. Closed set of four tags.
#[derive(Debug, Clone)]
pub enum Node {
    RawField(RawField),
    FunctionCall {
        entry: Arc<CatalogEntry>,
        args: Vec<Node>,
        params: BTreeMap<String, Scalar>,
        body: CallBody,
    },
    IndicatorRef {
        name: String,
        overrides: BTreeMap<String, Scalar>,
    },
    Literal(Scalar),
}

/// What a call evaluates to: a native kernel, or the template body of a
/// declarative entry inlined over the call's arguments.
#[derive(Debug, Clone)]
pub enum CallBody {
    Native(&'static NativeMeta),
    Inlined(Box<Node>),
}

impl Node {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RawField(_) => "raw_field",
            Self::FunctionCall { .. } => "function_call",
            Self::IndicatorRef { .. } => "indicator_ref",
            Self::Literal(_) => "literal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFormula {
    pub source: String,
    pub root: Node,
    /// Indicators the formula reads.
    pub references: BTreeSet<String>,
    /// Catalog entries called directly by the formula, with the version resolved.
    pub functions: BTreeMap<String, u32>,
    pub manifest: CompileManifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileManifest {
    pub node_count: usize,
    pub function_call_count: usize,
    /// Declarative calls expanded in place.
    pub inlined_count: usize,
    /// Operators over literal numbers folded at compile time.
    pub folded_count: usize,
    pub reference_count: usize,
    pub step_count: usize,
    pub compile_time_us: u64,
}

impl CompileManifest {
    #[inline]
    pub fn summary_line(&self) -> String {
        format!(
            "nodes={} calls={} inlined={} folded={} refs={} steps={} compile_us={}",
            self.node_count,
            self.function_call_count,
            self.inlined_count,
            self.folded_count,
            self.reference_count,
            self.step_count,
            self.compile_time_us
        )
    }
}

#[derive(Debug, Clone)]
pub struct CatalogPlanner {
    catalog: Arc<FunctionCatalog>,
}

impl CatalogPlanner {
    pub fn new(catalog: Arc<FunctionCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<FunctionCatalog> {
        &self.catalog
    }
}

impl Planner for CatalogPlanner {
    fn compile(
        &self,
        source: &FormulaSource<'_>,
        indicators: &dyn IndicatorLookup,
    ) -> Result<CompiledFormula, CompileError> {
        compile_formula(&self.catalog, indicators, source)
    }

    fn bind(
        &self,
        compiled: &CompiledFormula,
        target: BindTarget,
        refs: &dyn RefBinder,
    ) -> Result<EvalPlan, BindError> {
        bind_plan(compiled, target, refs)
    }
}

pub fn compile_formula(
    catalog: &FunctionCatalog,
    indicators: &dyn IndicatorLookup,
    source: &FormulaSource<'_>,
) -> Result<CompiledFormula, CompileError> {
    let started_at = Instant::now();
    let ast = parse_expression(source.formula)?;

    for dep in source.dependencies {
        let known = RawField::from_name(dep).is_some()
            || catalog.contains(dep)
            || indicators.indicator_parameters(dep).is_some();
        if !known {
            return Err(CompileError::UnresolvedReference {
                name: dep.clone(),
                expr: source.formula.to_string(),
            });
        }
    }
    let declared: BTreeSet<String> = source.dependencies.iter().cloned().collect();

    let params: BTreeMap<String, Scalar> = source
        .parameters
        .keys()
        .map(|name| (name.clone(), Scalar::Param(name.clone())))
        .collect();

    let mut stats = LowerStats::default();
    let mut references = BTreeSet::new();
    let mut functions = BTreeMap::new();
    let mut locals: BTreeMap<String, Local> = BTreeMap::new();
    for step in source.steps {
        let step_ast = parse_expression(&step.expr)?;
        let local = {
            let mut ctx = LowerCtx {
                expr: &step.expr,
                owner: source.name,
                catalog,
                params: params.clone(),
                formals: BTreeMap::new(),
                pins: None,
                indicators: Some(indicators),
                declared: Some(&declared),
                locals: Some(&locals),
                references: &mut references,
                functions: &mut functions,
                stats: &mut stats,
            };
            let taken = ctx.categories(&step.name);
            if !taken.is_empty() {
                let mut matches: Vec<&str> = taken.iter().map(|(label, _)| *label).collect();
                matches.push("step");
                return Err(CompileError::AmbiguousIdentifier {
                    name: step.name.clone(),
                    matches: matches.join(", "),
                });
            }
            let node = ctx.lower(&step_ast)?;
            Local {
                size: tree_size(&node),
                node,
            }
        };
        locals.insert(step.name.clone(), local);
    }

    let root = {
        let mut ctx = LowerCtx {
            expr: source.formula,
            owner: source.name,
            catalog,
            params,
            formals: BTreeMap::new(),
            pins: None,
            indicators: Some(indicators),
            declared: Some(&declared),
            locals: Some(&locals),
            references: &mut references,
            functions: &mut functions,
            stats: &mut stats,
        };
        ctx.lower(&ast)?
    };

    let manifest = CompileManifest {
        node_count: stats.node_count,
        function_call_count: stats.function_call_count,
        inlined_count: stats.inlined_count,
        folded_count: stats.folded_count,
        reference_count: references.len(),
        step_count: source.steps.len(),
        compile_time_us: started_at.elapsed().as_micros() as u64,
    };
    if compile_manifest_debug_enabled() {
        debug!(indicator = source.name, summary = %manifest.summary_line(), "compiled formula");
    }
    Ok(CompiledFormula {
        source: source.formula.to_string(),
        root,
        references,
        functions,
        manifest,
    })
}

/// Validates a declarative template against the catalog as it is now and
/// returns the entry versions the template resolved to.
pub(crate) fn check_template(
    catalog: &FunctionCatalog,
    entry: &CatalogEntry,
) -> Result<BTreeMap<String, u32>, CompileError> {
    let FunctionKind::Declarative {
        formals,
        expression,
        template,
        ..
    } = &entry.kind
    else {
        return Ok(BTreeMap::new());
    };
    let mut stats = LowerStats::default();
    let mut references = BTreeSet::new();
    let mut functions = BTreeMap::new();
    let mut ctx = LowerCtx {
        expr: expression,
        owner: &entry.name,
        catalog,
        params: entry
            .params
            .iter()
            .map(|p| (p.name.clone(), Scalar::Param(p.name.clone())))
            .collect(),
        // Any series stands in for the formal arguments while checking.
        formals: formals
            .iter()
            .map(|name| (name.clone(), Node::RawField(RawField::Close)))
            .collect(),
        pins: None,
        indicators: None,
        declared: None,
        locals: None,
        references: &mut references,
        functions: &mut functions,
        stats: &mut stats,
    };
    ctx.lower(template)?;
    Ok(functions)
}

#[inline]
fn compile_manifest_debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("INDICATOR_ENGINE_COMPILE_DEBUG")
            .ok()
            .map(|raw| {
                let v = raw.trim().to_ascii_lowercase();
                matches!(v.as_str(), "1" | "true" | "yes" | "on")
            })
            .unwrap_or(false)
    })
}

#[derive(Debug, Default)]
struct LowerStats {
    node_count: usize,
    function_call_count: usize,
    inlined_count: usize,
    folded_count: usize,
    /// Nodes copied in by step references.
    expanded_nodes: usize,
}

/// A compiled step and the size of its tree.
struct Local {
    node: Node,
    size: usize,
}

fn tree_size(node: &Node) -> usize {
    match node {
        Node::FunctionCall { args, body, .. } => {
            let body_size = match body {
                CallBody::Native(_) => 0,
                CallBody::Inlined(inlined) => tree_size(inlined),
            };
            1 + body_size + args.iter().map(tree_size).sum::<usize>()
        }
        Node::RawField(_) | Node::IndicatorRef { .. } | Node::Literal(_) => 1,
    }
}

enum Category<'l> {
    RawField(RawField),
    Function(Arc<CatalogEntry>),
    Indicator,
    Param(Scalar),
    Formal(Node),
    Local(&'l Local),
}

struct LowerCtx<'a> {
    expr: &'a str,
    owner: &'a str,
    catalog: &'a FunctionCatalog,
    /// Parameter names in scope and the scalar each one stands for.
    params: BTreeMap<String, Scalar>,
    /// Template formal arguments bound to the call's argument subtrees.
    formals: BTreeMap<String, Node>,
    /// Set inside a template: catalog names resolve to these versions only.
    pins: Option<&'a BTreeMap<String, u32>>,
    indicators: Option<&'a dyn IndicatorLookup>,
    /// Set for indicator formulas: catalog functions and indicators must be listed.
    declared: Option<&'a BTreeSet<String>>,
    /// Steps compiled before the expression being lowered.
    locals: Option<&'a BTreeMap<String, Local>>,
    references: &'a mut BTreeSet<String>,
    functions: &'a mut BTreeMap<String, u32>,
    stats: &'a mut LowerStats,
}

impl<'a> LowerCtx<'a> {
    fn lower(&mut self, ast: &ExprAst) -> Result<Node, CompileError> {
        let node = match ast {
            ExprAst::Number(value) => Node::Literal(Scalar::Number(*value)),
            ExprAst::Identifier(name) => self.lower_identifier(name)?,
            ExprAst::Call { name, args, kwargs } => self.lower_call(name, args, kwargs)?,
            ExprAst::Unary { op, expr } => self.lower_unary(*op, expr)?,
            ExprAst::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs)?,
        };
        self.stats.node_count += 1;
        Ok(node)
    }

    fn resolve_function(&self, name: &str) -> Option<Arc<CatalogEntry>> {
        match self.pins {
            Some(pins) => pins
                .get(name)
                .and_then(|version| self.catalog.resolve_version(name, *version).ok()),
            None => self.catalog.resolve(name).ok(),
        }
    }

    /// Every category `name` falls into, labelled.
    fn categories(&self, name: &str) -> Vec<(&'static str, Category<'a>)> {
        let mut found: Vec<(&'static str, Category<'a>)> = Vec::new();
        if let Some(field) = RawField::from_name(name) {
            found.push(("raw field", Category::RawField(field)));
        }
        if let Some(entry) = self.resolve_function(name) {
            found.push(("catalog function", Category::Function(entry)));
        }
        if self
            .indicators
            .is_some_and(|lookup| lookup.indicator_parameters(name).is_some())
        {
            found.push(("indicator", Category::Indicator));
        }
        if let Some(scalar) = self.params.get(name) {
            found.push(("parameter", Category::Param(scalar.clone())));
        }
        if let Some(node) = self.formals.get(name) {
            found.push(("argument", Category::Formal(node.clone())));
        }
        if let Some(local) = self.locals.and_then(|locals| locals.get(name)) {
            found.push(("step", Category::Local(local)));
        }
        found
    }

    fn classify(&self, name: &str) -> Result<Category<'a>, CompileError> {
        let mut found = self.categories(name);
        match found.len() {
            0 => Err(CompileError::UnresolvedReference {
                name: name.to_string(),
                expr: self.expr.to_string(),
            }),
            1 => Ok(found.remove(0).1),
            _ => Err(CompileError::AmbiguousIdentifier {
                name: name.to_string(),
                matches: found
                    .iter()
                    .map(|(label, _)| *label)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    fn check_declared(&self, name: &str) -> Result<(), CompileError> {
        match self.declared {
            Some(declared) if !declared.contains(name) => {
                Err(CompileError::UndeclaredDependency {
                    name: name.to_string(),
                    indicator: self.owner.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    fn lower_identifier(&mut self, name: &str) -> Result<Node, CompileError> {
        match self.classify(name)? {
            Category::RawField(field) => Ok(Node::RawField(field)),
            Category::Param(scalar) => Ok(Node::Literal(scalar)),
            Category::Formal(node) => Ok(node),
            Category::Local(local) => {
                self.stats.expanded_nodes += local.size;
                if self.stats.expanded_nodes > MAX_EXPANDED_NODES {
                    return Err(CompileError::InvalidExpression {
                        expr: self.expr.to_string(),
                        reason: format!("steps expand to more than {MAX_EXPANDED_NODES} nodes"),
                    });
                }
                Ok(local.node.clone())
            }
            Category::Indicator => {
                self.lower_indicator_ref(name, &[], &BTreeMap::new())
            }
            Category::Function(entry) => Err(CompileError::ArityMismatch {
                name: entry.name.clone(),
                expected: entry.arity,
                actual: 0,
            }),
        }
    }

    fn lower_call(
        &mut self,
        name: &str,
        args: &[ExprAst],
        kwargs: &BTreeMap<String, ExprAst>,
    ) -> Result<Node, CompileError> {
        match self.classify(name)? {
            Category::Function(entry) => self.lower_function_call(entry, args, kwargs),
            Category::Indicator => self.lower_indicator_ref(name, args, kwargs),
            Category::RawField(_)
            | Category::Param(_)
            | Category::Formal(_)
            | Category::Local(_) => {
                Err(CompileError::InvalidExpression {
                    expr: self.expr.to_string(),
                    reason: format!("`{name}` is not callable"),
                })
            }
        }
    }

    fn lower_function_call(
        &mut self,
        entry: Arc<CatalogEntry>,
        args: &[ExprAst],
        kwargs: &BTreeMap<String, ExprAst>,
    ) -> Result<Node, CompileError> {
        if !entry.is_operator() {
            self.check_declared(&entry.name)?;
        }
        if args.len() != entry.arity {
            return Err(CompileError::ArityMismatch {
                name: entry.name.clone(),
                expected: entry.arity,
                actual: args.len(),
            });
        }
        let mut lowered_args = Vec::with_capacity(args.len());
        for arg in args {
            lowered_args.push(self.lower(arg)?);
        }
        let params = self.lower_call_params(&entry, kwargs)?;
        self.functions.insert(entry.name.clone(), entry.version);
        self.stats.function_call_count += 1;

        let body = match &entry.kind {
            FunctionKind::Native(_) => match entry.native() {
                Some(meta) => CallBody::Native(meta),
                None => {
                    return Err(CompileError::UnresolvedReference {
                        name: entry.name.clone(),
                        expr: self.expr.to_string(),
                    })
                }
            },
            FunctionKind::Declarative {
                formals,
                expression,
                template,
                pins,
            } => {
                self.stats.inlined_count += 1;
                let mut nested_functions = BTreeMap::new();
                let mut nested_refs = BTreeSet::new();
                let mut nested = LowerCtx {
                    expr: expression,
                    owner: &entry.name,
                    catalog: self.catalog,
                    params: params.clone(),
                    formals: formals
                        .iter()
                        .cloned()
                        .zip(lowered_args.iter().cloned())
                        .collect(),
                    pins: Some(pins),
                    indicators: None,
                    declared: None,
                    locals: None,
                    references: &mut nested_refs,
                    functions: &mut nested_functions,
                    stats: &mut *self.stats,
                };
                CallBody::Inlined(Box::new(nested.lower(template)?))
            }
        };

        Ok(Node::FunctionCall {
            entry,
            args: lowered_args,
            params,
            body,
        })
    }

    fn lower_call_params(
        &mut self,
        entry: &CatalogEntry,
        kwargs: &BTreeMap<String, ExprAst>,
    ) -> Result<BTreeMap<String, Scalar>, CompileError> {
        let mut bound = BTreeMap::new();
        for (key, value) in kwargs {
            let Some(spec) = entry.param(key) else {
                return Err(CompileError::UnknownParameter {
                    function: entry.name.clone(),
                    param: key.clone(),
                });
            };
            let scalar = self.lower_scalar(&entry.name, key, value)?;
            if let Scalar::Number(number) = scalar {
                spec.kind
                    .check(number)
                    .map_err(|reason| CompileError::InvalidParameter {
                        function: entry.name.clone(),
                        param: key.clone(),
                        reason: reason.to_string(),
                    })?;
            }
            bound.insert(key.clone(), scalar);
        }
        for spec in &entry.params {
            if bound.contains_key(&spec.name) {
                continue;
            }
            let Some(default) = spec.default else {
                return Err(CompileError::InvalidParameter {
                    function: entry.name.clone(),
                    param: spec.name.clone(),
                    reason: "missing required value".to_string(),
                });
            };
            bound.insert(spec.name.clone(), Scalar::Number(default));
        }
        Ok(bound)
    }

    /// Keyword values are numbers, negated numbers, or parameter names in scope.
    fn lower_scalar(
        &self,
        function: &str,
        param: &str,
        ast: &ExprAst,
    ) -> Result<Scalar, CompileError> {
        let invalid = |reason: &str| CompileError::InvalidParameter {
            function: function.to_string(),
            param: param.to_string(),
            reason: reason.to_string(),
        };
        match ast {
            ExprAst::Number(value) => Ok(Scalar::Number(*value)),
            ExprAst::Unary { op, expr } => match (op, expr.as_ref()) {
                (UnaryOp::Minus, ExprAst::Number(value)) => Ok(Scalar::Number(-*value)),
                (UnaryOp::Plus, ExprAst::Number(value)) => Ok(Scalar::Number(*value)),
                _ => Err(invalid("must be a number or a parameter name")),
            },
            ExprAst::Identifier(name) => match self.classify(name)? {
                Category::Param(scalar) => Ok(scalar),
                _ => Err(invalid("must be a number or a parameter name")),
            },
            _ => Err(invalid("must be a number or a parameter name")),
        }
    }

    fn lower_indicator_ref(
        &mut self,
        name: &str,
        args: &[ExprAst],
        kwargs: &BTreeMap<String, ExprAst>,
    ) -> Result<Node, CompileError> {
        if !args.is_empty() {
            return Err(CompileError::InvalidExpression {
                expr: self.expr.to_string(),
                reason: format!("indicator `{name}` takes keyword overrides only"),
            });
        }
        self.check_declared(name)?;
        let known = self
            .indicators
            .and_then(|lookup| lookup.indicator_parameters(name))
            .ok_or_else(|| CompileError::UnresolvedReference {
                name: name.to_string(),
                expr: self.expr.to_string(),
            })?;
        let mut overrides = BTreeMap::new();
        for (key, value) in kwargs {
            if !known.contains_key(key) {
                return Err(CompileError::UnknownParameter {
                    function: name.to_string(),
                    param: key.clone(),
                });
            }
            overrides.insert(key.clone(), self.lower_scalar(name, key, value)?);
        }
        self.references.insert(name.to_string());
        Ok(Node::IndicatorRef {
            name: name.to_string(),
            overrides,
        })
    }

    fn lower_unary(&mut self, op: UnaryOp, inner: &ExprAst) -> Result<Node, CompileError> {
        let operand = self.lower(inner)?;
        match op {
            UnaryOp::Plus => Ok(operand),
            UnaryOp::Minus => {
                if let Node::Literal(Scalar::Number(value)) = operand {
                    self.stats.folded_count += 1;
                    return Ok(Node::Literal(Scalar::Number(-value)));
                }
                self.operator_call("neg", vec![operand])
            }
        }
    }

    fn lower_binary(
        &mut self,
        op: BinaryOp,
        lhs: &ExprAst,
        rhs: &ExprAst,
    ) -> Result<Node, CompileError> {
        let lhs = self.lower(lhs)?;
        let rhs = self.lower(rhs)?;
        if let (Node::Literal(Scalar::Number(a)), Node::Literal(Scalar::Number(b))) = (&lhs, &rhs)
        {
            if let Some(value) = fold_binary(op, *a, *b) {
                self.stats.folded_count += 1;
                return Ok(Node::Literal(Scalar::Number(value)));
            }
        }
        let name = match op {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
        };
        self.operator_call(name, vec![lhs, rhs])
    }

    fn operator_call(&mut self, name: &str, args: Vec<Node>) -> Result<Node, CompileError> {
        let (entry, meta) = self
            .catalog
            .resolve(name)
            .ok()
            .filter(|entry| entry.is_operator())
            .and_then(|entry| entry.native().map(|meta| (entry, meta)))
            .ok_or_else(|| CompileError::UnresolvedReference {
                name: name.to_string(),
                expr: self.expr.to_string(),
            })?;
        self.stats.function_call_count += 1;
        Ok(Node::FunctionCall {
            entry,
            args,
            params: BTreeMap::new(),
            body: CallBody::Native(meta),
        })
    }
}

/// Folds operators over two literals unless the runtime would emit a skip.
fn fold_binary(op: BinaryOp, a: f64, b: f64) -> Option<f64> {
    let value = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div if b == 0.0 => return None,
        BinaryOp::Div => a / b,
        BinaryOp::Pow if a < 0.0 && b.fract() != 0.0 => return None,
        BinaryOp::Pow => a.powf(b),
    };
    value.is_finite().then_some(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum StepSignature {
    Field(RawField),
    Const(u64),
    Ref(SeriesKey),
    Native {
        op: crate::ops::NativeOp,
        inputs: Vec<usize>,
        param: KernelParam,
    },
}

pub fn bind_plan(
    compiled: &CompiledFormula,
    target: BindTarget,
    refs: &dyn RefBinder,
) -> Result<EvalPlan, BindError> {
    let series = SeriesKey {
        symbol: Arc::clone(&target.symbol),
        timeframe: target.timeframe,
        indicator: Arc::clone(&target.indicator),
        version: target.version,
        params: target.snapshot.hash(),
    };
    let mut ctx = BindCtx {
        target: &target,
        refs,
        steps: Vec::new(),
        warmups: Vec::new(),
        ref_bindings: Vec::new(),
        step_by_sig: HashMap::new(),
        cse_hit_count: 0,
    };
    let root = ctx.bind_node(&compiled.root)?;
    let warmup = ctx.warmups[root];
    let manifest = PlanManifest {
        step_count: ctx.steps.len(),
        native_count: ctx
            .steps
            .iter()
            .filter(|step| matches!(step, Step::Native { .. }))
            .count(),
        cse_hit_count: ctx.cse_hit_count,
        ref_count: ctx.ref_bindings.len(),
    };
    Ok(EvalPlan {
        series,
        steps: ctx.steps,
        root,
        refs: ctx.ref_bindings,
        warmup,
        manifest,
    })
}

struct BindCtx<'a> {
    target: &'a BindTarget,
    refs: &'a dyn RefBinder,
    steps: Vec<Step>,
    warmups: Vec<Warmup>,
    ref_bindings: Vec<RefBinding>,
    step_by_sig: HashMap<StepSignature, usize>,
    cse_hit_count: usize,
}

impl<'a> BindCtx<'a> {
    fn bind_node(&mut self, node: &Node) -> Result<usize, BindError> {
        match node {
            Node::RawField(field) => Ok(self.push_step(
                StepSignature::Field(*field),
                Step::Field(*field),
                Warmup::ONE,
            )),
            Node::Literal(scalar) => {
                let value = self.scalar_value(scalar, None)?;
                Ok(self.push_step(
                    StepSignature::Const(value.to_bits()),
                    Step::Const(value),
                    Warmup::ONE,
                ))
            }
            Node::IndicatorRef { name, overrides } => self.bind_ref(name, overrides),
            Node::FunctionCall {
                body: CallBody::Inlined(body),
                ..
            } => self.bind_node(body),
            Node::FunctionCall {
                args,
                params,
                body: CallBody::Native(meta),
                ..
            } => self.bind_native(meta, args, params),
        }
    }

    fn scalar_value(&self, scalar: &Scalar, kind: Option<crate::ops::ParamKind>) -> Result<f64, BindError> {
        let (param, value) = match scalar {
            Scalar::Number(value) => return Ok(*value),
            Scalar::Param(name) => {
                let value = self.target.snapshot.get(name).ok_or_else(|| {
                    BindError::UnknownParameter {
                        indicator: self.target.indicator.to_string(),
                        param: name.clone(),
                    }
                })?;
                (name, value)
            }
        };
        kind.unwrap_or(crate::ops::ParamKind::Real)
            .check(value)
            .map_err(|reason| BindError::InvalidParameterValue {
                indicator: self.target.indicator.to_string(),
                param: param.clone(),
                value,
                reason,
            })
    }

    fn bind_ref(
        &mut self,
        name: &str,
        overrides: &BTreeMap<String, Scalar>,
    ) -> Result<usize, BindError> {
        let mut values = BTreeMap::new();
        for (key, scalar) in overrides {
            values.insert(key.clone(), self.scalar_value(scalar, None)?);
        }
        let (version, snapshot) = self.refs.bind_ref(name, &values)?;
        let series = SeriesKey {
            symbol: Arc::clone(&self.target.symbol),
            timeframe: self.target.timeframe,
            indicator: Arc::from(name),
            version,
            params: snapshot.hash(),
        };
        let sig = StepSignature::Ref(series.clone());
        if let Some(&idx) = self.step_by_sig.get(&sig) {
            self.cse_hit_count += 1;
            return Ok(idx);
        }
        let ref_idx = self.ref_bindings.len();
        self.ref_bindings.push(RefBinding {
            name: name.to_string(),
            overrides: values,
            snapshot,
            series,
        });
        Ok(self.push_step(sig, Step::Ref(ref_idx), Warmup::ONE))
    }

    fn bind_native(
        &mut self,
        meta: &NativeMeta,
        args: &[Node],
        params: &BTreeMap<String, Scalar>,
    ) -> Result<usize, BindError> {
        let mut inputs = Vec::with_capacity(args.len());
        for arg in args {
            inputs.push(self.bind_node(arg)?);
        }
        let setting = match meta.params.first() {
            Some(native_param) => {
                let scalar = params.get(native_param.name).ok_or_else(|| {
                    BindError::UnknownParameter {
                        indicator: self.target.indicator.to_string(),
                        param: native_param.name.to_string(),
                    }
                })?;
                Some(self.scalar_value(scalar, Some(native_param.kind))?)
            }
            None => None,
        };
        let param = meta
            .param_spec
            .build(setting)
            .map_err(|reason| BindError::InvalidParameterValue {
                indicator: self.target.indicator.to_string(),
                param: meta.params.first().map_or("", |p| p.name).to_string(),
                value: setting.unwrap_or(f64::NAN),
                reason,
            })?;

        let child = inputs
            .iter()
            .map(|idx| self.warmups[*idx])
            .fold(Warmup::ONE, Warmup::max);
        let warmup = match meta.lookback {
            LookbackSpec::One => child,
            LookbackSpec::Fixed(n) => child.extend(n.saturating_sub(1)),
            LookbackSpec::Param => child.extend(param.count().unwrap_or(1).saturating_sub(1)),
            LookbackSpec::ParamPlusOne => child.extend(param.count().unwrap_or(1)),
            LookbackSpec::Unbounded => Warmup::Unbounded,
        };

        let mut sig_inputs = inputs.clone();
        if meta.commutative {
            sig_inputs.sort_unstable();
        }
        let sig = StepSignature::Native {
            op: meta.op,
            inputs: sig_inputs,
            param,
        };
        let step = Step::Native {
            op: meta.op,
            inputs,
            param,
            state: meta.state,
            history: history_for(meta.lookback, param),
        };
        Ok(self.push_step(sig, step, warmup))
    }

    fn push_step(&mut self, sig: StepSignature, step: Step, warmup: Warmup) -> usize {
        if let Some(&idx) = self.step_by_sig.get(&sig) {
            self.cse_hit_count += 1;
            return idx;
        }
        let idx = self.steps.len();
        self.steps.push(step);
        self.warmups.push(warmup);
        self.step_by_sig.insert(sig, idx);
        idx
    }
}
