use crate::compile::{
    bind_plan, compile_formula, BindTarget, CompiledFormula, FormulaSource, FormulaStep,
    IndicatorLookup, RefBinder,
};
use crate::compile_expr::is_valid_identifier;
use crate::error::{BindError, CompileError, RegistrationError, ResolveError};
use crate::ops::{CatalogEntry, CatalogEntryDef, FunctionCatalog};
use crate::plan::EvalPlan;
use crate::resolver::{DependencyGraph, DependencyOrder};
use crate::types::{ParameterSnapshot, RawField, Timeframe};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Administrator-supplied indicator. `id` and `version` are assigned by the
/// registry; values supplied on registration are ignored except when loading
/// a stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub formula: String,
    /// Raw fields, catalog functions and indicators the formula reads.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Parameter defaults; callers may override them per request.
    #[serde(default)]
    pub parameters: BTreeMap<String, f64>,
    /// Named intermediate series evaluated before the formula.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<FormulaStep>,
    #[serde(default = "first_version")]
    pub version: u32,
}

fn first_version() -> u32 {
    1
}

impl IndicatorDefinition {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            category: String::new(),
            description: String::new(),
            formula: formula.into(),
            dependencies: Vec::new(),
            parameters: BTreeMap::new(),
            steps: Vec::new(),
            version: first_version(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.steps.push(FormulaStep::new(name, expr));
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    fn same_content(&self, other: &IndicatorDefinition) -> bool {
        self.formula == other.formula
            && self.dependencies == other.dependencies
            && self.parameters == other.parameters
            && self.steps == other.steps
            && self.category == other.category
            && self.description == other.description
    }

    fn source(&self) -> FormulaSource<'_> {
        FormulaSource {
            name: &self.name,
            formula: &self.formula,
            dependencies: &self.dependencies,
            parameters: &self.parameters,
            steps: &self.steps,
        }
    }
}

/// A published definition with its compiled tree. The tree is compiled once
/// per version and reused by every batch.
#[derive(Debug, Clone)]
pub struct RegisteredIndicator {
    pub definition: IndicatorDefinition,
    pub compiled: Arc<CompiledFormula>,
}

/// Immutable view of the catalog and indicator set. Batches hold one for
/// their whole run; registration publishes a new one.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    catalog: Arc<FunctionCatalog>,
    indicators: BTreeMap<String, Arc<RegisteredIndicator>>,
    graph: DependencyGraph,
    order: DependencyOrder,
    generation: u64,
}

impl RegistrySnapshot {
    fn build(
        catalog: Arc<FunctionCatalog>,
        indicators: BTreeMap<String, Arc<RegisteredIndicator>>,
        generation: u64,
    ) -> Result<Self, ResolveError> {
        let graph = DependencyGraph::from_edges(indicators.iter().map(|(name, registered)| {
            (
                name.as_str(),
                registered.compiled.references.iter().map(String::as_str),
            )
        }));
        let order = graph.resolve()?;
        Ok(Self {
            catalog,
            indicators,
            graph,
            order,
            generation,
        })
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<FunctionCatalog> {
        &self.catalog
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn order(&self) -> &DependencyOrder {
        &self.order
    }

    #[inline]
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn indicator(&self, name: &str) -> Option<&Arc<RegisteredIndicator>> {
        self.indicators.get(name)
    }

    pub fn find(&self, id_or_name: &str) -> Option<&Arc<RegisteredIndicator>> {
        self.indicators.get(id_or_name).or_else(|| {
            self.indicators
                .values()
                .find(|registered| registered.definition.id == id_or_name)
        })
    }

    /// Definitions ordered by name.
    pub fn definitions(&self) -> impl Iterator<Item = &IndicatorDefinition> {
        self.indicators.values().map(|r| &r.definition)
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Version and bound parameters of the series `name` produces under
    /// `overrides`. The snapshot pins the versions of every indicator `name`
    /// reads, directly or transitively.
    pub fn snapshot_for(
        &self,
        name: &str,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<(u32, ParameterSnapshot), BindError> {
        let registered = self
            .indicators
            .get(name)
            .ok_or_else(|| BindError::UnknownIndicator {
                name: name.to_string(),
            })?;
        let mut values = registered.definition.parameters.clone();
        for (param, value) in overrides {
            let Some(slot) = values.get_mut(param) else {
                return Err(BindError::UnknownParameter {
                    indicator: name.to_string(),
                    param: param.clone(),
                });
            };
            if !value.is_finite() {
                return Err(BindError::InvalidParameterValue {
                    indicator: name.to_string(),
                    param: param.clone(),
                    value: *value,
                    reason: "must be finite",
                });
            }
            *slot = *value;
        }
        let dependency_versions = self
            .graph
            .transitive_dependencies(name)
            .into_iter()
            .filter_map(|dep| {
                let version = self.indicators.get(&dep)?.definition.version;
                Some((dep, version))
            })
            .collect();
        Ok((
            registered.definition.version,
            ParameterSnapshot::new(values, dependency_versions),
        ))
    }

    /// Binds `name` for one (symbol, timeframe) series.
    pub fn plan(
        &self,
        name: &str,
        symbol: &str,
        timeframe: Timeframe,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<EvalPlan, BindError> {
        let (version, snapshot) = self.snapshot_for(name, overrides)?;
        let registered = self
            .indicators
            .get(name)
            .ok_or_else(|| BindError::UnknownIndicator {
                name: name.to_string(),
            })?;
        let target = BindTarget {
            symbol: Arc::from(symbol),
            timeframe,
            indicator: Arc::from(name),
            version,
            snapshot,
        };
        bind_plan(&registered.compiled, target, self)
    }
}

impl IndicatorLookup for RegistrySnapshot {
    fn indicator_parameters(&self, name: &str) -> Option<&BTreeMap<String, f64>> {
        self.indicators.get(name).map(|r| &r.definition.parameters)
    }
}

impl RefBinder for RegistrySnapshot {
    fn bind_ref(
        &self,
        name: &str,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<(u32, ParameterSnapshot), BindError> {
        self.snapshot_for(name, overrides)
    }
}

/// Published indicators plus one candidate definition that is being validated.
struct WithCandidate<'a> {
    published: &'a BTreeMap<String, Arc<RegisteredIndicator>>,
    candidate: &'a IndicatorDefinition,
}

impl IndicatorLookup for WithCandidate<'_> {
    fn indicator_parameters(&self, name: &str) -> Option<&BTreeMap<String, f64>> {
        if name == self.candidate.name {
            return Some(&self.candidate.parameters);
        }
        self.published.get(name).map(|r| &r.definition.parameters)
    }
}

/// Stored form of the whole registry, as read from the metadata store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub functions: Vec<CatalogEntryDef>,
    #[serde(default)]
    pub indicators: Vec<IndicatorDefinition>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Hold {
    readers: usize,
    writer: bool,
    writers_waiting: usize,
}

impl Hold {
    fn blocks_readers(&self) -> bool {
        self.writer || self.writers_waiting > 0
    }

    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer && self.writers_waiting == 0
    }
}

/// Per-name reader/writer gate. Batches share the names they compute;
/// registration of a name waits for those batches. A waiting registration
/// blocks new batches on that name so it cannot be starved.
#[derive(Debug, Default)]
struct NameGate {
    holds: Mutex<HashMap<String, Hold>>,
    changed: Condvar,
}

impl NameGate {
    /// Takes every name at once so two batches can never wait on each other.
    fn acquire_shared(&self, names: &BTreeSet<String>) {
        let mut holds = self.holds.lock();
        while names
            .iter()
            .any(|name| holds.get(name).is_some_and(Hold::blocks_readers))
        {
            self.changed.wait(&mut holds);
        }
        for name in names {
            holds.entry(name.clone()).or_default().readers += 1;
        }
    }

    fn release_shared(&self, names: &BTreeSet<String>) {
        let mut holds = self.holds.lock();
        for name in names {
            if let Some(hold) = holds.get_mut(name) {
                hold.readers = hold.readers.saturating_sub(1);
                if hold.is_free() {
                    holds.remove(name);
                }
            }
        }
        self.changed.notify_all();
    }

    fn acquire_exclusive(&self, name: &str) {
        let mut holds = self.holds.lock();
        let busy = |hold: &Hold| hold.writer || hold.readers > 0;
        if holds.get(name).is_some_and(busy) {
            holds.entry(name.to_string()).or_default().writers_waiting += 1;
            while holds.get(name).is_some_and(busy) {
                self.changed.wait(&mut holds);
            }
            let hold = holds.entry(name.to_string()).or_default();
            hold.writers_waiting = hold.writers_waiting.saturating_sub(1);
        }
        holds.entry(name.to_string()).or_default().writer = true;
    }

    fn release_exclusive(&self, name: &str) {
        let mut holds = self.holds.lock();
        if let Some(hold) = holds.get_mut(name) {
            hold.writer = false;
            if hold.is_free() {
                holds.remove(name);
            }
        }
        self.changed.notify_all();
    }
}

struct ExclusiveGuard<'a> {
    gate: &'a NameGate,
    names: Vec<String>,
}

impl<'a> ExclusiveGuard<'a> {
    fn acquire(gate: &'a NameGate, names: impl IntoIterator<Item = String>) -> Self {
        let names: BTreeSet<String> = names.into_iter().collect();
        let mut guard = Self {
            gate,
            names: Vec::with_capacity(names.len()),
        };
        for name in names {
            gate.acquire_exclusive(&name);
            guard.names.push(name);
        }
        guard
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        for name in self.names.iter().rev() {
            self.gate.release_exclusive(name);
        }
    }
}

/// Shared hold on a set of indicator names plus the snapshot read under it.
/// Registration of any held name waits until the lease is dropped.
pub struct RegistryLease {
    gate: Arc<NameGate>,
    names: BTreeSet<String>,
    snapshot: Arc<RegistrySnapshot>,
}

impl RegistryLease {
    #[inline]
    pub fn snapshot(&self) -> &Arc<RegistrySnapshot> {
        &self.snapshot
    }

    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        self.gate.release_shared(&self.names);
    }
}

impl std::fmt::Debug for RegistryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLease")
            .field("names", &self.names)
            .field("generation", &self.snapshot.generation)
            .finish()
    }
}

/// Process-wide catalog and indicator registry. Readers take the current
/// snapshot without blocking writers; writers are serialized and publish a
/// fresh snapshot only after full validation.
#[derive(Debug)]
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
    admin: Mutex<()>,
    gate: Arc<NameGate>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with the builtin catalog and no indicators.
    pub fn new() -> Self {
        Self::with_catalog(FunctionCatalog::with_builtins())
    }

    pub fn with_catalog(catalog: FunctionCatalog) -> Self {
        let snapshot = RegistrySnapshot {
            catalog: Arc::new(catalog),
            indicators: BTreeMap::new(),
            graph: DependencyGraph::new(),
            order: DependencyOrder::default(),
            generation: 0,
        };
        Self {
            current: RwLock::new(Arc::new(snapshot)),
            admin: Mutex::new(()),
            gate: Arc::new(NameGate::default()),
        }
    }

    /// Builds a registry from a stored document.
    pub fn from_document(doc: RegistryDocument) -> Result<Self, RegistrationError> {
        let registry = Self::new();
        registry.load_snapshot(doc)?;
        Ok(registry)
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    fn publish(&self, next: RegistrySnapshot) -> Arc<RegistrySnapshot> {
        let next = Arc::new(next);
        *self.current.write() = Arc::clone(&next);
        next
    }

    /// Shared lease over `names` and everything they depend on.
    pub fn lease<I, S>(&self, names: I) -> RegistryLease
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let requested: Vec<String> = names.into_iter().map(|s| s.as_ref().to_string()).collect();
        let expand = |snapshot: &RegistrySnapshot| -> BTreeSet<String> {
            let mut all = BTreeSet::new();
            for name in &requested {
                all.insert(name.clone());
                all.extend(snapshot.graph.transitive_dependencies(name));
            }
            all
        };
        loop {
            let names = expand(&self.snapshot());
            self.gate.acquire_shared(&names);
            let snapshot = self.snapshot();
            if expand(&snapshot) == names {
                return RegistryLease {
                    gate: Arc::clone(&self.gate),
                    names,
                    snapshot,
                };
            }
            // Dependencies changed between expansion and acquisition.
            self.gate.release_shared(&names);
        }
    }

    pub fn register_function(
        &self,
        def: CatalogEntryDef,
    ) -> Result<Arc<CatalogEntry>, RegistrationError> {
        let _admin = self.admin.lock();
        let current = self.snapshot();
        if current.indicators.contains_key(&def.name) {
            return Err(CompileError::AmbiguousIdentifier {
                name: def.name,
                matches: "catalog function, indicator".to_string(),
            }
            .into());
        }
        let mut catalog = FunctionCatalog::clone(&current.catalog);
        let entry = catalog.register(def)?;
        let next = RegistrySnapshot::build(
            Arc::new(catalog),
            current.indicators.clone(),
            current.generation + 1,
        )?;
        self.publish(next);
        info!(
            function = %entry.name,
            version = entry.version,
            category = %entry.category,
            "published catalog entry"
        );
        Ok(entry)
    }

    /// Creates an indicator, or re-registers it under the next version.
    /// Nothing is published unless the definition, every direct dependent and
    /// the resulting dependency graph all validate.
    pub fn register_indicator(
        &self,
        def: IndicatorDefinition,
    ) -> Result<IndicatorDefinition, RegistrationError> {
        let _admin = self.admin.lock();
        let _exclusive = ExclusiveGuard::acquire(&self.gate, [def.name.clone()]);
        let current = self.snapshot();
        check_definition(&current.catalog, &def)?;

        let existing = current.indicators.get(&def.name).cloned();
        if let Some(existing) = &existing {
            if existing.definition.same_content(&def) {
                debug!(indicator = %def.name, version = existing.definition.version, "definition unchanged");
                return Ok(existing.definition.clone());
            }
        }

        let lookup = WithCandidate {
            published: &current.indicators,
            candidate: &def,
        };
        let compiled = compile_formula(&current.catalog, &lookup, &def.source())?;
        for dependent in current.graph.dependents_of(&def.name) {
            let Some(registered) = current.indicators.get(&dependent) else {
                continue;
            };
            compile_formula(&current.catalog, &lookup, &registered.definition.source()).map_err(
                |err| RegistrationError::InvalidDefinition {
                    name: def.name.clone(),
                    reason: format!("dependent `{dependent}` would no longer compile: {err}"),
                },
            )?;
        }

        let definition = IndicatorDefinition {
            id: existing
                .as_ref()
                .map_or_else(|| Uuid::new_v4().to_string(), |e| e.definition.id.clone()),
            version: existing.as_ref().map_or(1, |e| e.definition.version + 1),
            ..def
        };
        let mut indicators = current.indicators.clone();
        indicators.insert(
            definition.name.clone(),
            Arc::new(RegisteredIndicator {
                definition: definition.clone(),
                compiled: Arc::new(compiled),
            }),
        );
        let next = RegistrySnapshot::build(
            Arc::clone(&current.catalog),
            indicators,
            current.generation + 1,
        )?;
        let next = self.publish(next);
        info!(
            indicator = %definition.name,
            id = %definition.id,
            version = definition.version,
            generation = next.generation,
            "published indicator"
        );
        Ok(definition)
    }

    /// Removes an indicator no other indicator reads.
    pub fn remove_indicator(&self, id_or_name: &str) -> Result<IndicatorDefinition, RegistrationError> {
        let _admin = self.admin.lock();
        let name = self
            .snapshot()
            .find(id_or_name)
            .map(|r| r.definition.name.clone())
            .ok_or_else(|| RegistrationError::NotFound {
                id_or_name: id_or_name.to_string(),
            })?;
        let _exclusive = ExclusiveGuard::acquire(&self.gate, [name.clone()]);
        let current = self.snapshot();
        let dependents = current.graph.dependents_of(&name);
        if !dependents.is_empty() {
            return Err(RegistrationError::InUse {
                name,
                dependents: dependents.into_iter().collect(),
            });
        }
        let mut indicators = current.indicators.clone();
        let removed = indicators
            .remove(&name)
            .ok_or_else(|| RegistrationError::NotFound {
                id_or_name: id_or_name.to_string(),
            })?;
        let next = RegistrySnapshot::build(
            Arc::clone(&current.catalog),
            indicators,
            current.generation + 1,
        )?;
        self.publish(next);
        info!(indicator = %name, version = removed.definition.version, "removed indicator");
        Ok(removed.definition.clone())
    }

    pub fn get(&self, id_or_name: &str) -> Option<IndicatorDefinition> {
        self.snapshot()
            .find(id_or_name)
            .map(|r| r.definition.clone())
    }

    /// Page of definitions ordered by name.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<IndicatorDefinition> {
        self.snapshot()
            .definitions()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Replaces the whole registry with `doc` after validating every entry.
    /// Catalog entries may appear in any order; indicators keep their stored
    /// ids and versions.
    pub fn load_snapshot(&self, doc: RegistryDocument) -> Result<(), RegistrationError> {
        let _admin = self.admin.lock();
        let catalog = load_catalog(doc.functions)?;

        let mut names = BTreeSet::new();
        for def in &doc.indicators {
            if !names.insert(def.name.clone()) {
                return Err(RegistrationError::InvalidDefinition {
                    name: def.name.clone(),
                    reason: "defined twice in snapshot".to_string(),
                });
            }
        }
        let lookup: BTreeMap<String, BTreeMap<String, f64>> = doc
            .indicators
            .iter()
            .map(|def| (def.name.clone(), def.parameters.clone()))
            .collect();
        let mut indicators = BTreeMap::new();
        for mut def in doc.indicators {
            check_definition(&catalog, &def)?;
            let compiled = compile_formula(&catalog, &lookup, &def.source())?;
            if def.id.is_empty() {
                def.id = Uuid::new_v4().to_string();
            }
            def.version = def.version.max(1);
            indicators.insert(
                def.name.clone(),
                Arc::new(RegisteredIndicator {
                    definition: def,
                    compiled: Arc::new(compiled),
                }),
            );
        }

        let previous = self.snapshot();
        let locked = previous.indicators.keys().cloned().chain(names);
        let _exclusive = ExclusiveGuard::acquire(&self.gate, locked);
        let generation = self.snapshot().generation + 1;
        let next = RegistrySnapshot::build(Arc::new(catalog), indicators, generation)?;
        let next = self.publish(next);
        info!(
            indicators = next.len(),
            functions = next.catalog.len(),
            generation,
            "loaded registry snapshot"
        );
        Ok(())
    }

    pub fn load_json(&self, raw: &str) -> Result<(), RegistrationError> {
        let doc: RegistryDocument = serde_json::from_str(raw)?;
        self.load_snapshot(doc)
    }

    /// Current registry as a document `load_snapshot` accepts.
    pub fn export(&self) -> RegistryDocument {
        let snapshot = self.snapshot();
        RegistryDocument {
            functions: snapshot.catalog.registered_defs(),
            indicators: snapshot
                .order
                .order
                .iter()
                .filter_map(|name| snapshot.indicators.get(name))
                .map(|r| r.definition.clone())
                .collect(),
        }
    }
}

/// Registers catalog entries in passes so templates may precede the entries
/// they call. Stops with the first error once a pass makes no progress.
fn load_catalog(defs: Vec<CatalogEntryDef>) -> Result<FunctionCatalog, RegistrationError> {
    let mut catalog = FunctionCatalog::with_builtins();
    let mut pending = defs;
    while !pending.is_empty() {
        let before = pending.len();
        let mut deferred = Vec::new();
        let mut first_error = None;
        for def in pending {
            if let Err(err) = catalog.register(def.clone()) {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                deferred.push(def);
            }
        }
        if let (true, Some(err)) = (deferred.len() == before, first_error) {
            return Err(err.into());
        }
        pending = deferred;
    }
    Ok(catalog)
}

const MAX_STEPS: usize = 64;

fn check_definition(
    catalog: &FunctionCatalog,
    def: &IndicatorDefinition,
) -> Result<(), RegistrationError> {
    let invalid = |reason: String| RegistrationError::InvalidDefinition {
        name: def.name.clone(),
        reason,
    };
    if !is_valid_identifier(&def.name) {
        return Err(invalid("name is not a valid identifier".to_string()));
    }
    if RawField::from_name(&def.name).is_some() {
        return Err(CompileError::AmbiguousIdentifier {
            name: def.name.clone(),
            matches: "raw field, indicator".to_string(),
        }
        .into());
    }
    if catalog.contains(&def.name) {
        return Err(CompileError::AmbiguousIdentifier {
            name: def.name.clone(),
            matches: "catalog function, indicator".to_string(),
        }
        .into());
    }
    let mut seen = BTreeSet::new();
    for dep in &def.dependencies {
        if !seen.insert(dep.as_str()) {
            return Err(invalid(format!("dependency `{dep}` is listed twice")));
        }
    }
    for (param, value) in &def.parameters {
        if !is_valid_identifier(param) {
            return Err(invalid(format!("parameter `{param}` is not a valid identifier")));
        }
        if !value.is_finite() {
            return Err(invalid(format!("parameter `{param}` must be finite")));
        }
    }
    if def.steps.len() > MAX_STEPS {
        return Err(invalid(format!("more than {MAX_STEPS} steps")));
    }
    let mut step_names = BTreeSet::new();
    for step in &def.steps {
        if !is_valid_identifier(&step.name) {
            return Err(invalid(format!("step `{}` is not a valid identifier", step.name)));
        }
        if !step_names.insert(step.name.as_str()) {
            return Err(invalid(format!("step `{}` is defined twice", step.name)));
        }
    }
    Ok(())
}
