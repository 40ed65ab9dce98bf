/// Query planning
///
/// Turns a statement plus live table metadata into an immutable [`Plan`]:
/// which store operation to issue (query, scan or batch key lookup), against
/// which index, and how the predicate splits into key condition and filter.
///
/// Index selection, for predicates that are not `KEYS IN`:
///
/// 1. The top-level AND conjuncts form the candidate terms. Anything under
///    OR or NOT stays one opaque conjunct and never feeds a key condition.
/// 2. An index is eligible when some term is `hash_key = <literal>`.
/// 3. Among eligible indexes, prefer one with a usable range-key term, then
///    one projecting every requested attribute, then the table itself, then
///    the earliest declared (table, local indexes, global indexes).
/// 4. The hash term and at most one range term form the key condition; all
///    other conjuncts form the filter, in their original order.
///
/// `USING` skips the search. With no eligible index, SCAN statements (and
/// any statement when scanning is allowed) become a scan with the whole
/// predicate as filter.

use crate::config::EngineConfig;
use crate::expression::is_key_term;
use crate::lang::{
    CompareOp, Function, Operand, OrderBy, Path, Predicate, Projection, SelectStatement, Statement, WhereClause,
};
use crate::schema::{QueryIndex, TableMeta};
use crate::{Error, Item, Result, Value};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, warn};

/// Store operation a plan drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    Query,
    Scan,
    BatchGet,
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlanKind::Query => "QUERY",
            PlanKind::Scan => "SCAN",
            PlanKind::BatchGet => "BATCH GET",
        })
    }
}

/// Client-side ordering
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub attribute: Path,
    pub ascending: bool,
}

/// Execution plan for one read, or for the key-collecting pass of a write
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub kind: PlanKind,
    pub table: String,
    /// Secondary index queried or scanned; `None` for the table itself
    pub index: Option<String>,
    pub key_condition: Option<Predicate>,
    /// Filter the store evaluates
    pub filter: Option<Predicate>,
    /// Filter evaluated locally after items are fetched
    pub client_filter: Option<Predicate>,
    /// Primary keys of a batch lookup, in request order
    pub keys: Vec<Item>,
    /// Requested output attributes; `None` for whole items
    pub attributes: Option<Vec<Path>>,
    /// Projection of the call that returns full items: the first pass, or
    /// the hydration lookup when `hydrate` is set
    pub fetch: Option<Vec<Path>>,
    pub count: bool,
    /// First pass returns keys only; items come from a batch lookup
    pub hydrate: bool,
    /// Native range-key direction
    pub ascending: bool,
    pub sort: Option<Sort>,
    pub limit: Option<usize>,
    pub scan_limit: Option<usize>,
    pub consistent: bool,
}

impl Plan {
    fn new(kind: PlanKind, table: &str) -> Self {
        Self {
            kind,
            table: table.to_string(),
            index: None,
            key_condition: None,
            filter: None,
            client_filter: None,
            keys: Vec::new(),
            attributes: None,
            fetch: None,
            count: false,
            hydrate: false,
            ascending: true,
            sort: None,
            limit: None,
            scan_limit: None,
            consistent: false,
        }
    }

    /// Index name for display and logging
    pub fn index_label(&self) -> &str {
        self.index.as_deref().unwrap_or("TABLE")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerOptions {
    pub allow_scan: bool,
    pub strict_ordering: bool,
}

impl From<&EngineConfig> for PlannerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            allow_scan: config.allow_scan,
            strict_ordering: config.strict_ordering,
        }
    }
}

/// Terms of a predicate an index can consume
#[derive(Debug, Clone, Copy)]
struct Fit {
    hash: usize,
    range: Option<usize>,
}

/// Plans statements against one table
pub struct Planner<'a> {
    meta: &'a TableMeta,
    options: PlannerOptions,
}

impl<'a> Planner<'a> {
    pub fn new(meta: &'a TableMeta, options: PlannerOptions) -> Self {
        Self { meta, options }
    }

    /// Plans a read statement, or the key-collecting pass of UPDATE/DELETE.
    pub fn plan(&self, statement: &Statement) -> Result<Plan> {
        match statement {
            Statement::Select(stmt) | Statement::Count(stmt) => self.plan_select(stmt, false),
            Statement::Scan(stmt) => self.plan_select(stmt, true),
            Statement::Update(stmt) => self.plan_keys(stmt.where_clause.as_ref(), stmt.using.as_deref()),
            Statement::Delete(stmt) => self.plan_keys(stmt.where_clause.as_ref(), stmt.using.as_deref()),
            Statement::Explain(inner) | Statement::Analyze(inner) => self.plan(inner),
            other => Err(Error::InvalidQuery(format!(
                "{} statements have no read plan",
                other.kind()
            ))),
        }
    }

    /// Plans the read that collects the primary keys a write touches.
    pub fn plan_keys(&self, where_clause: Option<&WhereClause>, using: Option<&str>) -> Result<Plan> {
        let keys = self
            .meta
            .primary_key_attributes()
            .into_iter()
            .map(Path::attribute)
            .collect();
        let mut stmt = SelectStatement::new(self.meta.name.clone(), Projection::Attributes(keys));
        stmt.where_clause = where_clause.cloned();
        stmt.using = using.map(str::to_string);
        self.plan_select(&stmt, false)
    }

    /// Plans SELECT / COUNT (`scan == false`) or SCAN (`scan == true`).
    pub fn plan_select(&self, stmt: &SelectStatement, scan: bool) -> Result<Plan> {
        let mut plan = match &stmt.where_clause {
            Some(WhereClause::KeysIn { keys, filter }) => {
                if stmt.using.is_some() {
                    return Err(Error::InvalidQuery(
                        "USING cannot be combined with KEYS IN".to_string(),
                    ));
                }
                self.batch_get(keys, filter.as_ref())?
            }
            Some(WhereClause::Predicate(pred)) => self.predicate_plan(stmt, Some(pred), scan)?,
            None => self.predicate_plan(stmt, None, scan)?,
        };

        plan.consistent = stmt.consistent;
        plan.scan_limit = stmt.scan_limit;
        plan.count = stmt.projection == Projection::Count;
        if !plan.count {
            plan.limit = stmt.limit;
            self.order(&mut plan, stmt.order_by.as_ref())?;
        }
        self.project(&mut plan, &stmt.projection);

        debug!(
            table = %plan.table,
            kind = %plan.kind,
            index = plan.index_label(),
            hydrate = plan.hydrate,
            "planned statement"
        );
        Ok(plan)
    }

    fn batch_get(&self, tuples: &[Vec<Value>], filter: Option<&Predicate>) -> Result<Plan> {
        let attrs: Vec<_> = std::iter::once(&self.meta.hash_key)
            .chain(self.meta.range_key.as_ref())
            .collect();

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if tuple.len() != attrs.len() {
                return Err(Error::SchemaMismatch(format!(
                    "table '{}' has a {}-part primary key but a KEYS IN tuple has {} values",
                    self.meta.name,
                    attrs.len(),
                    tuple.len()
                )));
            }
            let mut key = Item::new();
            for (attr, value) in attrs.iter().zip(tuple) {
                attr.check(value)?;
                key.insert(attr.name.clone(), value.clone());
            }
            // Batch lookups reject duplicate keys
            let rendered: Vec<String> = tuple.iter().map(Value::key_text).collect();
            if seen.insert(rendered) {
                keys.push(key);
            }
        }

        let mut plan = Plan::new(PlanKind::BatchGet, &self.meta.name);
        plan.keys = keys;
        plan.client_filter = filter.cloned();
        Ok(plan)
    }

    fn predicate_plan(&self, stmt: &SelectStatement, pred: Option<&Predicate>, scan: bool) -> Result<Plan> {
        let conjuncts: Vec<&Predicate> = pred.map(|p| p.conjuncts()).unwrap_or_default();

        if scan {
            let index = match &stmt.using {
                Some(name) => Some(self.lookup_index(name)?),
                None => None,
            };
            return Ok(self.scan(index.as_ref(), pred));
        }

        if let Some(name) = &stmt.using {
            let index = self.lookup_index(name)?;
            let fit = self.fit(&index, &conjuncts).ok_or_else(|| {
                Error::InvalidIndex(format!(
                    "index '{}' needs an equality condition on its hash key '{}'",
                    name, index.hash_key.name
                ))
            })?;
            if stmt.consistent && index.is_global() {
                return Err(Error::InvalidQuery(format!(
                    "global index '{}' does not support consistent reads",
                    name
                )));
            }
            return self.query(&index, fit, &conjuncts);
        }

        let requested = requested_attributes(stmt);
        let mut best: Option<(QueryIndex, Fit, (bool, bool, bool))> = None;
        for index in self.meta.query_indexes() {
            if stmt.consistent && index.is_global() {
                continue;
            }
            let Some(fit) = self.fit(&index, &conjuncts) else {
                continue;
            };
            let rank = (
                fit.range.is_some(),
                self.projects(&index, requested.as_deref()),
                index.is_table(),
            );
            // Strictly better only, so ties keep declaration order
            if best.as_ref().map_or(true, |(_, _, r)| rank > *r) {
                best = Some((index, fit, rank));
            }
        }

        match best {
            Some((index, fit, _)) => self.query(&index, fit, &conjuncts),
            None if self.options.allow_scan => {
                debug!(table = %self.meta.name, "no usable index, falling back to scan");
                Ok(self.scan(None, pred))
            }
            None => Err(Error::UnindexedQuery(match pred {
                Some(pred) => format!(
                    "no index on table '{}' can serve '{}'; use SCAN or enable scans",
                    self.meta.name, pred
                ),
                None => format!(
                    "reading all of table '{}' needs SCAN or enabled scans",
                    self.meta.name
                ),
            })),
        }
    }

    fn lookup_index(&self, name: &str) -> Result<QueryIndex> {
        self.meta.index(name).ok_or_else(|| Error::IndexNotFound {
            table: self.meta.name.clone(),
            index: name.to_string(),
        })
    }

    fn scan(&self, index: Option<&QueryIndex>, pred: Option<&Predicate>) -> Plan {
        let mut plan = Plan::new(PlanKind::Scan, &self.meta.name);
        plan.index = index.and_then(|i| i.name.clone());
        plan.filter = pred.cloned();
        plan
    }

    fn fit(&self, index: &QueryIndex, conjuncts: &[&Predicate]) -> Option<Fit> {
        let hash = conjuncts.iter().position(|term| {
            matches!(term, Predicate::Compare { path, op: CompareOp::Eq, operand: Operand::Value(_) }
                if path.as_attribute() == Some(index.hash_key.name.as_str()))
        })?;
        let range = index.range_key.as_ref().and_then(|range_key| {
            conjuncts.iter().enumerate().position(|(i, term)| {
                i != hash && is_key_term(term) && term_attribute(term) == Some(range_key.name.as_str())
            })
        });
        Some(Fit { hash, range })
    }

    fn query(&self, index: &QueryIndex, fit: Fit, conjuncts: &[&Predicate]) -> Result<Plan> {
        self.check_key_types(index, fit, conjuncts)?;

        let mut key_terms = vec![conjuncts[fit.hash].clone()];
        if let Some(range) = fit.range {
            key_terms.push(conjuncts[range].clone());
        }
        let rest: Vec<Predicate> = conjuncts
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fit.hash && Some(*i) != fit.range)
            .map(|(_, term)| (*term).clone())
            .collect();

        let mut plan = Plan::new(PlanKind::Query, &self.meta.name);
        plan.index = index.name.clone();
        plan.key_condition = Predicate::all(key_terms);
        plan.filter = Predicate::all(rest);
        Ok(plan)
    }

    fn check_key_types(&self, index: &QueryIndex, fit: Fit, conjuncts: &[&Predicate]) -> Result<()> {
        if let Predicate::Compare { operand: Operand::Value(v), .. } = conjuncts[fit.hash] {
            index.hash_key.check(v)?;
        }
        if let (Some(range), Some(range_key)) = (fit.range, index.range_key.as_ref()) {
            let values: Vec<&Value> = match conjuncts[range] {
                Predicate::Compare { operand, .. } => operand.as_value().into_iter().collect(),
                Predicate::Between { low, high, .. } => {
                    low.as_value().into_iter().chain(high.as_value()).collect()
                }
                Predicate::Function(Function::BeginsWith { prefix, .. }) => {
                    prefix.as_value().into_iter().collect()
                }
                _ => Vec::new(),
            };
            for value in values {
                range_key.check(value)?;
            }
        }
        Ok(())
    }

    /// Whether the index serves every requested attribute; `None` requests
    /// whole items.
    fn projects(&self, index: &QueryIndex, requested: Option<&[String]>) -> bool {
        match requested {
            None => index.projects_all(),
            Some(attrs) => attrs.iter().all(|a| index.projects(a, self.meta)),
        }
    }

    fn order(&self, plan: &mut Plan, order_by: Option<&OrderBy>) -> Result<()> {
        let Some(order_by) = order_by else {
            return Ok(());
        };
        plan.ascending = order_by.ascending;
        let Some(attribute) = &order_by.attribute else {
            return Ok(());
        };

        if plan.kind == PlanKind::Query {
            let index = match &plan.index {
                Some(name) => self.meta.index(name),
                None => self.meta.query_indexes().into_iter().next(),
            };
            let range_key = index.and_then(|i| i.range_key.map(|k| k.name));
            if range_key.as_deref() == attribute.as_attribute() {
                return Ok(());
            }
        }

        if plan.limit.is_some() {
            if self.options.strict_ordering {
                return Err(Error::InvalidQuery(format!(
                    "ORDER BY {} is not the index range key; combined with LIMIT it may drop rows",
                    attribute
                )));
            }
            warn!(
                table = %plan.table,
                attribute = %attribute,
                "ORDER BY on a non-key attribute with LIMIT sorts only the rows fetched before the limit"
            );
        }
        plan.ascending = true;
        plan.sort = Some(Sort {
            attribute: attribute.clone(),
            ascending: order_by.ascending,
        });
        Ok(())
    }

    /// Decides projections and whether a hydration pass is needed.
    fn project(&self, plan: &mut Plan, projection: &Projection) {
        let index = match (&plan.kind, &plan.index) {
            (PlanKind::BatchGet, _) | (_, None) => None,
            (_, Some(name)) => self.meta.index(name),
        };

        plan.attributes = match projection {
            Projection::Attributes(paths) => Some(paths.clone()),
            _ => None,
        };

        // Attributes the engine itself reads from returned items
        let mut extra: Vec<String> = Vec::new();
        if let Some(sort) = &plan.sort {
            extra.push(sort.attribute.root().to_string());
        }
        if let Some(filter) = &plan.client_filter {
            extra.extend(predicate_attributes(filter));
        }

        if let Some(index) = &index {
            let output_missing = match projection {
                Projection::Count => false,
                Projection::All => !index.projects_all(),
                Projection::Attributes(paths) => {
                    paths.iter().any(|p| !index.projects(p.root(), self.meta))
                }
            };
            let extra_missing = extra.iter().any(|a| !index.projects(a, self.meta));
            let filter_missing = plan.filter.as_ref().is_some_and(|f| {
                predicate_attributes(f)
                    .iter()
                    .any(|a| !index.projects(a, self.meta))
            });

            if output_missing || extra_missing || filter_missing {
                plan.hydrate = true;
                // The index cannot evaluate a filter on attributes it lacks
                if filter_missing {
                    if let Some(filter) = plan.filter.take() {
                        extra.extend(predicate_attributes(&filter));
                        plan.client_filter = Some(filter);
                    }
                }
                debug!(
                    table = %plan.table,
                    index = plan.index_label(),
                    "index does not project requested attributes, hydrating from table"
                );
            }
        }

        if plan.count && !plan.hydrate {
            plan.fetch = None;
            return;
        }
        plan.fetch = plan.attributes.as_ref().map(|paths| {
            let mut fetch = paths.clone();
            for attr in &extra {
                if !fetch.iter().any(|p| p.root() == attr) {
                    fetch.push(Path::attribute(attr.as_str()));
                }
            }
            fetch
        });
    }
}

/// Attribute a single key term constrains
fn term_attribute(term: &Predicate) -> Option<&str> {
    match term {
        Predicate::Compare { path, .. } | Predicate::Between { path, .. } => path.as_attribute(),
        Predicate::Function(Function::BeginsWith { path, .. }) => path.as_attribute(),
        _ => None,
    }
}

/// Top-level attributes a statement's output needs; `None` means whole items.
fn requested_attributes(stmt: &SelectStatement) -> Option<Vec<String>> {
    let mut attrs: Vec<String> = match &stmt.projection {
        Projection::All => return None,
        Projection::Count => Vec::new(),
        Projection::Attributes(paths) => paths.iter().map(|p| p.root().to_string()).collect(),
    };
    if let Some(OrderBy {
        attribute: Some(path),
        ..
    }) = &stmt.order_by
    {
        attrs.push(path.root().to_string());
    }
    Some(attrs)
}

/// Top-level attributes a predicate reads, deduplicated
pub fn predicate_attributes(pred: &Predicate) -> Vec<String> {
    fn operand(op: &Operand, out: &mut Vec<String>) {
        if let Operand::Path(p) = op {
            push(p, out);
        }
    }
    fn push(path: &Path, out: &mut Vec<String>) {
        let root = path.root().to_string();
        if !out.contains(&root) {
            out.push(root);
        }
    }
    fn walk(pred: &Predicate, out: &mut Vec<String>) {
        match pred {
            Predicate::Compare { path, operand: op, .. } => {
                push(path, out);
                operand(op, out);
            }
            Predicate::Between { path, low, high } => {
                push(path, out);
                operand(low, out);
                operand(high, out);
            }
            Predicate::In { path, values } => {
                push(path, out);
                values.iter().for_each(|v| operand(v, out));
            }
            Predicate::Function(function) => {
                push(function.path(), out);
                match function {
                    Function::AttributeType { type_name: op, .. }
                    | Function::BeginsWith { prefix: op, .. }
                    | Function::Contains { operand: op, .. }
                    | Function::Size { operand: op, .. } => operand(op, out),
                    _ => {}
                }
            }
            Predicate::And(terms) | Predicate::Or(terms) => terms.iter().for_each(|t| walk(t, out)),
            Predicate::Not(inner) => walk(inner, out),
        }
    }
    let mut out = Vec::new();
    walk(pred, &mut out);
    out
}
