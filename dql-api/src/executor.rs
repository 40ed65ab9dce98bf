/// Plan execution
///
/// Drives a plan across as many store round trips as it takes: pages of a
/// query or scan follow the continuation token until the result is
/// exhausted, `LIMIT` items have been returned or `SCAN LIMIT` items have
/// been examined. Every call goes through [`Executor::call`], which checks
/// the interrupt flag, waits out the throttle, retries transient failures
/// and records consumed capacity. An error at any point discards whatever
/// was fetched so far.

use crate::store::{Page, QueryRequest, ScanRequest, Store};
use dql_core::config::EngineConfig;
use dql_core::eval::{lookup, matches};
use dql_core::expression::ExpressionBuilder;
use dql_core::lang::{Path, Predicate};
use dql_core::planner::{Plan, PlanKind};
use dql_core::retry::retry_with_policy;
use dql_core::schema::TableMeta;
use dql_core::throttle::{Capacity, Ceiling, ThrottleController, ThrottleScope};
use dql_core::{Error, Item, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{self, AtomicBool};
use tracing::debug;

/// Capacity consumed per (table, index)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Usage {
    entries: BTreeMap<(String, Option<String>), Capacity>,
}

impl Usage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, table: &str, index: Option<&str>, consumed: Capacity) {
        *self
            .entries
            .entry((table.to_string(), index.map(str::to_string)))
            .or_default() += consumed;
    }

    pub fn get(&self, table: &str, index: Option<&str>) -> Capacity {
        self.entries
            .get(&(table.to_string(), index.map(str::to_string)))
            .copied()
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>, Capacity)> {
        self.entries
            .iter()
            .map(|((table, index), consumed)| (table.as_str(), index.as_deref(), *consumed))
    }

    pub fn total(&self) -> Capacity {
        self.entries
            .values()
            .fold(Capacity::default(), |acc, c| acc + *c)
    }

    pub fn merge(&mut self, other: &Usage) {
        for (table, index, consumed) in other.iter() {
            self.record(table, index, consumed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (table, index, consumed)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(
                f,
                "{}{}: read {}, write {}",
                table,
                index.map(|i| format!(":{}", i)).unwrap_or_default(),
                consumed.read,
                consumed.write
            )?;
        }
        Ok(())
    }
}

/// Result of a read plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOutput {
    /// Empty for COUNT plans
    pub items: Vec<Item>,
    pub count: usize,
    /// Items the store examined
    pub scanned_count: usize,
}

/// Executes plans against a store. One executor per statement.
pub struct Executor<'a> {
    pub(crate) store: &'a dyn Store,
    throttle: &'a ThrottleController,
    pub(crate) config: &'a EngineConfig,
    interrupt: &'a AtomicBool,
    clause: Option<&'a Ceiling>,
    usage: Usage,
}

impl<'a> Executor<'a> {
    pub fn new(
        store: &'a dyn Store,
        throttle: &'a ThrottleController,
        config: &'a EngineConfig,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self {
            store,
            throttle,
            config,
            interrupt,
            clause: None,
            usage: Usage::new(),
        }
    }

    /// Applies a statement's `THROTTLE` clause to every call.
    pub fn with_throttle_clause(mut self, clause: Option<&'a Ceiling>) -> Self {
        self.clause = clause;
        self
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn into_usage(self) -> Usage {
        self.usage
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupt.load(atomic::Ordering::SeqCst) {
            debug!("statement interrupted before next store call");
            return Err(Error::Interrupted);
        }
        Ok(())
    }

    /// Issues one store call against `meta` (and `index`), throttled and
    /// retried.
    pub(crate) fn call<T, F, C>(&mut self, meta: &TableMeta, index: Option<&str>, mut op: F, consumed: C) -> Result<T>
    where
        F: FnMut(&dyn Store) -> Result<T>,
        C: Fn(&T) -> Capacity,
    {
        self.check_interrupt()?;
        let scope = ThrottleScope::new(meta, index, self.clause);
        if let Some(delay) = self.throttle.before(&scope) {
            std::thread::sleep(delay);
            self.check_interrupt()?;
        }

        let store = self.store;
        let result = retry_with_policy(&self.config.retry, || op(store))?;

        let used = consumed(&result);
        self.throttle.after(&scope, used);
        self.usage.record(&meta.name, index, used);
        Ok(result)
    }

    /// Runs a read plan to completion.
    pub fn read(&mut self, meta: &TableMeta, plan: &Plan) -> Result<ReadOutput> {
        let mut output = match plan.kind {
            PlanKind::BatchGet => self.read_keys(meta, plan)?,
            PlanKind::Query | PlanKind::Scan => self.read_pages(meta, plan)?,
        };
        finish(plan, &mut output);
        Ok(output)
    }

    /// Primary keys of the items a plan selects.
    pub fn read_primary_keys(&mut self, meta: &TableMeta, plan: &Plan) -> Result<Vec<Item>> {
        let output = self.read(meta, plan)?;
        output.items.iter().map(|item| meta.primary_key(item)).collect()
    }

    fn read_keys(&mut self, meta: &TableMeta, plan: &Plan) -> Result<ReadOutput> {
        let items = self.batch_get(meta, &plan.keys, plan.fetch.as_deref(), plan.consistent)?;
        let scanned_count = items.len();
        let items = match &plan.client_filter {
            Some(filter) => filter_items(filter, items)?,
            None => items,
        };
        Ok(ReadOutput {
            count: items.len(),
            items,
            scanned_count,
        })
    }

    fn read_pages(&mut self, meta: &TableMeta, plan: &Plan) -> Result<ReadOutput> {
        let projection = first_pass_projection(meta, plan);
        let count_only = counts_on_store(plan);
        let mut output = ReadOutput::default();
        let mut start: Option<Item> = None;
        let mut pages = 0usize;

        loop {
            let limit = page_limit(self.config, plan, output.scanned_count, output.items.len());
            let page: Page = match plan.kind {
                PlanKind::Query => {
                    let mut request = query_request(plan, projection.as_deref())?;
                    request.limit = limit;
                    request.exclusive_start_key = start.take();
                    self.call(meta, plan.index.as_deref(), |s| s.query(&request), |p: &Page| p.consumed)?
                }
                _ => {
                    let mut request = scan_request(plan, projection.as_deref())?;
                    request.limit = limit;
                    request.exclusive_start_key = start.take();
                    self.call(meta, plan.index.as_deref(), |s| s.scan(&request), |p: &Page| p.consumed)?
                }
            };
            pages += 1;
            output.scanned_count += page.scanned_count;

            debug!(
                table = %plan.table,
                index = plan.index_label(),
                page = pages,
                items = page.items.len(),
                scanned = page.scanned_count,
                more = page.last_evaluated_key.is_some(),
                "fetched page"
            );

            if count_only {
                output.count += page.count;
            } else {
                let mut items = page.items;
                if plan.hydrate {
                    items = self.hydrate(meta, plan, items)?;
                }
                if let Some(filter) = &plan.client_filter {
                    items = filter_items(filter, items)?;
                }
                output.count += items.len();
                output.items.extend(items);
            }

            start = page.last_evaluated_key;
            if start.is_none() {
                break;
            }
            // An off-index ORDER BY sorts only what was read up to LIMIT
            if !plan.count {
                if let Some(limit) = plan.limit {
                    if output.items.len() >= limit {
                        break;
                    }
                }
            }
            if let Some(scan_limit) = plan.scan_limit {
                if output.scanned_count >= scan_limit {
                    break;
                }
            }
        }
        Ok(output)
    }

    /// Fetches full items for the keys an index pass returned.
    fn hydrate(&mut self, meta: &TableMeta, plan: &Plan, items: Vec<Item>) -> Result<Vec<Item>> {
        if items.is_empty() {
            return Ok(items);
        }
        let keys = items
            .iter()
            .map(|item| meta.primary_key(item))
            .collect::<Result<Vec<_>>>()?;
        debug!(table = %meta.name, keys = keys.len(), "hydrating index results");
        self.batch_get(meta, &keys, plan.fetch.as_deref(), plan.consistent)
    }
}

/// Whether the store can count without returning items
fn counts_on_store(plan: &Plan) -> bool {
    plan.count && !plan.hydrate && plan.client_filter.is_none()
}

/// Projection of the query or scan pass. A hydrating pass only needs the
/// primary key.
pub fn first_pass_projection(meta: &TableMeta, plan: &Plan) -> Option<Vec<Path>> {
    if plan.hydrate {
        Some(
            meta.primary_key_attributes()
                .into_iter()
                .map(Path::attribute)
                .collect(),
        )
    } else if counts_on_store(plan) {
        None
    } else {
        plan.fetch.clone()
    }
}

/// Items the store may examine on the next page.
fn page_limit(config: &EngineConfig, plan: &Plan, scanned: usize, returned: usize) -> Option<usize> {
    let mut limit = config.page_size;
    let mut cap = |n: usize| {
        limit = Some(limit.map_or(n, |l| l.min(n)));
    };
    if let Some(scan_limit) = plan.scan_limit {
        cap(scan_limit.saturating_sub(scanned).max(1));
    }
    let unfiltered = plan.filter.is_none() && plan.client_filter.is_none();
    if let (Some(max), true, false) = (plan.limit, unfiltered, plan.count) {
        cap(max.saturating_sub(returned).max(1));
    }
    limit
}

/// Builds the query request for a plan, without paging fields.
pub fn query_request(plan: &Plan, projection: Option<&[Path]>) -> Result<QueryRequest> {
    let key = plan
        .key_condition
        .as_ref()
        .ok_or_else(|| Error::Internal(format!("query plan on '{}' has no key condition", plan.table)))?;
    let mut builder = ExpressionBuilder::new();
    let key_condition = builder.key_condition(key)?;
    let filter = plan.filter.as_ref().map(|f| builder.condition(f)).transpose()?;
    let projection = projection.map(|paths| builder.projection(paths));
    Ok(QueryRequest {
        table: plan.table.clone(),
        index: plan.index.clone(),
        key_condition,
        filter,
        projection,
        context: builder.finish(),
        count: counts_on_store(plan),
        ascending: plan.ascending,
        limit: None,
        consistent: plan.consistent,
        exclusive_start_key: None,
    })
}

pub fn scan_request(plan: &Plan, projection: Option<&[Path]>) -> Result<ScanRequest> {
    let mut builder = ExpressionBuilder::new();
    let filter = plan.filter.as_ref().map(|f| builder.condition(f)).transpose()?;
    let projection = projection.map(|paths| builder.projection(paths));
    Ok(ScanRequest {
        table: plan.table.clone(),
        index: plan.index.clone(),
        filter,
        projection,
        context: builder.finish(),
        count: counts_on_store(plan),
        limit: None,
        consistent: plan.consistent,
        exclusive_start_key: None,
    })
}

fn filter_items(filter: &Predicate, items: Vec<Item>) -> Result<Vec<Item>> {
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        if matches(filter, &item)? {
            kept.push(item);
        }
    }
    Ok(kept)
}

/// Sorts, truncates and projects collected items.
fn finish(plan: &Plan, output: &mut ReadOutput) {
    if let Some(sort) = &plan.sort {
        output.items.sort_by(|a, b| {
            let ordering = match (lookup(a, &sort.attribute), lookup(b, &sort.attribute)) {
                (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
                // Items without the attribute go last either way
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if sort.ascending {
                ordering
            } else {
                ordering.reverse()
            }
        });
    }

    if plan.count {
        output.items.clear();
        return;
    }
    if let Some(limit) = plan.limit {
        output.items.truncate(limit);
    }
    output.count = output.items.len();

    // Drop attributes fetched only for sorting, filtering or key matching
    if let Some(attributes) = &plan.attributes {
        let needs_strip = plan.hydrate || plan.fetch.as_ref() != Some(attributes);
        if needs_strip {
            for item in &mut output.items {
                item.retain(|name, _| attributes.iter().any(|p| p.root() == name));
            }
        }
    }
}
