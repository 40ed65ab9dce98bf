/// In-memory store
///
/// A functional `Store` that keeps tables in memory. It reads back the
/// placeholder expressions the engine sends, resolves them against their
/// bindings and evaluates them, so tests exercise the full
/// translate-then-evaluate path. Index queries only see attributes the
/// index projects, and a page size can be forced to exercise pagination.

use dql_api::batch::key_id;
use dql_api::store::{
    BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, IndexUpdate, Page, QueryRequest,
    ScanRequest, Store, UpdateItemRequest, UpdateItemResponse, UpdateTableRequest, WriteRequest,
};
use dql_api::CONDITIONAL_CHECK_FAILED;
use dql_core::config::{MAX_BATCH_GET, MAX_BATCH_WRITE};
use dql_core::eval::{apply_update, lookup, matches};
use dql_core::expression::ExpressionContext;
use dql_core::lang::{DqlParser, Path, Returns, UpdateAction};
use dql_core::schema::{QueryIndex, TableMeta};
use dql_core::throttle::Capacity;
use dql_core::{Error, Item, Result};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet, VecDeque};

#[derive(Debug, Clone)]
struct MemoryTable {
    meta: TableMeta,
    /// Insertion order; scans follow it
    items: Vec<Item>,
}

impl MemoryTable {
    fn position(&self, key: &Item) -> Option<usize> {
        let id = key_id(&self.meta, key);
        self.items.iter().position(|item| key_id(&self.meta, item) == id)
    }

    fn put(&mut self, item: Item) {
        match self.position(&item) {
            Some(pos) => self.items[pos] = item,
            None => self.items.push(item),
        }
    }

    fn remove(&mut self, key: &Item) -> Option<Item> {
        self.position(key).map(|pos| self.items.remove(pos))
    }
}

/// Functional in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, MemoryTable>>,
    page_size: Option<usize>,
    /// Keys beyond this many per batch get come back unprocessed
    batch_get_capacity: Option<usize>,
    failures: Mutex<VecDeque<Error>>,
    calls: Mutex<Vec<&'static str>>,
    queries: Mutex<Vec<QueryRequest>>,
    scans: Mutex<Vec<ScanRequest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every query and scan page at `size` examined items.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Leaves keys past `capacity` unprocessed in every batch get.
    pub fn with_batch_get_capacity(mut self, capacity: usize) -> Self {
        self.batch_get_capacity = Some(capacity);
        self
    }

    pub fn with_table(self, meta: TableMeta) -> Self {
        self.tables.write().insert(
            meta.name.clone(),
            MemoryTable {
                meta,
                items: Vec::new(),
            },
        );
        self
    }

    /// Stores items directly, bypassing the engine.
    pub fn seed(&self, table: &str, items: impl IntoIterator<Item = Item>) {
        let mut tables = self.tables.write();
        if let Some(t) = tables.get_mut(table) {
            for item in items {
                t.put(item);
            }
        }
    }

    /// Makes the next call fail with `error`. Queued failures are returned
    /// in order, one per call.
    pub fn fail_next(&self, error: Error) {
        self.failures.lock().push_back(error);
    }

    pub fn items(&self, table: &str) -> Vec<Item> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.items.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, table: &str, key: &Item) -> Option<Item> {
        let tables = self.tables.read();
        let t = tables.get(table)?;
        t.position(key).map(|pos| t.items[pos].clone())
    }

    /// Names of the operations called so far, in order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| **c == operation).count()
    }

    pub fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().clone()
    }

    pub fn scans(&self) -> Vec<ScanRequest> {
        self.scans.lock().clone()
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().push(operation);
        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn table<T>(&self, name: &str, f: impl FnOnce(&MemoryTable) -> Result<T>) -> Result<T> {
        let tables = self.tables.read();
        let table = tables
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("table '{}'", name)))?;
        f(table)
    }

    fn table_mut<T>(&self, name: &str, f: impl FnOnce(&mut MemoryTable) -> Result<T>) -> Result<T> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("table '{}'", name)))?;
        f(table)
    }

    /// Reads one page of `candidates` (already in result order).
    fn page(
        &self,
        table: &MemoryTable,
        index: &QueryIndex,
        candidates: Vec<&Item>,
        read: &PageRead<'_>,
    ) -> Result<Page> {
        let meta = &table.meta;
        let start = match read.start {
            Some(start) => {
                let id = key_id(meta, start);
                candidates
                    .iter()
                    .position(|item| key_id(meta, item) == id)
                    .map_or(0, |pos| pos + 1)
            }
            None => 0,
        };
        let limit = match (read.limit, self.page_size) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b).unwrap_or(usize::MAX),
        };
        let end = start.saturating_add(limit).min(candidates.len());
        let examined = &candidates[start..end];

        let filter = read
            .filter
            .map(|f| DqlParser::parse_condition(f)?.resolve(read.context))
            .transpose()?;
        let projection = read
            .projection
            .map(|p| resolve_projection(p, read.context))
            .transpose()?;

        let mut items = Vec::new();
        for item in examined {
            let visible = index_view(meta, index, item);
            if let Some(filter) = &filter {
                if !matches(filter, &visible)? {
                    continue;
                }
            }
            items.push(match &projection {
                Some(roots) => project(&visible, roots),
                None => visible,
            });
        }

        let count = items.len();
        let last_evaluated_key = if end < candidates.len() {
            examined.last().map(|item| index_key(meta, index, item))
        } else {
            None
        };
        Ok(Page {
            items: if read.count { Vec::new() } else { items },
            count,
            scanned_count: examined.len(),
            last_evaluated_key,
            consumed: Capacity::read(examined.len().max(1) as f64),
        })
    }
}

struct PageRead<'a> {
    filter: Option<&'a str>,
    projection: Option<&'a str>,
    context: &'a ExpressionContext,
    count: bool,
    limit: Option<usize>,
    start: Option<&'a Item>,
}

fn resolve_projection(text: &str, context: &ExpressionContext) -> Result<HashSet<String>> {
    DqlParser::parse_projection(text)?
        .iter()
        .map(|p| p.resolve(context).map(|p| p.root().to_string()))
        .collect()
}

fn project(item: &Item, roots: &HashSet<String>) -> Item {
    item.iter()
        .filter(|(name, _)| roots.contains(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// The item as the index stores it
fn index_view(meta: &TableMeta, index: &QueryIndex, item: &Item) -> Item {
    item.iter()
        .filter(|(name, _)| index.projects(name, meta))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Continuation key: the table key plus the index key
fn index_key(meta: &TableMeta, index: &QueryIndex, item: &Item) -> Item {
    let mut attrs: Vec<&str> = meta.primary_key_attributes();
    attrs.push(&index.hash_key.name);
    if let Some(range) = &index.range_key {
        attrs.push(&range.name);
    }
    attrs
        .into_iter()
        .filter_map(|a| item.get(a).map(|v| (a.to_string(), v.clone())))
        .collect()
}

fn resolve_index(meta: &TableMeta, name: Option<&str>) -> Result<QueryIndex> {
    match name {
        None => meta
            .query_indexes()
            .into_iter()
            .next()
            .ok_or_else(|| Error::Internal("table without primary key".into())),
        Some(name) => meta.index(name).ok_or_else(|| {
            Error::remote(
                "ValidationException",
                format!("index '{}' not found on table '{}'", name, meta.name),
            )
        }),
    }
}

/// Items present in the index: those carrying all of its key attributes
fn indexed<'a>(table: &'a MemoryTable, index: &QueryIndex) -> impl Iterator<Item = &'a Item> {
    let hash = index.hash_key.name.clone();
    let range = index.range_key.as_ref().map(|k| k.name.clone());
    table.items.iter().filter(move |item| {
        item.contains_key(&hash) && range.as_ref().map_or(true, |r| item.contains_key(r))
    })
}

fn updated_roots(actions: &[UpdateAction]) -> HashSet<String> {
    actions
        .iter()
        .map(|action| match action {
            UpdateAction::Set(path, _)
            | UpdateAction::Remove(path)
            | UpdateAction::Add(path, _)
            | UpdateAction::Delete(path, _) => path.root().to_string(),
        })
        .collect()
}

impl Store for MemoryStore {
    fn describe_table(&self, table: &str) -> Result<TableMeta> {
        self.enter("describe_table")?;
        self.table(table, |t| Ok(t.meta.clone()))
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        self.enter("list_tables")?;
        Ok(self.tables.read().keys().cloned().collect())
    }

    fn query(&self, request: &QueryRequest) -> Result<Page> {
        self.enter("query")?;
        self.queries.lock().push(request.clone());
        self.table(&request.table, |table| {
            let meta = &table.meta;
            let index = resolve_index(meta, request.index.as_deref())?;
            if request.consistent && index.is_global() {
                return Err(Error::remote(
                    "ValidationException",
                    "consistent reads are not supported on global secondary indexes",
                ));
            }
            let key = DqlParser::parse_condition(&request.key_condition)?.resolve(&request.context)?;

            let mut candidates = Vec::new();
            for item in indexed(table, &index) {
                if matches(&key, item)? {
                    candidates.push(item);
                }
            }
            if let Some(range) = &index.range_key {
                let range = Path::attribute(range.name.as_str());
                candidates.sort_by(|a, b| {
                    match (lookup(a, &range), lookup(b, &range)) {
                        (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
                        _ => Ordering::Equal,
                    }
                });
            }
            if !request.ascending {
                candidates.reverse();
            }

            self.page(
                table,
                &index,
                candidates,
                &PageRead {
                    filter: request.filter.as_deref(),
                    projection: request.projection.as_deref(),
                    context: &request.context,
                    count: request.count,
                    limit: request.limit,
                    start: request.exclusive_start_key.as_ref(),
                },
            )
        })
    }

    fn scan(&self, request: &ScanRequest) -> Result<Page> {
        self.enter("scan")?;
        self.scans.lock().push(request.clone());
        self.table(&request.table, |table| {
            let index = resolve_index(&table.meta, request.index.as_deref())?;
            let candidates: Vec<&Item> = indexed(table, &index).collect();
            self.page(
                table,
                &index,
                candidates,
                &PageRead {
                    filter: request.filter.as_deref(),
                    projection: request.projection.as_deref(),
                    context: &request.context,
                    count: request.count,
                    limit: request.limit,
                    start: request.exclusive_start_key.as_ref(),
                },
            )
        })
    }

    fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse> {
        self.enter("batch_get")?;
        if request.keys.len() > MAX_BATCH_GET {
            return Err(Error::remote(
                "ValidationException",
                format!("too many keys in batch get: {}", request.keys.len()),
            ));
        }
        let mut seen = HashSet::new();
        self.table(&request.table, |table| {
            let projection = request
                .projection
                .as_deref()
                .map(|p| resolve_projection(p, &request.context))
                .transpose()?;
            let served = self.batch_get_capacity.unwrap_or(usize::MAX).min(request.keys.len());
            let (keys, unprocessed) = request.keys.split_at(served);

            let mut items = Vec::new();
            for key in keys {
                if !seen.insert(key_id(&table.meta, key)) {
                    return Err(Error::remote("ValidationException", "duplicate key in batch get"));
                }
                if let Some(pos) = table.position(key) {
                    let item = &table.items[pos];
                    items.push(match &projection {
                        Some(roots) => project(item, roots),
                        None => item.clone(),
                    });
                }
            }
            Ok(BatchGetResponse {
                consumed: Capacity::read(keys.len().max(1) as f64),
                items,
                unprocessed_keys: unprocessed.to_vec(),
            })
        })
    }

    fn batch_write(&self, request: &BatchWriteRequest) -> Result<BatchWriteResponse> {
        self.enter("batch_write")?;
        if request.requests.len() > MAX_BATCH_WRITE {
            return Err(Error::remote(
                "ValidationException",
                format!("too many writes in batch: {}", request.requests.len()),
            ));
        }
        self.table_mut(&request.table, |table| {
            for write in &request.requests {
                match write {
                    WriteRequest::Put(item) => {
                        table.meta.primary_key(item)?;
                        table.put(item.clone());
                    }
                    WriteRequest::Delete(key) => {
                        table.remove(key);
                    }
                }
            }
            Ok(BatchWriteResponse {
                unprocessed: Vec::new(),
                consumed: Capacity::write(request.requests.len() as f64),
            })
        })
    }

    fn put_item(&self, table: &str, item: &Item) -> Result<Capacity> {
        self.enter("put_item")?;
        self.table_mut(table, |t| {
            t.meta.primary_key(item)?;
            t.put(item.clone());
            Ok(Capacity::write(1.0))
        })
    }

    fn delete_item(&self, table: &str, key: &Item) -> Result<Capacity> {
        self.enter("delete_item")?;
        self.table_mut(table, |t| {
            t.remove(key);
            Ok(Capacity::write(1.0))
        })
    }

    fn update_item(&self, request: &UpdateItemRequest) -> Result<UpdateItemResponse> {
        self.enter("update_item")?;
        self.table_mut(&request.table, |table| {
            let key = table.meta.primary_key(&request.key)?;
            let old = table.position(&key).map(|pos| table.items[pos].clone());

            if let Some(condition) = &request.condition {
                let condition = DqlParser::parse_condition(condition)?.resolve(&request.context)?;
                let current = old.clone().unwrap_or_default();
                if !matches(&condition, &current)? {
                    return Err(Error::remote(CONDITIONAL_CHECK_FAILED, "the conditional request failed"));
                }
            }

            let actions = DqlParser::parse_update_expression(&request.update_expression)?
                .iter()
                .map(|a| a.resolve(&request.context))
                .collect::<Result<Vec<_>>>()?;
            let base = old.clone().unwrap_or_else(|| key.clone());
            let new = apply_update(&base, &actions)?;
            table.put(new.clone());

            let roots = updated_roots(&actions);
            let attributes = match request.returns {
                Returns::None => None,
                Returns::AllOld => old,
                Returns::AllNew => Some(new),
                Returns::UpdatedOld => old.map(|o| project(&o, &roots)),
                Returns::UpdatedNew => Some(project(&new, &roots)),
            };
            Ok(UpdateItemResponse {
                attributes,
                consumed: Capacity::write(1.0),
            })
        })
    }

    fn create_table(&self, meta: &TableMeta) -> Result<()> {
        self.enter("create_table")?;
        let mut tables = self.tables.write();
        if tables.contains_key(&meta.name) {
            return Err(Error::AlreadyExists(format!("table '{}'", meta.name)));
        }
        tables.insert(
            meta.name.clone(),
            MemoryTable {
                meta: meta.clone(),
                items: Vec::new(),
            },
        );
        Ok(())
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        self.enter("delete_table")?;
        self.tables
            .write()
            .remove(table)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("table '{}'", table)))
    }

    fn update_table(&self, request: &UpdateTableRequest) -> Result<()> {
        self.enter("update_table")?;
        self.table_mut(&request.table, |table| {
            let meta = &mut table.meta;
            if let Some(throughput) = request.throughput {
                meta.throughput = throughput;
            }
            for update in &request.index_updates {
                match update {
                    IndexUpdate::Create(index) => meta.global_indexes.push(index.clone()),
                    IndexUpdate::Update { name, throughput } => {
                        let index = meta
                            .global_indexes
                            .iter_mut()
                            .find(|i| &i.name == name)
                            .ok_or_else(|| Error::NotFound(format!("index '{}'", name)))?;
                        index.throughput = *throughput;
                    }
                    IndexUpdate::Delete(name) => meta.global_indexes.retain(|i| &i.name != name),
                }
            }
            Ok(())
        })
    }
}
