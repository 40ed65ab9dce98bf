/// Engine facade: parse, plan and execute DQL statements against a store
///
/// The engine owns the pieces shared across statements (the metadata cache,
/// the throttle controller and the interrupt flag) and builds a fresh plan
/// and executor for each statement.

use crate::executor::{Executor, Usage};
use crate::explain;
use crate::store::{IndexUpdate, Store, UpdateTableRequest};
use dql_core::cache::MetadataCache;
use dql_core::config::EngineConfig;
use dql_core::lang::{
    AlterAction, AlterTableStatement, CreateTableStatement, DqlParser, DropTableStatement, LoadStatement,
    SelectStatement, Statement,
};
use dql_core::planner::{Plan, Planner, PlannerOptions};
use dql_core::retry::retry_with_policy;
use dql_core::schema::{TableMeta, Throughput};
use dql_core::throttle::{Ceiling, ThrottleConfig, ThrottleController};
use dql_core::{Error, Item, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Decodes the file of a `LOAD` statement into items
pub type Loader = Box<dyn Fn(&str) -> Result<Vec<Item>> + Send + Sync>;

/// What a statement produced
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// SELECT and SCAN
    Items(Vec<Item>),
    /// COUNT and `SELECT COUNT(*)`
    Count { count: usize, scanned_count: usize },
    /// INSERT, UPDATE, DELETE and LOAD; `items` holds UPDATE ... RETURNS attributes
    Written { count: usize, items: Vec<Item> },
    /// EXPLAIN and DUMP SCHEMA
    Lines(Vec<String>),
    /// ANALYZE
    Capacity(Usage),
    /// DDL
    Done(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteStatementResponse {
    /// Statement keyword
    pub statement: &'static str,
    pub output: Output,
    /// Capacity consumed per (table, index)
    pub consumed: Usage,
}

impl ExecuteStatementResponse {
    fn new(statement: &'static str, output: Output) -> Self {
        Self {
            statement,
            output,
            consumed: Usage::new(),
        }
    }

    fn with_consumed(mut self, consumed: Usage) -> Self {
        self.consumed = consumed;
        self
    }

    /// Returned items, empty for outputs without items
    pub fn items(&self) -> &[Item] {
        match &self.output {
            Output::Items(items) | Output::Written { items, .. } => items,
            _ => &[],
        }
    }
}

pub struct Engine<S: Store> {
    store: S,
    config: EngineConfig,
    cache: MetadataCache,
    throttle: ThrottleController,
    interrupt: Arc<AtomicBool>,
    loader: Option<Loader>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: EngineConfig::default(),
            cache: MetadataCache::new(),
            throttle: ThrottleController::default(),
            interrupt: Arc::new(AtomicBool::new(false)),
            loader: None,
        }
    }

    /// Creates an engine with a validated configuration.
    pub fn with_config(store: S, config: EngineConfig) -> Result<Self> {
        config.validate().map_err(Error::InvalidArgument)?;
        Ok(Self {
            config,
            ..Self::new(store)
        })
    }

    /// Starts from persisted throttle settings.
    pub fn with_throttle(mut self, config: ThrottleConfig) -> Self {
        self.throttle = ThrottleController::new(config);
        self
    }

    /// Installs the decoder `LOAD` statements read files with.
    pub fn with_loader<F>(mut self, loader: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<Item>> + Send + Sync + 'static,
    {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &MetadataCache {
        &self.cache
    }

    /// Throttle settings; mutate them with `throttle().update(..)`.
    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    /// Flag that stops the running statement before its next store call.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    fn executor<'a>(&'a self, clause: Option<&'a Ceiling>) -> Executor<'a> {
        Executor::new(&self.store, &self.throttle, &self.config, &self.interrupt).with_throttle_clause(clause)
    }

    /// A retried store call outside the executor, for metadata and DDL.
    fn store_call<T>(&self, mut op: impl FnMut(&S) -> Result<T>) -> Result<T> {
        if self.interrupt.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        retry_with_policy(&self.config.retry, || op(&self.store))
    }

    /// Table metadata, from the cache or the store.
    pub fn describe(&self, table: &str) -> Result<Arc<TableMeta>> {
        self.cache
            .get_or_fetch(table, |name| self.store_call(|s| s.describe_table(name)))
    }

    /// Runs every statement in `text` in order and returns the result of the
    /// last one.
    pub fn execute(&self, text: &str) -> Result<ExecuteStatementResponse> {
        self.execute_all(text)?
            .pop()
            .ok_or_else(|| Error::syntax(0, "empty statement"))
    }

    pub fn execute_all(&self, text: &str) -> Result<Vec<ExecuteStatementResponse>> {
        let statements = DqlParser::parse(text)?;
        statements
            .iter()
            .map(|stmt| self.execute_statement(stmt))
            .collect()
    }

    /// Plans a statement without executing it.
    pub fn plan(&self, statement: &Statement) -> Result<Plan> {
        let table = statement
            .table()
            .ok_or_else(|| Error::InvalidQuery(format!("{} statements have no read plan", statement.kind())))?;
        let meta = self.describe(table)?;
        Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)
    }

    pub fn execute_statement(&self, statement: &Statement) -> Result<ExecuteStatementResponse> {
        self.interrupt.store(false, Ordering::SeqCst);
        debug!(statement = statement.kind(), table = statement.table().unwrap_or(""), "executing");
        self.run(statement)
    }

    fn run(&self, statement: &Statement) -> Result<ExecuteStatementResponse> {
        let kind = statement.kind();
        match statement {
            Statement::Select(stmt) | Statement::Scan(stmt) | Statement::Count(stmt) => {
                self.read(statement, stmt)
            }
            Statement::Insert(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let mut executor = self.executor(stmt.throttle.as_ref());
                let count = executor.insert(&meta, stmt.items.clone())?;
                Ok(ExecuteStatementResponse::new(kind, Output::Written { count, items: Vec::new() })
                    .with_consumed(executor.into_usage()))
            }
            Statement::Update(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
                let mut executor = self.executor(stmt.throttle.as_ref());
                let keys = executor.read_primary_keys(&meta, &plan)?;
                let output = executor.update_keys(&meta, keys, &stmt.actions, stmt.returns)?;
                info!(table = %meta.name, updated = output.updated, "update complete");
                Ok(ExecuteStatementResponse::new(
                    kind,
                    Output::Written {
                        count: output.updated,
                        items: output.items,
                    },
                )
                .with_consumed(executor.into_usage()))
            }
            Statement::Delete(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
                let mut executor = self.executor(stmt.throttle.as_ref());
                let keys = executor.read_primary_keys(&meta, &plan)?;
                let count = executor.delete_keys(&meta, keys)?;
                info!(table = %meta.name, deleted = count, "delete complete");
                Ok(ExecuteStatementResponse::new(kind, Output::Written { count, items: Vec::new() })
                    .with_consumed(executor.into_usage()))
            }
            Statement::Create(stmt) => self.create(stmt).map(|o| ExecuteStatementResponse::new(kind, o)),
            Statement::Alter(stmt) => self.alter(stmt).map(|o| ExecuteStatementResponse::new(kind, o)),
            Statement::Drop(stmt) => self.drop_table(stmt).map(|o| ExecuteStatementResponse::new(kind, o)),
            Statement::Dump(tables) => {
                let lines = self.dump(tables)?;
                Ok(ExecuteStatementResponse::new(kind, Output::Lines(lines)))
            }
            Statement::Load(stmt) => self.load(stmt),
            Statement::Explain(inner) => {
                let lines = self.explain(inner)?;
                Ok(ExecuteStatementResponse::new(kind, Output::Lines(lines)))
            }
            Statement::Analyze(inner) => {
                let response = self.run(inner)?;
                Ok(ExecuteStatementResponse::new(kind, Output::Capacity(response.consumed.clone()))
                    .with_consumed(response.consumed))
            }
        }
    }

    fn read(&self, statement: &Statement, stmt: &SelectStatement) -> Result<ExecuteStatementResponse> {
        let meta = self.describe(&stmt.table)?;
        let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
        let mut executor = self.executor(stmt.throttle.as_ref());
        let output = executor.read(&meta, &plan)?;
        let result = if plan.count {
            Output::Count {
                count: output.count,
                scanned_count: output.scanned_count,
            }
        } else {
            Output::Items(output.items)
        };
        Ok(ExecuteStatementResponse::new(statement.kind(), result).with_consumed(executor.into_usage()))
    }

    /// Writes already-decoded items through throttled batch writes.
    pub fn load_items(&self, table: &str, items: Vec<Item>, throttle: Option<&Ceiling>) -> Result<usize> {
        self.interrupt.store(false, Ordering::SeqCst);
        let meta = self.describe(table)?;
        for item in &items {
            meta.primary_key(item)?;
        }
        let requests = items.into_iter().map(crate::store::WriteRequest::Put).collect();
        let count = self.executor(throttle).batch_write(&meta, requests)?;
        info!(table, items = count, "load complete");
        Ok(count)
    }

    fn load(&self, stmt: &LoadStatement) -> Result<ExecuteStatementResponse> {
        let loader = self.loader.as_ref().ok_or_else(|| {
            Error::Unsupported(format!("no loader installed to read '{}'", stmt.file))
        })?;
        let items = loader(&stmt.file)?;
        let meta = self.describe(&stmt.table)?;
        for item in &items {
            meta.primary_key(item)?;
        }
        let mut executor = self.executor(stmt.throttle.as_ref());
        let requests = items.into_iter().map(crate::store::WriteRequest::Put).collect();
        let count = executor.batch_write(&meta, requests)?;
        Ok(ExecuteStatementResponse::new("LOAD", Output::Written { count, items: Vec::new() })
            .with_consumed(executor.into_usage()))
    }

    fn create(&self, stmt: &CreateTableStatement) -> Result<Output> {
        stmt.table.validate()?;
        match self.store_call(|s| s.create_table(&stmt.table)) {
            Err(Error::AlreadyExists(_)) if stmt.if_not_exists => {
                return Ok(Output::Done(format!("table '{}' already exists", stmt.table.name)))
            }
            result => result?,
        }
        self.cache.invalidate(&stmt.table.name);
        info!(table = %stmt.table.name, "created table");
        Ok(Output::Done(format!("created table '{}'", stmt.table.name)))
    }

    fn drop_table(&self, stmt: &DropTableStatement) -> Result<Output> {
        match self.store_call(|s| s.delete_table(&stmt.table)) {
            Err(Error::NotFound(_)) if stmt.if_exists => {
                return Ok(Output::Done(format!("table '{}' does not exist", stmt.table)))
            }
            result => result?,
        }
        self.cache.invalidate(&stmt.table);
        info!(table = %stmt.table, "dropped table");
        Ok(Output::Done(format!("dropped table '{}'", stmt.table)))
    }

    fn alter(&self, stmt: &AlterTableStatement) -> Result<Output> {
        // Alter against fresh metadata
        self.cache.invalidate(&stmt.table);
        let meta = self.describe(&stmt.table)?;
        let mut request = UpdateTableRequest {
            table: meta.name.clone(),
            ..Default::default()
        };

        match &stmt.action {
            AlterAction::SetThroughput { index: None, read, write } => {
                let current = meta.throughput;
                request.throughput = Some(Throughput::new(
                    read.unwrap_or(current.read),
                    write.unwrap_or(current.write),
                ));
            }
            AlterAction::SetThroughput {
                index: Some(name),
                read,
                write,
            } => {
                let current = match meta.global_index(name) {
                    Some(gsi) => gsi.throughput,
                    None if meta.local_indexes.iter().any(|l| &l.name == name) => {
                        return Err(Error::InvalidArgument(format!(
                            "local index '{}' shares the throughput of table '{}'",
                            name, meta.name
                        )))
                    }
                    None => {
                        return Err(Error::IndexNotFound {
                            table: meta.name.clone(),
                            index: name.clone(),
                        })
                    }
                };
                request.index_updates.push(IndexUpdate::Update {
                    name: name.clone(),
                    throughput: Throughput::new(
                        read.unwrap_or(current.read),
                        write.unwrap_or(current.write),
                    ),
                });
            }
            AlterAction::CreateIndex(index) => {
                if meta.index(&index.name).is_some() {
                    return Err(Error::AlreadyExists(format!(
                        "index '{}' on table '{}'",
                        index.name, meta.name
                    )));
                }
                let mut updated = (*meta).clone();
                updated.global_indexes.push(index.clone());
                updated.validate()?;
                request.index_updates.push(IndexUpdate::Create(index.clone()));
            }
            AlterAction::DropIndex { name, if_exists } => {
                if meta.global_index(name).is_none() {
                    if *if_exists {
                        return Ok(Output::Done(format!("index '{}' does not exist", name)));
                    }
                    return Err(Error::IndexNotFound {
                        table: meta.name.clone(),
                        index: name.clone(),
                    });
                }
                request.index_updates.push(IndexUpdate::Delete(name.clone()));
            }
        }

        self.store_call(|s| s.update_table(&request))?;
        self.cache.invalidate(&meta.name);
        info!(table = %meta.name, "altered table");
        Ok(Output::Done(format!("altered table '{}'", meta.name)))
    }

    fn dump(&self, tables: &[String]) -> Result<Vec<String>> {
        let tables = if tables.is_empty() {
            let mut all = self.store_call(|s| s.list_tables())?;
            all.sort();
            all
        } else {
            tables.to_vec()
        };
        tables
            .iter()
            .map(|table| self.describe(table).map(|meta| meta.schema()))
            .collect()
    }

    fn explain(&self, statement: &Statement) -> Result<Vec<String>> {
        match statement {
            Statement::Select(stmt) | Statement::Scan(stmt) | Statement::Count(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
                explain::read_lines(&meta, &plan, &self.config)
            }
            Statement::Insert(stmt) => Ok(explain::insert_lines(&stmt.table, stmt.items.len(), &self.config)),
            Statement::Update(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
                let mut lines = explain::read_lines(&meta, &plan, &self.config)?;
                lines.extend(explain::update_lines(&meta, &stmt.actions, stmt.returns)?);
                Ok(lines)
            }
            Statement::Delete(stmt) => {
                let meta = self.describe(&stmt.table)?;
                let plan = Planner::new(&meta, PlannerOptions::from(&self.config)).plan(statement)?;
                let mut lines = explain::read_lines(&meta, &plan, &self.config)?;
                lines.extend(explain::delete_lines(&stmt.table, &self.config));
                Ok(lines)
            }
            Statement::Create(stmt) => Ok(vec![format!("CreateTable(table={})", stmt.table.name)]),
            Statement::Drop(stmt) => Ok(vec![format!("DeleteTable(table={})", stmt.table)]),
            Statement::Alter(stmt) => Ok(vec![format!("UpdateTable(table={})", stmt.table)]),
            Statement::Dump(tables) if tables.is_empty() => {
                Ok(vec!["ListTables()".to_string(), "DescribeTable(table=each)".to_string()])
            }
            Statement::Dump(tables) => Ok(tables
                .iter()
                .map(|t| format!("DescribeTable(table={})", t))
                .collect()),
            Statement::Load(stmt) => Ok(vec![format!(
                "BatchWriteItem(table={}, source='{}', batch_size={})",
                stmt.table, stmt.file, self.config.batch_write_size
            )]),
            Statement::Explain(inner) | Statement::Analyze(inner) => self.explain(inner),
        }
    }
}
