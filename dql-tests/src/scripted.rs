/// Scripted store
///
/// Replays canned responses in order and records every request, for tests
/// that assert on exactly which calls the engine makes.

use dql_api::store::{
    BatchGetRequest, BatchGetResponse, BatchWriteRequest, BatchWriteResponse, Page, QueryRequest, ScanRequest,
    Store, UpdateItemRequest, UpdateItemResponse, UpdateTableRequest,
};
use dql_core::schema::TableMeta;
use dql_core::throttle::Capacity;
use dql_core::{Error, Item, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A request the scripted store received
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedCall {
    Describe(String),
    Query(QueryRequest),
    Scan(ScanRequest),
    BatchGet(BatchGetRequest),
    BatchWrite(BatchWriteRequest),
    Put(Item),
    Delete(Item),
    Update(UpdateItemRequest),
}

#[derive(Debug)]
pub struct ScriptedStore {
    meta: TableMeta,
    pages: Mutex<VecDeque<Result<Page>>>,
    batch_gets: Mutex<VecDeque<Result<BatchGetResponse>>>,
    batch_writes: Mutex<VecDeque<Result<BatchWriteResponse>>>,
    calls: Mutex<Vec<ScriptedCall>>,
}

impl ScriptedStore {
    pub fn new(meta: TableMeta) -> Self {
        Self {
            meta,
            pages: Mutex::new(VecDeque::new()),
            batch_gets: Mutex::new(VecDeque::new()),
            batch_writes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queues the result of the next query or scan.
    pub fn push_page(&self, page: Result<Page>) -> &Self {
        self.pages.lock().push_back(page);
        self
    }

    pub fn push_batch_get(&self, response: Result<BatchGetResponse>) -> &Self {
        self.batch_gets.lock().push_back(response);
        self
    }

    pub fn push_batch_write(&self, response: Result<BatchWriteResponse>) -> &Self {
        self.batch_writes.lock().push_back(response);
        self
    }

    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    /// Read requests (queries and scans) received so far
    pub fn page_requests(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, ScriptedCall::Query(_) | ScriptedCall::Scan(_)))
            .count()
    }

    pub fn remaining_pages(&self) -> usize {
        self.pages.lock().len()
    }

    fn record(&self, call: ScriptedCall) {
        self.calls.lock().push(call);
    }

    fn next<T>(queue: &Mutex<VecDeque<Result<T>>>, what: &str) -> Result<T> {
        queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Internal(format!("no scripted {} left", what))))
    }
}

impl Store for ScriptedStore {
    fn describe_table(&self, table: &str) -> Result<TableMeta> {
        self.record(ScriptedCall::Describe(table.to_string()));
        if table == self.meta.name {
            Ok(self.meta.clone())
        } else {
            Err(Error::NotFound(format!("table '{}'", table)))
        }
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        Ok(vec![self.meta.name.clone()])
    }

    fn query(&self, request: &QueryRequest) -> Result<Page> {
        self.record(ScriptedCall::Query(request.clone()));
        Self::next(&self.pages, "page")
    }

    fn scan(&self, request: &ScanRequest) -> Result<Page> {
        self.record(ScriptedCall::Scan(request.clone()));
        Self::next(&self.pages, "page")
    }

    fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse> {
        self.record(ScriptedCall::BatchGet(request.clone()));
        Self::next(&self.batch_gets, "batch get")
    }

    fn batch_write(&self, request: &BatchWriteRequest) -> Result<BatchWriteResponse> {
        self.record(ScriptedCall::BatchWrite(request.clone()));
        Self::next(&self.batch_writes, "batch write")
    }

    fn put_item(&self, _table: &str, item: &Item) -> Result<Capacity> {
        self.record(ScriptedCall::Put(item.clone()));
        Ok(Capacity::write(1.0))
    }

    fn delete_item(&self, _table: &str, key: &Item) -> Result<Capacity> {
        self.record(ScriptedCall::Delete(key.clone()));
        Ok(Capacity::write(1.0))
    }

    fn update_item(&self, request: &UpdateItemRequest) -> Result<UpdateItemResponse> {
        self.record(ScriptedCall::Update(request.clone()));
        Ok(UpdateItemResponse {
            attributes: None,
            consumed: Capacity::write(1.0),
        })
    }

    fn create_table(&self, _meta: &TableMeta) -> Result<()> {
        Err(Error::Unsupported("scripted store has a fixed schema".into()))
    }

    fn delete_table(&self, _table: &str) -> Result<()> {
        Err(Error::Unsupported("scripted store has a fixed schema".into()))
    }

    fn update_table(&self, _request: &UpdateTableRequest) -> Result<()> {
        Err(Error::Unsupported("scripted store has a fixed schema".into()))
    }
}
