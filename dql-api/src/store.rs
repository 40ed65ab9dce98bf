/// Store abstraction
///
/// The remote operations the engine drives. Expressions arrive in the
/// store-native placeholder form produced by `ExpressionBuilder`, with their
/// bindings in an `ExpressionContext`. Every response reports the capacity
/// the call consumed.

use dql_core::expression::ExpressionContext;
use dql_core::lang::Returns;
use dql_core::schema::{GlobalIndex, TableMeta, Throughput};
use dql_core::throttle::Capacity;
use dql_core::{Item, Result};

/// Query against the table or one of its indexes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub table: String,
    pub index: Option<String>,
    pub key_condition: String,
    pub filter: Option<String>,
    pub projection: Option<String>,
    pub context: ExpressionContext,
    /// Return only the count of matching items
    pub count: bool,
    pub ascending: bool,
    /// Maximum items the store examines for this page
    pub limit: Option<usize>,
    pub consistent: bool,
    pub exclusive_start_key: Option<Item>,
}

/// Full scan of the table or one of its indexes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanRequest {
    pub table: String,
    pub index: Option<String>,
    pub filter: Option<String>,
    pub projection: Option<String>,
    pub context: ExpressionContext,
    pub count: bool,
    pub limit: Option<usize>,
    pub consistent: bool,
    pub exclusive_start_key: Option<Item>,
}

/// One page of a query or scan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Empty for count requests
    pub items: Vec<Item>,
    /// Items matching the filter
    pub count: usize,
    /// Items examined before the filter
    pub scanned_count: usize,
    /// Continuation token; `None` once the result is exhausted
    pub last_evaluated_key: Option<Item>,
    pub consumed: Capacity,
}

impl Page {
    pub fn new(items: Vec<Item>) -> Self {
        let count = items.len();
        Self {
            items,
            count,
            scanned_count: count,
            last_evaluated_key: None,
            consumed: Capacity::default(),
        }
    }

    pub fn with_last_evaluated_key(mut self, key: Item) -> Self {
        self.last_evaluated_key = Some(key);
        self
    }

    pub fn with_scanned_count(mut self, scanned: usize) -> Self {
        self.scanned_count = scanned;
        self
    }

    pub fn with_consumed(mut self, consumed: Capacity) -> Self {
        self.consumed = consumed;
        self
    }
}

/// Batch key lookup on one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetRequest {
    pub table: String,
    pub keys: Vec<Item>,
    pub projection: Option<String>,
    pub context: ExpressionContext,
    pub consistent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetResponse {
    /// Found items, in any order
    pub items: Vec<Item>,
    /// Keys the store did not get to; re-submit them
    pub unprocessed_keys: Vec<Item>,
    pub consumed: Capacity,
}

/// One write of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put(Item),
    /// Delete by primary key
    Delete(Item),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteRequest {
    pub table: String,
    pub requests: Vec<WriteRequest>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteResponse {
    pub unprocessed: Vec<WriteRequest>,
    pub consumed: Capacity,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateItemRequest {
    pub table: String,
    pub key: Item,
    pub update_expression: String,
    /// Guards against creating an item that a concurrent delete removed
    pub condition: Option<String>,
    pub context: ExpressionContext,
    pub returns: Returns,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateItemResponse {
    /// Attributes selected by `returns`
    pub attributes: Option<Item>,
    pub consumed: Capacity,
}

/// Change to one global index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexUpdate {
    Create(GlobalIndex),
    Update { name: String, throughput: Throughput },
    Delete(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateTableRequest {
    pub table: String,
    pub throughput: Option<Throughput>,
    pub index_updates: Vec<IndexUpdate>,
}

/// Remote key-value store
///
/// Implementations report throughput and transient failures as
/// `Error::ThroughputExceeded` / `Error::Transient` so they are retried;
/// any other error is surfaced unchanged.
pub trait Store: Send + Sync {
    /// Fails with `Error::NotFound` for a missing table.
    fn describe_table(&self, table: &str) -> Result<TableMeta>;

    fn list_tables(&self) -> Result<Vec<String>>;

    fn query(&self, request: &QueryRequest) -> Result<Page>;

    fn scan(&self, request: &ScanRequest) -> Result<Page>;

    fn batch_get(&self, request: &BatchGetRequest) -> Result<BatchGetResponse>;

    fn batch_write(&self, request: &BatchWriteRequest) -> Result<BatchWriteResponse>;

    fn put_item(&self, table: &str, item: &Item) -> Result<Capacity>;

    fn delete_item(&self, table: &str, key: &Item) -> Result<Capacity>;

    fn update_item(&self, request: &UpdateItemRequest) -> Result<UpdateItemResponse>;

    /// Fails with `Error::AlreadyExists` when the table exists.
    fn create_table(&self, meta: &TableMeta) -> Result<()>;

    fn delete_table(&self, table: &str) -> Result<()>;

    fn update_table(&self, request: &UpdateTableRequest) -> Result<()>;
}
